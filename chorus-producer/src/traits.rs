// ABOUTME: ContentProducer trait that every drafting backend implements.
// ABOUTME: Defines the DraftRequest handed to producers and the kinds of message they draft.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the draft is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    Opener,
    Invitation,
    Reply,
    SignOff,
}

impl DraftKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DraftKind::Opener => "opener",
            DraftKind::Invitation => "invitation",
            DraftKind::Reply => "reply",
            DraftKind::SignOff => "sign_off",
        }
    }
}

/// The message being answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub sender: String,
    pub body: String,
}

/// Everything a producer may use to draft one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRequest {
    pub agent_id: String,
    pub kind: DraftKind,
    pub topic: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyContext>,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl DraftRequest {
    pub fn new(agent_id: impl Into<String>, kind: DraftKind, topic: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            topic: topic.into(),
            conversation_id: String::new(),
            invitee: None,
            reply_to: None,
            interests: Vec::new(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn inviting(mut self, invitee: impl Into<String>) -> Self {
        self.invitee = Some(invitee.into());
        self
    }

    pub fn replying_to(mut self, sender: impl Into<String>, body: impl Into<String>) -> Self {
        self.reply_to = Some(ReplyContext {
            sender: sender.into(),
            body: body.into(),
        });
        self
    }

    /// Plain-language instruction describing the request
    pub fn prompt(&self) -> String {
        match self.kind {
            DraftKind::Opener => format!(
                "As {}, start a casual group chat conversation about {}.",
                self.agent_id, self.topic
            ),
            DraftKind::Invitation => format!(
                "As {}, invite {} into the conversation about {}.",
                self.agent_id,
                self.invitee.as_deref().unwrap_or("everyone"),
                self.topic
            ),
            DraftKind::Reply => match &self.reply_to {
                Some(reply) => format!(
                    "As {}, reply to {} who said: \"{}\" (topic: {}).",
                    self.agent_id, reply.sender, reply.body, self.topic
                ),
                None => format!(
                    "As {}, add to the conversation about {}.",
                    self.agent_id, self.topic
                ),
            },
            DraftKind::SignOff => format!(
                "As {}, briefly sign off from the conversation about {}.",
                self.agent_id, self.topic
            ),
        }
    }
}

/// Drafts raw message text. Personality and pacing are applied afterwards.
#[async_trait]
pub trait ContentProducer: Send + Sync {
    /// Producer name for logging
    fn name(&self) -> &'static str;

    /// Draft the message text for `request`
    async fn draft(&self, request: &DraftRequest) -> Result<String>;
}
