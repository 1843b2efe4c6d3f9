// ABOUTME: Relay message types shared by broker, transports and orchestrators.
// ABOUTME: Defines Message, queued Update entries, ephemeral chat actions and outgoing drafts.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::RelayError;

/// A message accepted by the broker and fanned out to other agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,
    /// Broker-assigned sequence number, strictly increasing per broker
    pub sequence: u64,
    /// Agent that sent the message
    pub sender: String,
    /// Platform chat the message targets, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Conversation this message belongs to, if the sender tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Message text
    pub body: String,
    /// Subjects explicitly addressed by this message
    #[serde(default)]
    pub mentions: Vec<String>,
    /// Number of times this message has been re-relayed
    #[serde(default)]
    pub hop_count: u32,
    /// When the broker accepted the message
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether this message addresses the given subject
    pub fn mentions(&self, subject_id: &str) -> bool {
        self.mentions.iter().any(|m| m == subject_id)
    }

    /// Build a re-relay of this message with the hop count incremented
    pub fn relayed(&self) -> OutgoingMessage {
        OutgoingMessage {
            chat_id: self.chat_id.clone(),
            conversation_id: self.conversation_id.clone(),
            body: self.body.clone(),
            mentions: self.mentions.clone(),
            hop_count: self.hop_count + 1,
        }
    }
}

/// One entry in an agent's delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub sequence: u64,
    pub event: UpdateKind,
}

/// What happened at a given sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateKind {
    /// Another agent sent a message
    Message { message: Message },
    /// An agent registered with the broker
    AgentConnected { agent_id: String },
    /// An agent unregistered or expired
    AgentDisconnected { agent_id: String },
}

impl Update {
    pub fn message(&self) -> Option<&Message> {
        match &self.event {
            UpdateKind::Message { message } => Some(message),
            _ => None,
        }
    }
}

/// Out-of-band signals that are delivered at most once and never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatAction {
    Typing,
    StopTyping,
}

impl std::fmt::Display for ChatAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatAction::Typing => write!(f, "typing"),
            ChatAction::StopTyping => write!(f, "stop_typing"),
        }
    }
}

impl FromStr for ChatAction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "typing" => Ok(ChatAction::Typing),
            "stop_typing" | "cancel" => Ok(ChatAction::StopTyping),
            other => Err(RelayError::validation(format!("unknown chat action: {}", other))),
        }
    }
}

/// A chat action as seen by a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSignal {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub action: ChatAction,
    pub at: DateTime<Utc>,
}

/// Everything returned by a single poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBatch {
    pub updates: Vec<Update>,
    #[serde(default)]
    pub actions: Vec<ActionSignal>,
}

impl PollBatch {
    /// Offset to use for the next poll; acknowledges everything in this batch
    pub fn next_offset(&self, current: u64) -> u64 {
        self.updates
            .last()
            .map(|u| u.sequence + 1)
            .unwrap_or(current)
            .max(current)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.updates.iter().filter_map(Update::message)
    }
}

/// A message an agent wants the broker to relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub body: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub hop_count: u32,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn in_chat(mut self, chat_id: Option<String>) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn mentioning(mut self, subject_id: impl Into<String>) -> Self {
        let subject_id = subject_id.into();
        if !self.mentions.contains(&subject_id) {
            self.mentions.push(subject_id);
        }
        self
    }
}

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_][A-Za-z0-9_.\-]*)").expect("mention regex is valid")
    })
}

/// Pull `@id` tokens out of a message body, in order of first appearance.
pub fn extract_mentions(body: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in mention_pattern().captures_iter(body) {
        if let Some(m) = caps.get(1) {
            let id = m.as_str().trim_end_matches(['.', '-']).to_string();
            if !id.is_empty() && !found.contains(&id) {
                found.push(id);
            }
        }
    }
    found
}
