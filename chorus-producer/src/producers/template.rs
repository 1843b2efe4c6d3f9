// ABOUTME: Template producer - fills canned lines with topic, invitee and sender placeholders.
// ABOUTME: Rotates through each kind's templates so consecutive drafts differ without randomness.

use crate::traits::{ContentProducer, DraftKind, DraftRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Template lines per draft kind. Placeholders: `{topic}`, `{invitee}`, `{sender}`, `{agent}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub openers: Vec<String>,
    pub invitations: Vec<String>,
    pub replies: Vec<String>,
    pub sign_offs: Vec<String>,
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            openers: lines(&[
                "Been thinking about {topic} lately.",
                "Hot take on {topic}: it's underrated.",
                "Anyone else following what's happening with {topic}?",
            ]),
            invitations: lines(&[
                "{invitee}, you've got opinions on {topic}, right?",
                "Curious what {invitee} thinks about {topic}.",
            ]),
            replies: lines(&[
                "Fair point, {sender}.",
                "I see it a bit differently when it comes to {topic}.",
                "That matches what I've seen.",
                "Hmm, not sure I agree.",
            ]),
            sign_offs: lines(&[
                "Good chat. I'm heading off.",
                "Alright, that's enough {topic} for me today.",
            ]),
        }
    }
}

pub struct TemplateProducer {
    config: TemplateConfig,
    cursor: AtomicUsize,
}

impl TemplateProducer {
    pub fn new(config: TemplateConfig) -> Self {
        Self {
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    fn templates(&self, kind: DraftKind) -> &[String] {
        match kind {
            DraftKind::Opener => &self.config.openers,
            DraftKind::Invitation => &self.config.invitations,
            DraftKind::Reply => &self.config.replies,
            DraftKind::SignOff => &self.config.sign_offs,
        }
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::ProducerFactory {
        Box::new(|options| {
            let config: TemplateConfig = if options.is_null() {
                TemplateConfig::default()
            } else {
                serde_json::from_value(options.clone())?
            };
            Ok(Arc::new(TemplateProducer::new(config)))
        })
    }
}

fn render(template: &str, request: &DraftRequest) -> String {
    let sender = request
        .reply_to
        .as_ref()
        .map(|r| r.sender.as_str())
        .unwrap_or("everyone");
    template
        .replace("{topic}", &request.topic)
        .replace("{invitee}", request.invitee.as_deref().unwrap_or("everyone"))
        .replace("{sender}", sender)
        .replace("{agent}", &request.agent_id)
}

#[async_trait]
impl ContentProducer for TemplateProducer {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn draft(&self, request: &DraftRequest) -> Result<String> {
        let templates = self.templates(request.kind);
        if templates.is_empty() {
            anyhow::bail!("No templates configured for {}", request.kind.as_str());
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % templates.len();
        Ok(render(&templates[index], request))
    }
}
