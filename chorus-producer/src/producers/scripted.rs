// ABOUTME: Scripted producer for testing - returns pre-configured drafts.
// ABOUTME: Matches expectations against the request prompt in FIFO order, then cycles fallback lines.
//!
//! # Example
//!
//! ```no_run
//! use chorus_producer::{ContentProducer, DraftKind, DraftRequest, ScriptedProducer};
//!
//! # async fn example() {
//! let producer = ScriptedProducer::new()
//!     .on_prompt("start a casual").respond_text("anyone up for rust talk?")
//!     .on_prompt("reply to eth").respond_error("model offline");
//!
//! let request = DraftRequest::new("vc", DraftKind::Opener, "rust");
//! assert_eq!(producer.draft(&request).await.unwrap(), "anyone up for rust talk?");
//! # }
//! ```

use crate::traits::{ContentProducer, DraftRequest};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

enum Outcome {
    Text(String),
    Error(String),
}

struct Expectation {
    pattern: String,
    outcome: Outcome,
}

/// Options accepted by the registry factory
#[derive(Debug, Default, Deserialize)]
struct ScriptedConfig {
    #[serde(default)]
    lines: Vec<String>,
}

pub struct ScriptedProducer {
    expectations: Mutex<VecDeque<Expectation>>,
    fallback: Vec<String>,
    cursor: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProducer {
    /// Create a producer with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Mutex::new(VecDeque::new()),
            fallback: Vec::new(),
            cursor: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Lines handed out in order when no expectation matches
    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.fallback = lines;
        self
    }

    /// Set up an expectation for a request whose prompt contains `pattern`
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            producer: self,
            pattern: pattern.to_string(),
        }
    }

    /// Prompts seen so far, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::ProducerFactory {
        Box::new(|options| {
            let config: ScriptedConfig = if options.is_null() {
                ScriptedConfig::default()
            } else {
                serde_json::from_value(options.clone())?
            };
            Ok(Arc::new(ScriptedProducer::new().with_lines(config.lines)))
        })
    }

    fn push(&self, expectation: Expectation) {
        self.expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(expectation);
    }
}

impl Default for ScriptedProducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for setting up scripted expectations with a fluent API
pub struct ExpectationBuilder {
    producer: ScriptedProducer,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a fixed draft
    pub fn respond_text(self, text: &str) -> ScriptedProducer {
        self.producer.push(Expectation {
            pattern: self.pattern,
            outcome: Outcome::Text(text.to_string()),
        });
        self.producer
    }

    /// Fail the draft with an error
    pub fn respond_error(self, message: &str) -> ScriptedProducer {
        self.producer.push(Expectation {
            pattern: self.pattern,
            outcome: Outcome::Error(message.to_string()),
        });
        self.producer
    }
}

#[async_trait]
impl ContentProducer for ScriptedProducer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn draft(&self, request: &DraftRequest) -> Result<String> {
        let prompt = request.prompt();
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        // Earliest matching expectation wins
        let matched = {
            let mut queue = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
            queue
                .iter()
                .position(|e| prompt.contains(&e.pattern))
                .and_then(|i| queue.remove(i))
        };

        match matched.map(|e| e.outcome) {
            Some(Outcome::Text(text)) => Ok(text),
            Some(Outcome::Error(message)) => Err(anyhow::anyhow!(message)),
            None if !self.fallback.is_empty() => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.fallback.len();
                Ok(self.fallback[index].clone())
            }
            None => Ok(format!("Scripted: no expectation for '{}'", prompt)),
        }
    }
}
