// ABOUTME: Registry pattern for runtime content producer selection.
// ABOUTME: Producers register factories; agents create one by name from config.

use crate::traits::ContentProducer;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory function that creates a producer from its JSON options
pub type ProducerFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn ContentProducer>> + Send + Sync>;

/// Registry for runtime producer selection
pub struct ProducerRegistry {
    factories: HashMap<String, ProducerFactory>,
}

impl ProducerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a producer factory by name
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Arc<dyn ContentProducer>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// Create a producer by name with the given options
    pub fn create(&self, name: &str, options: &Value) -> Result<Arc<dyn ContentProducer>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("Unknown producer: {}", name))?;
        factory(options)
    }

    /// List available producer names
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProducerRegistry {
    fn default() -> Self {
        use crate::producers::command::CommandProducer;
        use crate::producers::scripted::ScriptedProducer;
        use crate::producers::template::TemplateProducer;

        Self::new()
            .register("template", TemplateProducer::factory())
            .register("scripted", ScriptedProducer::factory())
            .register("command", CommandProducer::factory())
    }
}
