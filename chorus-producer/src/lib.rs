// ABOUTME: Pluggable content producer abstraction for chorus agents.
// ABOUTME: Provides the ContentProducer trait, a registry of factories, and template, scripted and command producers.

pub mod producers;
pub mod registry;
pub mod traits;

pub use producers::{CommandProducer, ScriptedProducer, TemplateProducer};
pub use registry::{ProducerFactory, ProducerRegistry};
pub use traits::{ContentProducer, DraftKind, DraftRequest, ReplyContext};
