// ABOUTME: Root library module exposing the broker HTTP surface, client and agent runtime
// ABOUTME: Re-exports the platform-agnostic pieces from chorus-core and chorus-producer

pub mod api;
pub mod client;
pub mod runtime;
pub mod server;

// Re-export platform-agnostic modules from chorus-core
pub use chorus_core::config;
pub use chorus_core::metrics;
pub use chorus_core::paths;

// Re-export core types for convenience
pub use chorus_core::{
    ConversationOrchestrator, LocalRelay, Message, OutgoingMessage, RelayBroker, RelayError,
    RelayTransport,
};
pub use chorus_producer::{ContentProducer, ProducerRegistry};
