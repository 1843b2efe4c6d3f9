// ABOUTME: Platform-agnostic relay broker and per-agent conversation orchestration
// ABOUTME: Provides the broker store, orchestrator, tagging, personality and pacing logic

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod pacing;
pub mod paths;
pub mod personality;
pub mod registry;
pub mod relevance;
pub mod rng;
pub mod scheduler;
pub mod tagging;
pub mod transport;

pub use broker::{BrokerHealth, RelayBroker};
pub use config::Config;
pub use error::{RelayError, RelayResult};
pub use message::{
    ActionSignal, ChatAction, Message, OutgoingMessage, PollBatch, Update, UpdateKind,
};
pub use orchestrator::{
    ConversationOrchestrator, ConversationStatus, MessageKind, PlannedMessage, ResponseDecision,
};
pub use rng::{RandomSource, SeededRandom};
pub use transport::{LocalRelay, RelayTransport};
