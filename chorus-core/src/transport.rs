// ABOUTME: RelayTransport trait: the agent runtime's view of a relay broker, local or remote.
// ABOUTME: LocalRelay implements it directly over an in-process RelayBroker.

use async_trait::async_trait;
use std::sync::Arc;

use crate::broker::RelayBroker;
use crate::error::RelayResult;
use crate::message::{ChatAction, Message, OutgoingMessage, PollBatch};

/// Broker operations an agent needs.
///
/// Network failures surface as `RelayError::UnreachablePeer`; rejected
/// credentials as `RelayError::Unauthorized`, which the runtime answers by
/// registering again.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Register and return every connected agent id (including the caller)
    async fn register(&self, agent_id: &str, token: &str) -> RelayResult<Vec<String>>;

    async fn unregister(&self, agent_id: &str, token: &str) -> RelayResult<()>;

    async fn heartbeat(&self, agent_id: &str, token: &str) -> RelayResult<()>;

    /// Acknowledge everything before `offset` and fetch what remains
    async fn poll(&self, agent_id: &str, token: &str, offset: u64) -> RelayResult<PollBatch>;

    async fn send(
        &self,
        agent_id: &str,
        token: &str,
        message: OutgoingMessage,
    ) -> RelayResult<Message>;

    async fn send_action(
        &self,
        agent_id: &str,
        token: &str,
        chat_id: Option<String>,
        action: ChatAction,
    ) -> RelayResult<()>;

    /// Transport identifier for logs (e.g., "local", "http")
    fn name(&self) -> &'static str;
}

/// In-process transport, used by tests and single-process swarms
#[derive(Debug, Clone)]
pub struct LocalRelay {
    broker: Arc<RelayBroker>,
}

impl LocalRelay {
    pub fn new(broker: Arc<RelayBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<RelayBroker> {
        &self.broker
    }
}

#[async_trait]
impl RelayTransport for LocalRelay {
    async fn register(&self, agent_id: &str, token: &str) -> RelayResult<Vec<String>> {
        self.broker.register(agent_id, token)
    }

    async fn unregister(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        self.broker.unregister(agent_id, token)
    }

    async fn heartbeat(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        self.broker.heartbeat(agent_id, token)
    }

    async fn poll(&self, agent_id: &str, token: &str, offset: u64) -> RelayResult<PollBatch> {
        self.broker.poll(agent_id, token, offset)
    }

    async fn send(
        &self,
        agent_id: &str,
        token: &str,
        message: OutgoingMessage,
    ) -> RelayResult<Message> {
        self.broker.send(agent_id, token, message)
    }

    async fn send_action(
        &self,
        agent_id: &str,
        token: &str,
        chat_id: Option<String>,
        action: ChatAction,
    ) -> RelayResult<()> {
        self.broker
            .send_action(agent_id, token, chat_id, action)
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
