// ABOUTME: JSON request and response bodies for the broker's HTTP surface.
// ABOUTME: Shared by the axum handlers and the reqwest client so both sides agree on field names.

use chorus_core::message::{ActionSignal, Update};
use serde::{Deserialize, Serialize};

/// Body of /register, /unregister and /heartbeat
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub agent_id: String,
    pub token: String,
}

// Custom Debug impl to redact token
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub connected_agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Query string of /getUpdates
#[derive(Clone, Serialize, Deserialize)]
pub struct UpdatesQuery {
    pub agent_id: String,
    pub token: String,
    #[serde(default)]
    pub offset: u64,
}

impl std::fmt::Debug for UpdatesQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatesQuery")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesResponse {
    pub success: bool,
    /// Queued updates (messages and connection events) with sequence >= offset
    pub messages: Vec<Update>,
    #[serde(default)]
    pub actions: Vec<ActionSignal>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub agent_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub hop_count: u32,
}

impl std::fmt::Debug for SendMessageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendMessageRequest")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("conversation_id", &self.conversation_id)
            .field("mentions", &self.mentions)
            .field("hop_count", &self.hop_count)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub message_id: String,
    pub sequence: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SendChatActionRequest {
    pub agent_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub action: String,
}

impl std::fmt::Debug for SendChatActionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendChatActionRequest")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("action", &self.action)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents: usize,
    pub agents_list: Vec<String>,
    /// Seconds since the broker started
    pub uptime: u64,
    pub last_sequence: u64,
}
