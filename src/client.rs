// ABOUTME: HTTP client for a remote relay broker.
// ABOUTME: Implements RelayTransport over reqwest; 401 becomes Unauthorized, network errors UnreachablePeer.

use async_trait::async_trait;
use chorus_core::{
    message::{ChatAction, Message, OutgoingMessage, PollBatch},
    RelayError, RelayResult, RelayTransport,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::api::{
    AckResponse, Credentials, ErrorResponse, RegisterResponse, SendChatActionRequest,
    SendMessageRequest, SendMessageResponse, UpdatesQuery, UpdatesResponse,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelayClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, path: &str, agent_id: &str, body: &B) -> RelayResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayError::UnreachablePeer(format!("{}: {}", url, e)))?;
        decode(response, agent_id).await
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response, agent_id: &str) -> RelayResult<R> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| RelayError::UnreachablePeer(format!("invalid broker response: {}", e)));
    }

    let reason = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    match status {
        reqwest::StatusCode::UNAUTHORIZED => Err(RelayError::unauthorized(agent_id)),
        s if s.is_client_error() => Err(RelayError::validation(reason)),
        _ => Err(RelayError::UnreachablePeer(format!(
            "broker returned {}: {}",
            status, reason
        ))),
    }
}

fn credentials(agent_id: &str, token: &str) -> Credentials {
    Credentials {
        agent_id: agent_id.to_string(),
        token: token.to_string(),
    }
}

#[async_trait]
impl RelayTransport for HttpRelayClient {
    async fn register(&self, agent_id: &str, token: &str) -> RelayResult<Vec<String>> {
        let response: RegisterResponse = self
            .post("/register", agent_id, &credentials(agent_id, token))
            .await?;
        Ok(response.connected_agents)
    }

    async fn unregister(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        let _: AckResponse = self
            .post("/unregister", agent_id, &credentials(agent_id, token))
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        let _: AckResponse = self
            .post("/heartbeat", agent_id, &credentials(agent_id, token))
            .await?;
        Ok(())
    }

    async fn poll(&self, agent_id: &str, token: &str, offset: u64) -> RelayResult<PollBatch> {
        let url = format!("{}/getUpdates", self.base_url);
        let query = UpdatesQuery {
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            offset,
        };
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| RelayError::UnreachablePeer(format!("{}: {}", url, e)))?;
        let body: UpdatesResponse = decode(response, agent_id).await?;
        Ok(PollBatch {
            updates: body.messages,
            actions: body.actions,
        })
    }

    async fn send(
        &self,
        agent_id: &str,
        token: &str,
        message: OutgoingMessage,
    ) -> RelayResult<Message> {
        let request = SendMessageRequest {
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            chat_id: message.chat_id.clone(),
            text: message.body.clone(),
            conversation_id: message.conversation_id.clone(),
            mentions: message.mentions.clone(),
            hop_count: message.hop_count,
        };
        let response: SendMessageResponse = self.post("/sendMessage", agent_id, &request).await?;

        // The broker only echoes id and sequence; the rest is what we sent
        Ok(Message {
            id: response.message_id,
            sequence: response.sequence,
            sender: agent_id.to_string(),
            chat_id: message.chat_id,
            conversation_id: message.conversation_id,
            body: message.body,
            mentions: message.mentions,
            hop_count: message.hop_count,
            created_at: chrono::Utc::now(),
        })
    }

    async fn send_action(
        &self,
        agent_id: &str,
        token: &str,
        chat_id: Option<String>,
        action: ChatAction,
    ) -> RelayResult<()> {
        let request = SendChatActionRequest {
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            chat_id,
            action: action.to_string(),
        };
        let _: AckResponse = self.post("/sendChatAction", agent_id, &request).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
