// ABOUTME: Agent registry tracking connected agents, their tokens, liveness and delivery cursors.
// ABOUTME: Pure bookkeeping with explicit timestamps; the broker owns locking and broadcasts.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::error::{RelayError, RelayResult};

/// A registered agent as seen by the broker.
#[derive(Clone)]
pub struct AgentRecord {
    pub id: String,
    token: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Last acknowledged poll offset
    pub cursor: u64,
}

// Custom Debug impl to redact the token
impl std::fmt::Debug for AgentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRecord")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("registered_at", &self.registered_at)
            .field("last_heartbeat", &self.last_heartbeat)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl AgentRecord {
    fn token_matches(&self, token: &str) -> bool {
        self.token == token
    }
}

/// Outcome of a register call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this id was seen (or it had been removed)
    New,
    /// Id already present; token and liveness refreshed
    Refreshed,
}

/// Registry of connected agents keyed by id.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRecord>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            agents: BTreeMap::new(),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register or refresh an agent. Idempotent per id.
    pub fn register(
        &mut self,
        agent_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> RelayResult<Registration> {
        if agent_id.trim().is_empty() {
            return Err(RelayError::validation("agent_id is required"));
        }
        if token.is_empty() {
            return Err(RelayError::validation("token is required"));
        }

        if let Some(existing) = self.agents.get_mut(agent_id) {
            existing.token = token.to_string();
            existing.last_heartbeat = now;
            return Ok(Registration::Refreshed);
        }

        self.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                id: agent_id.to_string(),
                token: token.to_string(),
                registered_at: now,
                last_heartbeat: now,
                cursor: 0,
            },
        );
        Ok(Registration::New)
    }

    /// Check credentials without changing liveness
    pub fn authenticate(&self, agent_id: &str, token: &str) -> RelayResult<&AgentRecord> {
        match self.agents.get(agent_id) {
            Some(record) if record.token_matches(token) => Ok(record),
            _ => Err(RelayError::unauthorized(agent_id)),
        }
    }

    /// Check credentials and refresh liveness
    pub fn heartbeat(&mut self, agent_id: &str, token: &str, now: DateTime<Utc>) -> RelayResult<()> {
        match self.agents.get_mut(agent_id) {
            Some(record) if record.token_matches(token) => {
                record.last_heartbeat = now;
                Ok(())
            }
            _ => Err(RelayError::unauthorized(agent_id)),
        }
    }

    /// Authenticated removal
    pub fn unregister(&mut self, agent_id: &str, token: &str) -> RelayResult<AgentRecord> {
        self.authenticate(agent_id, token)?;
        self.agents
            .remove(agent_id)
            .ok_or_else(|| RelayError::unauthorized(agent_id))
    }

    /// Unauthenticated removal, used by the expiry sweep
    pub fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.remove(agent_id)
    }

    pub fn set_cursor(&mut self, agent_id: &str, cursor: u64) {
        if let Some(record) = self.agents.get_mut(agent_id) {
            record.cursor = record.cursor.max(cursor);
        }
    }

    /// Ids whose last heartbeat is older than the timeout
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.agents
            .values()
            .filter(|record| now - record.last_heartbeat > self.heartbeat_timeout)
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.get(agent_id)
    }

    /// Connected ids in sorted order
    pub fn ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
