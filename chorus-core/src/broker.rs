// ABOUTME: In-memory relay broker fanning each agent's messages out to every other agent.
// ABOUTME: Owns per-agent delivery queues with offset-based acknowledgement and pruning.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clock::{Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::error::{RelayError, RelayResult};
use crate::message::{
    extract_mentions, ActionSignal, ChatAction, Message, OutgoingMessage, PollBatch, Update,
    UpdateKind,
};
use crate::metrics;
use crate::registry::{AgentRegistry, Registration};

/// Pending deliveries for one recipient.
#[derive(Debug, Default)]
struct AgentQueue {
    updates: VecDeque<Update>,
    actions: Vec<ActionSignal>,
}

type SharedQueue = Arc<Mutex<AgentQueue>>;

/// Snapshot for the health endpoint
#[derive(Debug, Clone)]
pub struct BrokerHealth {
    pub agents: Vec<String>,
    pub uptime: Duration,
    pub last_sequence: u64,
}

/// The relay broker store.
///
/// Lock order is always `sequence` → `registry` → `queues` → a single queue.
/// Sequence assignment and fan-out happen under the `sequence` lock so every
/// recipient queue stays sorted; polls take only the registry and the polling
/// agent's own queue.
pub struct RelayBroker {
    registry: RwLock<AgentRegistry>,
    queues: RwLock<HashMap<String, SharedQueue>>,
    /// Last assigned sequence number
    sequence: Mutex<u64>,
    max_hops: u32,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for RelayBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBroker")
            .field("max_hops", &self.max_hops)
            .field("started_at", &self.started_at)
            .field("agents", &self.connected_agents())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl RelayBroker {
    pub fn new(max_hops: u32, heartbeat_timeout: Duration) -> Self {
        Self::with_clock(max_hops, heartbeat_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(max_hops: u32, heartbeat_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            registry: RwLock::new(AgentRegistry::new(heartbeat_timeout)),
            queues: RwLock::new(HashMap::new()),
            sequence: Mutex::new(0),
            max_hops,
            clock,
            started_at,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.max_hops,
            Duration::seconds(config.heartbeat_timeout_secs as i64),
        )
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    // =========================================================================
    // Registry operations
    // =========================================================================

    /// Register (or refresh) an agent and return every connected agent id.
    pub fn register(&self, agent_id: &str, token: &str) -> RelayResult<Vec<String>> {
        let now = self.clock.now();
        let mut sequence = lock(&self.sequence);
        let mut registry = write(&self.registry);

        let outcome = registry.register(agent_id, token, now)?;
        let connected = registry.ids();
        drop(registry);

        if outcome == Registration::New {
            write(&self.queues)
                .entry(agent_id.to_string())
                .or_default();
            let assigned = Self::next_sequence(&mut sequence);
            let recipients = self.deliver(
                assigned,
                agent_id,
                UpdateKind::AgentConnected {
                    agent_id: agent_id.to_string(),
                },
            );
            metrics::set_connected_agents(connected.len());
            tracing::info!(
                agent_id = %agent_id,
                connected = connected.len(),
                notified = recipients,
                "Agent registered"
            );
        } else {
            tracing::debug!(agent_id = %agent_id, "Agent re-registered, token and liveness refreshed");
        }

        Ok(connected)
    }

    pub fn heartbeat(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        let now = self.clock.now();
        write(&self.registry).heartbeat(agent_id, token, now)
    }

    /// Remove an agent and tell everyone else it left.
    pub fn unregister(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        let mut sequence = lock(&self.sequence);
        let remaining = {
            let mut registry = write(&self.registry);
            registry.unregister(agent_id, token)?;
            registry.len()
        };
        write(&self.queues).remove(agent_id);

        let notified = self.broadcast_disconnect(&mut sequence, agent_id);
        metrics::set_connected_agents(remaining);
        tracing::info!(agent_id = %agent_id, notified, "Agent unregistered");
        Ok(())
    }

    /// Expire agents that missed their heartbeat window.
    ///
    /// All expired agents are removed before any disconnect is broadcast, so
    /// each survivor gets exactly one event per expired agent and expired
    /// agents get none.
    pub fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut sequence = lock(&self.sequence);

        let (expired, remaining) = {
            let mut registry = write(&self.registry);
            let expired = registry.expired(now);
            for agent_id in &expired {
                registry.remove(agent_id);
            }
            (expired, registry.len())
        };
        if expired.is_empty() {
            return expired;
        }

        {
            let mut queues = write(&self.queues);
            for agent_id in &expired {
                queues.remove(agent_id);
            }
        }

        for agent_id in &expired {
            let notified = self.broadcast_disconnect(&mut sequence, agent_id);
            metrics::record_agent_expired();
            tracing::warn!(agent_id = %agent_id, notified, "Agent expired after missed heartbeats");
        }
        metrics::set_connected_agents(remaining);
        expired
    }

    // =========================================================================
    // Delivery operations
    // =========================================================================

    /// Accept a message from `agent_id` and fan it out to every other agent.
    pub fn send(
        &self,
        agent_id: &str,
        token: &str,
        outgoing: OutgoingMessage,
    ) -> RelayResult<Message> {
        let now = self.clock.now();

        if outgoing.body.trim().is_empty() {
            metrics::record_message_rejected("validation");
            return Err(RelayError::validation("text is required"));
        }

        let mut sequence = lock(&self.sequence);
        let mentions = {
            let mut registry = write(&self.registry);
            if let Err(e) = registry.heartbeat(agent_id, token, now) {
                metrics::record_message_rejected("unauthorized");
                return Err(e);
            }

            if outgoing.hop_count >= self.max_hops {
                metrics::record_message_rejected("hop_limit");
                tracing::warn!(
                    agent_id = %agent_id,
                    hop_count = outgoing.hop_count,
                    max_hops = self.max_hops,
                    "Dropping message at hop limit"
                );
                return Err(RelayError::HopLimitExceeded {
                    hop_count: outgoing.hop_count,
                    max_hops: self.max_hops,
                });
            }

            let mut mentions = outgoing.mentions.clone();
            for candidate in extract_mentions(&outgoing.body) {
                if registry.contains(&candidate) && !mentions.contains(&candidate) {
                    mentions.push(candidate);
                }
            }
            mentions
        };

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: Self::next_sequence(&mut sequence),
            sender: agent_id.to_string(),
            chat_id: outgoing.chat_id,
            conversation_id: outgoing.conversation_id,
            body: outgoing.body,
            mentions,
            hop_count: outgoing.hop_count,
            created_at: now,
        };

        let recipients = self.deliver(
            message.sequence,
            agent_id,
            UpdateKind::Message {
                message: message.clone(),
            },
        );
        metrics::record_message_relayed(recipients);
        tracing::debug!(
            agent_id = %agent_id,
            sequence = message.sequence,
            recipients,
            conversation_id = ?message.conversation_id,
            "Message relayed"
        );
        Ok(message)
    }

    /// Acknowledge everything before `since` and return what remains.
    pub fn poll(&self, agent_id: &str, token: &str, since: u64) -> RelayResult<PollBatch> {
        let now = self.clock.now();
        {
            let mut registry = write(&self.registry);
            registry.heartbeat(agent_id, token, now)?;
            registry.set_cursor(agent_id, since);
        }

        let queue = read(&self.queues)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RelayError::unauthorized(agent_id))?;
        let mut queue = lock(&queue);

        while queue
            .updates
            .front()
            .is_some_and(|update| update.sequence < since)
        {
            queue.updates.pop_front();
        }

        Ok(PollBatch {
            updates: queue.updates.iter().cloned().collect(),
            actions: std::mem::take(&mut queue.actions),
        })
    }

    /// Forward a best-effort action to every other agent; returns recipient count.
    pub fn send_action(
        &self,
        agent_id: &str,
        token: &str,
        chat_id: Option<String>,
        action: ChatAction,
    ) -> RelayResult<usize> {
        let now = self.clock.now();
        write(&self.registry).heartbeat(agent_id, token, now)?;

        let signal = ActionSignal {
            sender: agent_id.to_string(),
            chat_id,
            action,
            at: now,
        };

        let queues = read(&self.queues);
        let mut recipients = 0;
        for (recipient, queue) in queues.iter() {
            if recipient == agent_id {
                continue;
            }
            lock(queue).actions.push(signal.clone());
            recipients += 1;
        }
        metrics::record_action_forwarded();
        tracing::trace!(agent_id = %agent_id, action = %action, recipients, "Action forwarded");
        Ok(recipients)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn connected_agents(&self) -> Vec<String> {
        read(&self.registry).ids()
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        read(&self.registry).contains(agent_id)
    }

    /// Last acknowledged offset for an agent
    pub fn cursor(&self, agent_id: &str) -> Option<u64> {
        read(&self.registry).get(agent_id).map(|r| r.cursor)
    }

    /// Number of undelivered or unacknowledged updates queued for an agent
    pub fn queue_len(&self, agent_id: &str) -> Option<usize> {
        read(&self.queues)
            .get(agent_id)
            .map(|queue| lock(queue).updates.len())
    }

    pub fn health(&self) -> BrokerHealth {
        BrokerHealth {
            agents: self.connected_agents(),
            uptime: self.clock.now() - self.started_at,
            last_sequence: *lock(&self.sequence),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Advance the sequence counter. Caller holds the sequence lock.
    fn next_sequence(sequence: &mut MutexGuard<'_, u64>) -> u64 {
        **sequence += 1;
        **sequence
    }

    /// Push one update into every queue except `exclude`'s.
    fn deliver(&self, assigned: u64, exclude: &str, event: UpdateKind) -> usize {
        let queues = read(&self.queues);
        let mut recipients = 0;
        for (recipient, queue) in queues.iter() {
            if recipient == exclude {
                continue;
            }
            lock(queue).updates.push_back(Update {
                sequence: assigned,
                event: event.clone(),
            });
            recipients += 1;
        }
        recipients
    }

    fn broadcast_disconnect(&self, sequence: &mut MutexGuard<'_, u64>, agent_id: &str) -> usize {
        let assigned = Self::next_sequence(sequence);
        self.deliver(
            assigned,
            agent_id,
            UpdateKind::AgentDisconnected {
                agent_id: agent_id.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn broker() -> RelayBroker {
        RelayBroker::new(3, Duration::seconds(300))
    }

    #[test]
    fn test_send_excludes_sender() {
        let broker = broker();
        broker.register("eth", "a").unwrap();
        broker.register("vc", "b").unwrap();

        broker.send("vc", "b", OutgoingMessage::new("hello")).unwrap();

        let vc_batch = broker.poll("vc", "b", 0).unwrap();
        assert_eq!(vc_batch.messages().count(), 0);
        let eth_batch = broker.poll("eth", "a", 0).unwrap();
        assert_eq!(eth_batch.messages().count(), 1);
    }

    #[test]
    fn test_message_sequence_matches_update_sequence() {
        let broker = broker();
        broker.register("eth", "a").unwrap();
        broker.register("vc", "b").unwrap();
        let sent = broker.send("vc", "b", OutgoingMessage::new("hi")).unwrap();
        let batch = broker.poll("eth", "a", 0).unwrap();
        let update = batch.updates.last().unwrap();
        assert_eq!(update.sequence, sent.sequence);
        assert_eq!(update.message().unwrap().sequence, sent.sequence);
    }

    #[test]
    fn test_poll_prunes_only_own_queue() {
        let broker = broker();
        broker.register("eth", "a").unwrap();
        broker.register("vc", "b").unwrap();
        broker.register("mo", "c").unwrap();

        let sent = broker.send("vc", "b", OutgoingMessage::new("one")).unwrap();
        broker.poll("eth", "a", sent.sequence + 1).unwrap();

        assert_eq!(broker.queue_len("eth"), Some(0));
        // mo registered last, so it only holds vc's message
        assert_eq!(broker.queue_len("mo"), Some(1));
        assert_eq!(broker.cursor("eth"), Some(sent.sequence + 1));
    }

    #[test]
    fn test_sweep_with_manual_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let broker = RelayBroker::with_clock(3, Duration::seconds(300), clock.clone());
        broker.register("eth", "a").unwrap();
        broker.register("vc", "b").unwrap();

        clock.advance(Duration::seconds(200));
        broker.heartbeat("vc", "b").unwrap();
        clock.advance(Duration::seconds(150));

        assert_eq!(broker.sweep(), vec!["eth".to_string()]);
        assert!(!broker.is_registered("eth"));
        assert!(broker.sweep().is_empty());
    }

    #[test]
    fn test_actions_are_drained_once() {
        let broker = broker();
        broker.register("eth", "a").unwrap();
        broker.register("vc", "b").unwrap();

        let recipients = broker
            .send_action("vc", "b", None, ChatAction::Typing)
            .unwrap();
        assert_eq!(recipients, 1);

        let first = broker.poll("eth", "a", 0).unwrap();
        assert_eq!(first.actions.len(), 1);
        assert_eq!(first.actions[0].action, ChatAction::Typing);
        let second = broker.poll("eth", "a", 0).unwrap();
        assert!(second.actions.is_empty());
    }

    #[test]
    fn test_empty_body_rejected() {
        let broker = broker();
        broker.register("eth", "a").unwrap();
        let err = broker
            .send("eth", "a", OutgoingMessage::new("   "))
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
