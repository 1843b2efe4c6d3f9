// ABOUTME: Agent runtime that drives one ConversationOrchestrator against a relay transport.
// ABOUTME: Polls, heartbeats and fires timers on one loop; drafting and paced sending run as tasks.

use anyhow::{Context, Result};
use chorus_core::{
    clock::{Clock, SystemClock},
    config::{AgentConfig, Config},
    message::{ChatAction, Message, OutgoingMessage, UpdateKind},
    pacing::TypingSegment,
    ConversationOrchestrator, MessageKind, PlannedMessage, RandomSource, RelayError,
    RelayResult, RelayTransport, SeededRandom,
};
use chorus_producer::{ContentProducer, DraftKind, DraftRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound on how often due timers are checked
const TIMER_TICK: Duration = Duration::from_millis(250);
const MAX_REGISTER_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const OUTCOME_CHANNEL_CAPACITY: usize = 32;

/// Results reported back to the loop by background tasks
enum Outcome {
    Drafted {
        planned: PlannedMessage,
        draft: Result<String>,
    },
    Delivered {
        planned: PlannedMessage,
        result: RelayResult<Message>,
    },
}

pub fn draft_kind(kind: MessageKind) -> DraftKind {
    match kind {
        MessageKind::Opener => DraftKind::Opener,
        MessageKind::Invitation => DraftKind::Invitation,
        MessageKind::Reply => DraftKind::Reply,
        MessageKind::SignOff => DraftKind::SignOff,
    }
}

/// Producer request for a planned message
pub fn draft_request(agent: &AgentConfig, planned: &PlannedMessage) -> DraftRequest {
    let mut request = DraftRequest::new(agent.id.clone(), draft_kind(planned.kind), &planned.topic)
        .in_conversation(planned.conversation_id.clone());
    if let Some(invitee) = &planned.invitee {
        request = request.inviting(invitee.clone());
    }
    if let Some(message) = &planned.reply_to {
        request = request.replying_to(message.sender.clone(), message.body.clone());
    }
    request.interests = agent.interests();
    request
}

pub struct AgentRuntime {
    agent: AgentConfig,
    transport: Arc<dyn RelayTransport>,
    producer: Arc<dyn ContentProducer>,
    orchestrator: ConversationOrchestrator,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    check_interval: Duration,
    heartbeat_interval: Duration,
    offset: u64,
    registered: bool,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_id", &self.agent.id)
            .field("transport", &self.transport.name())
            .field("producer", &self.producer.name())
            .field("offset", &self.offset)
            .field("registered", &self.registered)
            .finish()
    }
}

impl AgentRuntime {
    /// Runtime seeded from the agent's `seed`, or from entropy
    pub fn new(
        agent: AgentConfig,
        config: &Config,
        transport: Arc<dyn RelayTransport>,
        producer: Arc<dyn ContentProducer>,
    ) -> Result<Self> {
        let rng: Box<dyn RandomSource> = match agent.seed {
            Some(seed) => Box::new(SeededRandom::from_seed(seed)),
            None => Box::new(SeededRandom::from_entropy()),
        };
        Self::with_parts(agent, config, transport, producer, rng, Arc::new(SystemClock))
    }

    pub fn with_parts(
        agent: AgentConfig,
        config: &Config,
        transport: Arc<dyn RelayTransport>,
        producer: Arc<dyn ContentProducer>,
        rng: Box<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let orchestrator = ConversationOrchestrator::new(&agent, config, rng)
            .with_context(|| format!("Failed to build orchestrator for {}", agent.id))?;
        Ok(Self {
            transport,
            producer,
            orchestrator,
            clock,
            poll_interval: config.orchestrator.poll_interval(),
            check_interval: config.orchestrator.check_interval(),
            heartbeat_interval: config.orchestrator.heartbeat_interval(),
            offset: 0,
            registered: false,
            agent,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    pub fn orchestrator(&self) -> &ConversationOrchestrator {
        &self.orchestrator
    }

    /// Next sequence number this agent will ask for
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Register once and seed the known-agent set from the broker's reply.
    ///
    /// The poll offset starts over: a broker that forgot this agent may have
    /// restarted its sequence, and a stale offset would acknowledge messages
    /// before they are read.
    pub async fn register(&mut self) -> RelayResult<()> {
        let connected = self
            .transport
            .register(&self.agent.id, &self.agent.token)
            .await?;
        self.orchestrator.set_known_agents(connected.iter().cloned());
        self.registered = true;
        self.offset = 0;
        tracing::info!(
            agent_id = %self.agent.id,
            transport = self.transport.name(),
            connected = ?connected,
            "Registered with broker"
        );
        Ok(())
    }

    /// Register with exponential backoff; credential rejections are not retried
    pub async fn connect(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_REGISTER_ATTEMPTS {
            match self.register().await {
                Ok(()) => return Ok(()),
                Err(e @ RelayError::Unauthorized { .. }) | Err(e @ RelayError::Validation(_)) => {
                    return Err(e).context("Broker rejected registration");
                }
                Err(e) => {
                    tracing::warn!(
                        agent_id = %self.agent.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => anyhow::bail!("Shutdown requested during registration"),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        anyhow::bail!(
            "Failed to register {} after {} attempts",
            self.agent.id,
            MAX_REGISTER_ATTEMPTS
        )
    }

    /// Fetch and process one batch of updates. Returns how many messages were seen.
    pub async fn poll_once(&mut self) -> RelayResult<usize> {
        let batch = self
            .transport
            .poll(&self.agent.id, &self.agent.token, self.offset)
            .await?;
        self.offset = batch.next_offset(self.offset);

        let now = self.clock.now();
        let mut seen = 0;
        for update in &batch.updates {
            match &update.event {
                UpdateKind::AgentConnected { agent_id } => {
                    self.orchestrator.agent_connected(agent_id);
                }
                UpdateKind::AgentDisconnected { agent_id } => {
                    self.orchestrator.agent_disconnected(agent_id, now);
                }
                UpdateKind::Message { message } => {
                    seen += 1;
                    let decision = self.orchestrator.on_message(message, now);
                    tracing::debug!(
                        agent_id = %self.agent.id,
                        sender = %message.sender,
                        sequence = message.sequence,
                        decision = decision.label(),
                        "Processed message"
                    );
                }
            }
        }
        for signal in &batch.actions {
            tracing::trace!(
                agent_id = %self.agent.id,
                sender = %signal.sender,
                action = %signal.action,
                "Peer chat action"
            );
        }
        Ok(seen)
    }

    /// Run until `shutdown` fires, then unregister
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if !self.registered {
            self.connect(&shutdown).await?;
        }

        let (tx, mut rx) = mpsc::channel::<Outcome>(OUTCOME_CHANNEL_CAPACITY);
        let start = Instant::now();
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut check = interval_at(start + self.check_interval, self.check_interval);
        let mut heartbeat = interval_at(start + self.heartbeat_interval, self.heartbeat_interval);
        let mut timers = tokio::time::interval(self.poll_interval.min(TIMER_TICK));
        for ticker in [&mut poll, &mut check, &mut heartbeat, &mut timers] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tracing::info!(
            agent_id = %self.agent.id,
            producer = self.producer.name(),
            poll_ms = self.poll_interval.as_millis() as u64,
            check_secs = self.check_interval.as_secs(),
            "Agent runtime started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if self.ensure_registered().await {
                        if let Err(e) = self.poll_once().await {
                            self.handle_relay_error(e, "poll");
                        }
                        self.flush_due(&tx);
                    }
                }
                _ = heartbeat.tick() => {
                    if self.ensure_registered().await {
                        if let Err(e) = self
                            .transport
                            .heartbeat(&self.agent.id, &self.agent.token)
                            .await
                        {
                            self.handle_relay_error(e, "heartbeat");
                        }
                    }
                }
                _ = check.tick() => {
                    let now = self.clock.now();
                    if let Some(conversation_id) = self.orchestrator.check_initiation(now) {
                        tracing::info!(
                            agent_id = %self.agent.id,
                            conversation_id = %conversation_id,
                            "Initiating conversation"
                        );
                    }
                    self.flush_due(&tx);
                }
                _ = timers.tick() => self.flush_due(&tx),
                Some(outcome) = rx.recv() => {
                    self.handle_outcome(outcome, &tx);
                    self.flush_due(&tx);
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if !self.registered {
            return;
        }
        match self
            .transport
            .unregister(&self.agent.id, &self.agent.token)
            .await
        {
            Ok(()) => tracing::info!(agent_id = %self.agent.id, "Unregistered from broker"),
            Err(e) => tracing::warn!(
                agent_id = %self.agent.id,
                error = %e,
                "Failed to unregister"
            ),
        }
        self.registered = false;
    }

    /// Re-register after the broker forgot us; false while it still fails
    async fn ensure_registered(&mut self) -> bool {
        if self.registered {
            return true;
        }
        match self.register().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent.id, error = %e, "Re-registration failed");
                false
            }
        }
    }

    fn handle_relay_error(&mut self, error: RelayError, during: &'static str) {
        if matches!(error, RelayError::Unauthorized { .. }) {
            tracing::warn!(
                agent_id = %self.agent.id,
                during,
                "Broker no longer recognizes this agent, will re-register"
            );
            self.registered = false;
        } else {
            tracing::warn!(agent_id = %self.agent.id, during, error = %error, "Relay request failed");
        }
    }

    /// Hand every due planned message to a drafting task
    fn flush_due(&mut self, tx: &mpsc::Sender<Outcome>) {
        let now = self.clock.now();
        for planned in self.orchestrator.tick(now) {
            self.spawn_draft(planned, tx);
        }
    }

    fn spawn_draft(&self, planned: PlannedMessage, tx: &mpsc::Sender<Outcome>) {
        let request = draft_request(&self.agent, &planned);
        let producer = Arc::clone(&self.producer);
        let tx = tx.clone();
        tracing::debug!(
            agent_id = %self.agent.id,
            conversation_id = %planned.conversation_id,
            kind = planned.kind.label(),
            "Drafting message"
        );
        tokio::spawn(async move {
            let draft = producer.draft(&request).await;
            if tx.send(Outcome::Drafted { planned, draft }).await.is_err() {
                tracing::debug!("Runtime stopped before draft completed");
            }
        });
    }

    fn spawn_delivery(
        &self,
        planned: PlannedMessage,
        outgoing: OutgoingMessage,
        segments: Vec<TypingSegment>,
        tx: &mpsc::Sender<Outcome>,
    ) {
        let transport = Arc::clone(&self.transport);
        let agent_id = self.agent.id.clone();
        let token = self.agent.token.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let chat_id = outgoing.chat_id.clone();
            let cancel = planned.cancel.clone();
            let typed = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = type_out(&*transport, &agent_id, &token, chat_id.clone(), segments) => {
                    !cancel.is_cancelled()
                }
            };
            if !typed {
                signal(&*transport, &agent_id, &token, chat_id, ChatAction::StopTyping).await;
                tracing::debug!(
                    agent_id = %agent_id,
                    conversation_id = %planned.conversation_id,
                    kind = planned.kind.label(),
                    "Conversation moved on while typing, message dropped"
                );
                return;
            }
            let result = transport.send(&agent_id, &token, outgoing).await;
            if tx.send(Outcome::Delivered { planned, result }).await.is_err() {
                tracing::debug!(agent_id = %agent_id, "Runtime stopped before send completed");
            }
        });
    }

    fn handle_outcome(&mut self, outcome: Outcome, tx: &mpsc::Sender<Outcome>) {
        let now = self.clock.now();
        match outcome {
            Outcome::Drafted {
                planned,
                draft: Ok(_),
            } if !self.orchestrator.is_still_wanted(&planned) => {
                tracing::debug!(
                    agent_id = %self.agent.id,
                    conversation_id = %planned.conversation_id,
                    kind = planned.kind.label(),
                    "Conversation moved on while drafting, message dropped"
                );
            }
            Outcome::Drafted {
                planned,
                draft: Ok(draft),
            } => {
                let outgoing = self.orchestrator.compose(&planned, &draft);
                let segments = self.orchestrator.typing_plan(outgoing.body.chars().count());
                self.spawn_delivery(planned, outgoing, segments, tx);
            }
            Outcome::Drafted {
                planned,
                draft: Err(e),
            } => {
                let error = RelayError::UnreachablePeer(format!(
                    "content producer {}: {:#}",
                    self.producer.name(),
                    e
                ));
                self.orchestrator.record_send_failed(&planned, &error, now);
            }
            Outcome::Delivered {
                planned,
                result: Ok(message),
            } => {
                tracing::info!(
                    agent_id = %self.agent.id,
                    conversation_id = %planned.conversation_id,
                    kind = planned.kind.label(),
                    sequence = message.sequence,
                    mentions = ?message.mentions,
                    "Message sent"
                );
                self.orchestrator.record_sent(&planned, &message, now);
            }
            Outcome::Delivered {
                planned,
                result: Err(e),
            } => {
                if matches!(e, RelayError::Unauthorized { .. }) {
                    self.registered = false;
                }
                self.orchestrator.record_send_failed(&planned, &e, now);
            }
        }
    }
}

/// Play out a typing plan as chat actions and sleeps
async fn type_out(
    transport: &dyn RelayTransport,
    agent_id: &str,
    token: &str,
    chat_id: Option<String>,
    segments: Vec<TypingSegment>,
) {
    for segment in segments {
        signal(transport, agent_id, token, chat_id.clone(), ChatAction::Typing).await;
        tokio::time::sleep(segment.typing).await;
        if let Some(pause) = segment.pause {
            signal(transport, agent_id, token, chat_id.clone(), ChatAction::StopTyping).await;
            tokio::time::sleep(pause).await;
        }
    }
}

/// Best-effort chat action; failures only matter to the typing indicator
async fn signal(
    transport: &dyn RelayTransport,
    agent_id: &str,
    token: &str,
    chat_id: Option<String>,
    action: ChatAction,
) {
    if let Err(e) = transport.send_action(agent_id, token, chat_id, action).await {
        tracing::debug!(agent_id = %agent_id, action = %action, error = %e, "Chat action failed");
    }
}
