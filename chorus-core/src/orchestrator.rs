// ABOUTME: Per-agent conversation orchestrator deciding when to open, join, answer and end conversations.
// ABOUTME: Holds only this agent's local view; every probabilistic gate draws from an injected RandomSource.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, Config, OrchestratorConfig};
use crate::error::{RelayError, RelayResult};
use crate::message::{Message, OutgoingMessage};
use crate::metrics;
use crate::pacing::{self, PacingSimulator, TypingSegment};
use crate::personality::{self, EnhanceContext, PersonalityProfile};
use crate::relevance::{time_of_day_weight, topic_relevance};
use crate::rng::RandomSource;
use crate::scheduler::TimerQueue;
use crate::tagging::{SubjectKind, TagCandidate, TaggingTracker};

/// Noise added to invitee relevance so ties and near-ties rotate
const INVITEE_JITTER: f64 = 0.1;
/// Finished conversations are remembered this many idle windows after ending
const RETENTION_IDLE_WINDOWS: i32 = 4;
/// Longest topic derived from an unsolicited message
const ADOPTED_TOPIC_CHARS: usize = 80;

// =============================================================================
// Conversation state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Proposed,
    Active,
    WindingDown,
    Ended,
}

impl ConversationStatus {
    /// Still accepting messages toward the length count
    pub fn is_live(self) -> bool {
        matches!(self, Self::Proposed | Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Termination draw succeeded or the maximum length was reached
    Completed,
    IdleTimeout,
    /// The opener could not be sent
    Abandoned,
}

impl EndReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::IdleTimeout => "idle_timeout",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Initiator,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: String,
    pub subject_id: String,
    pub role: ParticipantRole,
    pub status: InvitationStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub topic: String,
    pub initiator: String,
    pub status: ConversationStatus,
    pub message_count: u32,
    pub participants: BTreeMap<String, Participant>,
    pub chat_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
    reply_pending: bool,
    cancel: CancellationToken,
}

impl Conversation {
    fn new(
        id: String,
        topic: String,
        initiator: &str,
        chat_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut conversation = Self {
            id,
            topic,
            initiator: initiator.to_string(),
            status: ConversationStatus::Proposed,
            message_count: 0,
            participants: BTreeMap::new(),
            chat_id,
            started_at: now,
            ended_at: None,
            last_activity: now,
            end_reason: None,
            reply_pending: false,
            cancel: CancellationToken::new(),
        };
        conversation.add_participant(initiator, ParticipantRole::Initiator);
        conversation
    }

    fn add_participant(&mut self, subject_id: &str, role: ParticipantRole) {
        let conversation_id = self.id.clone();
        self.participants
            .entry(subject_id.to_string())
            .or_insert_with(|| Participant {
                conversation_id,
                subject_id: subject_id.to_string(),
                role,
                status: InvitationStatus::Pending,
                joined_at: None,
                left_at: None,
            });
    }

    fn mark_joined(&mut self, subject_id: &str, now: DateTime<Utc>) {
        self.add_participant(subject_id, ParticipantRole::Participant);
        if let Some(participant) = self.participants.get_mut(subject_id) {
            if participant.status != InvitationStatus::Joined {
                participant.status = InvitationStatus::Joined;
                participant.joined_at = Some(now);
                participant.left_at = None;
            }
        }
    }

    fn mark_left(&mut self, subject_id: &str, now: DateTime<Utc>) {
        if let Some(participant) = self.participants.get_mut(subject_id) {
            if participant.status != InvitationStatus::Left {
                participant.status = InvitationStatus::Left;
                participant.left_at = Some(now);
            }
        }
    }

    /// Subjects that have spoken in this conversation
    pub fn speakers(&self) -> impl Iterator<Item = &str> {
        self.participants
            .values()
            .filter(|p| p.status == InvitationStatus::Joined)
            .map(|p| p.subject_id.as_str())
    }

    /// Count one message from `speaker`; promotes to ACTIVE once two subjects have spoken
    fn count_message(&mut self, speaker: &str, now: DateTime<Utc>) {
        self.message_count += 1;
        self.last_activity = now;
        self.mark_joined(speaker, now);
        if self.status == ConversationStatus::Proposed && self.speakers().count() >= 2 {
            self.status = ConversationStatus::Active;
        }
    }
}

/// Probability of ending after `count` messages: 0 below `min`, 1 at or above `max`,
/// linear in between.
pub fn termination_probability(count: u32, min: u32, max: u32) -> f64 {
    if count >= max {
        1.0
    } else if count <= min {
        0.0
    } else {
        f64::from(count - min) / f64::from(max - min)
    }
}

// =============================================================================
// Planned output
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Opener,
    Invitation,
    Reply,
    SignOff,
}

impl MessageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Opener => "opener",
            Self::Invitation => "invitation",
            Self::Reply => "reply",
            Self::SignOff => "sign_off",
        }
    }
}

/// A message the orchestrator wants sent; the runtime drafts, paces and sends it.
#[derive(Debug, Clone)]
pub struct PlannedMessage {
    pub conversation_id: String,
    pub kind: MessageKind,
    pub topic: String,
    pub chat_id: Option<String>,
    /// Subjects to @-mention, already cleared by the tagging tracker
    pub mentions: Vec<String>,
    /// Message being answered, for replies
    pub reply_to: Option<Message>,
    /// Invitee addressed, for invitations
    pub invitee: Option<String>,
    /// Fires when the conversation winds down or ends before this is sent
    pub cancel: CancellationToken,
}

/// What on_message decided, mostly for logs, metrics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDecision {
    /// Our own message echoed back
    OwnMessage,
    /// Conversation is winding down or over
    ConversationClosed,
    /// A reply to this conversation is already scheduled
    ReplyPending,
    /// This message ended the conversation
    Ending,
    /// Reply scheduled; `mandatory` when we were mentioned
    Respond { mandatory: bool },
    Declined,
}

impl ResponseDecision {
    pub fn label(self) -> &'static str {
        match self {
            Self::OwnMessage => "own_message",
            Self::ConversationClosed => "closed",
            Self::ReplyPending => "reply_pending",
            Self::Ending => "ending",
            Self::Respond { mandatory: true } => "respond_mandatory",
            Self::Respond { mandatory: false } => "respond",
            Self::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone)]
enum TimerAction {
    Opener { conversation_id: String },
    Invite { conversation_id: String, invitee: String },
    Reply { conversation_id: String, to: Box<Message> },
    SignOff { conversation_id: String },
}

impl TimerAction {
    fn conversation_id(&self) -> &str {
        match self {
            Self::Opener { conversation_id }
            | Self::Invite { conversation_id, .. }
            | Self::Reply { conversation_id, .. }
            | Self::SignOff { conversation_id } => conversation_id,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct ConversationOrchestrator {
    agent_id: String,
    chat_id: Option<String>,
    config: OrchestratorConfig,
    timezone: Tz,
    profile: PersonalityProfile,
    interests: Vec<String>,
    topics: Vec<String>,
    peer_interests: HashMap<String, Vec<String>>,
    known_agents: HashSet<String>,
    conversations: HashMap<String, Conversation>,
    timers: TimerQueue<TimerAction>,
    tagging: TaggingTracker,
    pacing: PacingSimulator,
    rng: Box<dyn RandomSource>,
}

impl std::fmt::Debug for ConversationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationOrchestrator")
            .field("agent_id", &self.agent_id)
            .field("known_agents", &self.known_agents)
            .field("conversations", &self.conversations.len())
            .field("pending_timers", &self.timers.len())
            .finish()
    }
}

impl ConversationOrchestrator {
    pub fn new(agent: &AgentConfig, config: &Config, rng: Box<dyn RandomSource>) -> Result<Self> {
        Ok(Self {
            agent_id: agent.id.clone(),
            chat_id: agent.chat_id.clone(),
            timezone: config.orchestrator.timezone()?,
            config: config.orchestrator.clone(),
            profile: agent.personality.clone(),
            interests: agent.interests(),
            topics: agent.opening_topics(),
            peer_interests: config.peer_interests(&agent.id).into_iter().collect(),
            known_agents: HashSet::new(),
            conversations: HashMap::new(),
            timers: TimerQueue::new(),
            tagging: TaggingTracker::new(agent.id.clone(), config.tagging.clone()),
            pacing: PacingSimulator::new(config.pacing.clone()),
            rng,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tagging(&self) -> &TaggingTracker {
        &self.tagging
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// The conversation currently blocking initiation, if any
    pub fn open_conversation(&self) -> Option<&Conversation> {
        self.conversations
            .values()
            .find(|c| c.status != ConversationStatus::Ended)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    // =========================================================================
    // Known agents
    // =========================================================================

    /// Replace the known-agent set with the broker's connected list
    pub fn set_known_agents<I, S>(&mut self, agents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_agents = agents
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| id != &self.agent_id)
            .collect();
    }

    pub fn agent_connected(&mut self, agent_id: &str) {
        if agent_id != self.agent_id {
            self.known_agents.insert(agent_id.to_string());
        }
    }

    pub fn agent_disconnected(&mut self, agent_id: &str, now: DateTime<Utc>) {
        self.known_agents.remove(agent_id);
        for conversation in self.conversations.values_mut() {
            conversation.mark_left(agent_id, now);
        }
    }

    pub fn is_known_agent(&self, subject_id: &str) -> bool {
        self.known_agents.contains(subject_id)
    }

    pub fn known_agents(&self) -> impl Iterator<Item = &str> {
        self.known_agents.iter().map(String::as_str)
    }

    fn subject_kind(&self, subject_id: &str) -> SubjectKind {
        if self.is_known_agent(subject_id) {
            SubjectKind::Agent
        } else {
            SubjectKind::Human
        }
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Periodic check: maybe open a conversation. Returns its id when one starts.
    pub fn check_initiation(&mut self, now: DateTime<Utc>) -> Option<String> {
        if let Some(open) = self.open_conversation() {
            tracing::debug!(
                agent_id = %self.agent_id,
                conversation_id = %open.id,
                "Conversation already open, skipping initiation"
            );
            return None;
        }

        let topic = self.rng.pick(&self.topics)?.clone();
        let relevance = topic_relevance(&topic, &self.interests, self.config.relevance_floor);
        let time_weight = time_of_day_weight(
            now,
            self.timezone,
            self.config.quiet_hours_start,
            self.config.quiet_hours_end,
            self.config.quiet_hours_weight,
        );
        let probability = self.config.base_initiation_rate * relevance * time_weight;
        if !self.rng.chance(probability) {
            tracing::trace!(
                agent_id = %self.agent_id,
                topic = %topic,
                probability,
                "Initiation draw failed"
            );
            return None;
        }

        let invitees = self.select_invitees(&topic);
        if invitees.is_empty() {
            tracing::debug!(agent_id = %self.agent_id, "No agents online to invite");
            return None;
        }

        let conversation_id = uuid::Uuid::new_v4().to_string();
        let mut conversation = Conversation::new(
            conversation_id.clone(),
            topic.clone(),
            &self.agent_id,
            self.chat_id.clone(),
            now,
        );
        for invitee in &invitees {
            conversation.add_participant(invitee, ParticipantRole::Participant);
        }

        self.timers.schedule(
            now,
            TimerAction::Opener {
                conversation_id: conversation_id.clone(),
            },
            conversation.cancel.child_token(),
        );
        for invitee in &invitees {
            let delay = self
                .rng
                .range_u64(self.config.invite_delay_min_ms, self.config.invite_delay_max_ms);
            self.timers.schedule_after(
                now,
                Duration::milliseconds(delay as i64),
                TimerAction::Invite {
                    conversation_id: conversation_id.clone(),
                    invitee: invitee.clone(),
                },
                conversation.cancel.child_token(),
            );
        }

        self.conversations
            .insert(conversation_id.clone(), conversation);
        metrics::record_conversation_started();
        tracing::info!(
            agent_id = %self.agent_id,
            conversation_id = %conversation_id,
            topic = %topic,
            invitees = ?invitees,
            "Conversation proposed"
        );
        Some(conversation_id)
    }

    /// Top 2-3 online agents by relevance to `topic` plus jitter
    fn select_invitees(&mut self, topic: &str) -> Vec<String> {
        let mut candidates: Vec<&String> = self.known_agents.iter().collect();
        candidates.sort();

        let mut scored: Vec<(f64, String)> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let interests = self
                .peer_interests
                .get(candidate)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let score = topic_relevance(topic, interests, self.config.relevance_floor)
                + self.rng.range_f64(0.0, INVITEE_JITTER);
            scored.push((score, candidate.clone()));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let wanted = self
            .rng
            .range_u64(self.config.min_invitees as u64, self.config.max_invitees as u64)
            as usize;
        scored.into_iter().take(wanted).map(|(_, id)| id).collect()
    }

    // =========================================================================
    // Participation
    // =========================================================================

    /// React to a relayed message
    pub fn on_message(&mut self, message: &Message, now: DateTime<Utc>) -> ResponseDecision {
        let decision = self.decide(message, now);
        metrics::record_response_decision(decision.label());
        tracing::debug!(
            agent_id = %self.agent_id,
            sender = %message.sender,
            sequence = message.sequence,
            conversation_id = ?message.conversation_id,
            decision = decision.label(),
            "Message evaluated"
        );
        decision
    }

    fn decide(&mut self, message: &Message, now: DateTime<Utc>) -> ResponseDecision {
        if message.sender == self.agent_id {
            return ResponseDecision::OwnMessage;
        }
        self.tagging.note_activity(&message.sender, now);

        let conversation_id = self.resolve_conversation(message, now);
        let sender_kind = self.subject_kind(&message.sender);
        let (min, max) = (self.config.min_messages, self.config.max_messages);

        let Some(conversation) = self.conversations.get_mut(&conversation_id) else {
            return ResponseDecision::ConversationClosed;
        };
        if !conversation.status.is_live() {
            return ResponseDecision::ConversationClosed;
        }
        conversation.count_message(&message.sender, now);
        let count = conversation.message_count;

        let p_end = termination_probability(count, min, max);
        if self.rng.chance(p_end) {
            self.begin_wind_down(&conversation_id, now);
            return ResponseDecision::Ending;
        }

        if self
            .conversations
            .get(&conversation_id)
            .is_some_and(|c| c.reply_pending)
        {
            return ResponseDecision::ReplyPending;
        }

        let mandatory = message.mentions(&self.agent_id);
        let respond = mandatory
            || match sender_kind {
                SubjectKind::Agent => self.rng.chance(self.config.agent_response_probability),
                SubjectKind::Human => {
                    let relevance = topic_relevance(
                        &message.body,
                        &self.interests,
                        self.config.relevance_floor,
                    );
                    self.rng
                        .chance(self.config.human_response_probability * relevance)
                }
            };
        if !respond {
            return ResponseDecision::Declined;
        }

        let delay = pacing::response_delay(
            std::time::Duration::from_millis(self.config.min_response_delay_ms),
            std::time::Duration::from_millis(self.config.max_response_delay_ms),
            &mut self.rng,
        );
        if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
            conversation.reply_pending = true;
            let token = conversation.cancel.child_token();
            self.timers.schedule_after(
                now,
                Duration::milliseconds(delay.as_millis() as i64),
                TimerAction::Reply {
                    conversation_id: conversation_id.clone(),
                    to: Box::new(message.clone()),
                },
                token,
            );
        }
        ResponseDecision::Respond { mandatory }
    }

    /// Find or adopt the local conversation a message belongs to
    fn resolve_conversation(&mut self, message: &Message, now: DateTime<Utc>) -> String {
        if let Some(id) = &message.conversation_id {
            if !self.conversations.contains_key(id) {
                let topic = self.adopted_topic(message);
                self.conversations.insert(
                    id.clone(),
                    Conversation::new(
                        id.clone(),
                        topic,
                        &message.sender,
                        message.chat_id.clone(),
                        now,
                    ),
                );
                tracing::debug!(
                    agent_id = %self.agent_id,
                    conversation_id = %id,
                    initiator = %message.sender,
                    "Adopted conversation"
                );
            }
            return id.clone();
        }

        // Untagged traffic (usually humans) joins the live conversation in the same chat
        if let Some(live) = self
            .conversations
            .values()
            .find(|c| c.status.is_live() && c.chat_id == message.chat_id)
        {
            return live.id.clone();
        }

        let id = uuid::Uuid::new_v4().to_string();
        let topic = self.adopted_topic(message);
        self.conversations.insert(
            id.clone(),
            Conversation::new(id.clone(), topic, &message.sender, message.chat_id.clone(), now),
        );
        id
    }

    fn adopted_topic(&self, message: &Message) -> String {
        message.body.chars().take(ADOPTED_TOPIC_CHARS).collect()
    }

    // =========================================================================
    // Ending
    // =========================================================================

    fn begin_wind_down(&mut self, conversation_id: &str, now: DateTime<Utc>) {
        let sign_off = self.config.sign_off;
        let delay = Duration::milliseconds(self.config.sign_off_delay_ms as i64);
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return;
        };
        if !conversation.status.is_live() {
            return;
        }

        conversation.cancel.cancel();
        conversation.cancel = CancellationToken::new();
        conversation.reply_pending = false;

        if sign_off {
            conversation.status = ConversationStatus::WindingDown;
            let token = conversation.cancel.child_token();
            tracing::info!(
                agent_id = %self.agent_id,
                conversation_id = %conversation_id,
                message_count = conversation.message_count,
                "Conversation winding down"
            );
            self.timers.schedule_after(
                now,
                delay,
                TimerAction::SignOff {
                    conversation_id: conversation_id.to_string(),
                },
                token,
            );
        } else {
            self.end_conversation(conversation_id, EndReason::Completed, now);
        }
    }

    fn end_conversation(&mut self, conversation_id: &str, reason: EndReason, now: DateTime<Utc>) {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return;
        };
        if conversation.status == ConversationStatus::Ended {
            return;
        }
        conversation.cancel.cancel();
        conversation.status = ConversationStatus::Ended;
        conversation.ended_at = Some(now);
        conversation.end_reason = Some(reason);
        conversation.reply_pending = false;
        metrics::record_conversation_ended(reason.label());
        tracing::info!(
            agent_id = %self.agent_id,
            conversation_id = %conversation_id,
            message_count = conversation.message_count,
            reason = reason.label(),
            "Conversation ended"
        );
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Advance time: expire idle conversations and return messages now due.
    ///
    /// A conversation stuck winding down (its sign-off never went out) idles
    /// out like a live one.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<PlannedMessage> {
        let idle_timeout = self.config.idle_timeout();
        let idle: Vec<String> = self
            .conversations
            .values()
            .filter(|c| {
                c.status != ConversationStatus::Ended && now - c.last_activity >= idle_timeout
            })
            .map(|c| c.id.clone())
            .collect();
        for conversation_id in idle {
            self.end_conversation(&conversation_id, EndReason::IdleTimeout, now);
        }

        let mut planned = Vec::new();
        for action in self.timers.drain_due(now) {
            match self.fire(action, now) {
                Ok(message) => planned.push(message),
                Err(e) => tracing::debug!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "Timer fired for closed conversation, skipping"
                ),
            }
        }

        let retention = idle_timeout * RETENTION_IDLE_WINDOWS;
        self.conversations.retain(|_, c| {
            c.status != ConversationStatus::Ended
                || c.ended_at.is_some_and(|ended| now - ended < retention)
        });
        self.timers.purge_cancelled();

        planned
    }

    fn fire(&mut self, action: TimerAction, now: DateTime<Utc>) -> RelayResult<PlannedMessage> {
        let conversation_id = action.conversation_id().to_string();
        let Some(conversation) = self.conversations.get(&conversation_id) else {
            return Err(RelayError::Scheduling(format!(
                "conversation {} is no longer tracked",
                conversation_id
            )));
        };
        let status = conversation.status;
        let topic = conversation.topic.clone();
        let chat_id = conversation.chat_id.clone().or_else(|| self.chat_id.clone());
        let cancel = conversation.cancel.child_token();

        let expected_live = !matches!(action, TimerAction::SignOff { .. });
        let allowed = if expected_live {
            status.is_live()
        } else {
            status == ConversationStatus::WindingDown
        };
        if !allowed {
            return Err(RelayError::Scheduling(format!(
                "conversation {} is {:?}",
                conversation_id, status
            )));
        }

        let mut planned = PlannedMessage {
            conversation_id: conversation_id.clone(),
            kind: MessageKind::Opener,
            topic,
            chat_id,
            mentions: Vec::new(),
            reply_to: None,
            invitee: None,
            cancel,
        };

        match action {
            TimerAction::Opener { .. } => {}
            TimerAction::Invite { invitee, .. } => {
                planned.kind = MessageKind::Invitation;
                if self.tagging.can_tag(&invitee, SubjectKind::Agent, now) {
                    planned.mentions.push(invitee.clone());
                }
                planned.invitee = Some(invitee);
            }
            TimerAction::Reply { to, .. } => {
                planned.kind = MessageKind::Reply;
                let kind = self.subject_kind(&to.sender);
                if to.mentions(&self.agent_id) || kind == SubjectKind::Human {
                    let candidate = TagCandidate {
                        subject_id: to.sender.clone(),
                        kind,
                        relevance: topic_relevance(
                            &to.body,
                            &self.interests,
                            self.config.relevance_floor,
                        ),
                    };
                    planned.mentions =
                        self.tagging
                            .select_targets(&[candidate], now, &mut self.rng);
                }
                planned.reply_to = Some(*to);
            }
            TimerAction::SignOff { .. } => {
                planned.kind = MessageKind::SignOff;
            }
        }
        Ok(planned)
    }

    // =========================================================================
    // Send outcomes
    // =========================================================================

    /// Whether `planned` should still go out; state may have moved on since it fired.
    pub fn is_still_wanted(&self, planned: &PlannedMessage) -> bool {
        if planned.cancel.is_cancelled() {
            return false;
        }
        self.conversations
            .get(&planned.conversation_id)
            .is_some_and(|c| match planned.kind {
                MessageKind::SignOff => c.status == ConversationStatus::WindingDown,
                _ => c.status.is_live(),
            })
    }

    fn settle_reply(&mut self, planned: &PlannedMessage) {
        if planned.kind != MessageKind::Reply {
            return;
        }
        if let Some(conversation) = self.conversations.get_mut(&planned.conversation_id) {
            conversation.reply_pending = false;
        }
    }

    /// Turn a producer draft into the outgoing message, in this agent's voice.
    pub fn compose(&mut self, planned: &PlannedMessage, draft: &str) -> OutgoingMessage {
        let context = match planned.kind {
            MessageKind::Opener | MessageKind::Invitation => EnhanceContext::opener(),
            MessageKind::Reply => EnhanceContext::reply(),
            MessageKind::SignOff => EnhanceContext::sign_off(),
        };
        let mut body = personality::enhance(draft, &self.profile, &context, &mut self.rng);
        if body.is_empty() {
            body = draft.trim().to_string();
        }
        for subject in planned.mentions.iter().rev() {
            let tag = format!("@{}", subject);
            if !body.contains(&tag) {
                body = format!("{} {}", tag, body);
            }
        }

        let mut outgoing = OutgoingMessage::new(body)
            .in_chat(planned.chat_id.clone())
            .in_conversation(planned.conversation_id.clone());
        for subject in &planned.mentions {
            outgoing = outgoing.mentioning(subject.clone());
        }
        outgoing
    }

    /// Typing bursts for a message of `length` characters
    pub fn typing_plan(&mut self, length: usize) -> Vec<TypingSegment> {
        self.pacing.simulate(length, &self.profile, &mut self.rng)
    }

    /// The broker accepted `sent`; count it, record tags, advance state.
    pub fn record_sent(&mut self, planned: &PlannedMessage, sent: &Message, now: DateTime<Utc>) {
        self.settle_reply(planned);
        for subject in &planned.mentions {
            if sent.mentions(subject) {
                self.tagging.record_tag(subject, &self.agent_id, now);
            }
        }

        if planned.kind == MessageKind::SignOff {
            self.end_conversation(&planned.conversation_id, EndReason::Completed, now);
            return;
        }

        let (min, max) = (self.config.min_messages, self.config.max_messages);
        let agent_id = self.agent_id.clone();
        let Some(conversation) = self.conversations.get_mut(&planned.conversation_id) else {
            return;
        };
        if !conversation.status.is_live() {
            return;
        }
        conversation.count_message(&agent_id, now);
        let count = conversation.message_count;

        if self.rng.chance(termination_probability(count, min, max)) {
            self.begin_wind_down(&planned.conversation_id, now);
        }
    }

    /// The send failed; log it and unwind whatever depended on it.
    pub fn record_send_failed(
        &mut self,
        planned: &PlannedMessage,
        error: &RelayError,
        now: DateTime<Utc>,
    ) {
        metrics::record_send_failure(error.kind());
        tracing::warn!(
            agent_id = %self.agent_id,
            conversation_id = %planned.conversation_id,
            kind = planned.kind.label(),
            error = %error,
            "Send failed"
        );
        self.settle_reply(planned);
        match planned.kind {
            MessageKind::Opener => {
                self.end_conversation(&planned.conversation_id, EndReason::Abandoned, now);
                self.conversations.remove(&planned.conversation_id);
            }
            MessageKind::SignOff => {
                self.end_conversation(&planned.conversation_id, EndReason::Completed, now);
            }
            MessageKind::Invitation | MessageKind::Reply => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{SeededRandom, SequenceRandom};

    fn config() -> Config {
        let mut config = Config::default();
        config.orchestrator.timezone = "UTC".to_string();
        config
    }

    fn agent(id: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            token: format!("{}-token", id),
            chat_id: Some("group".to_string()),
            personality: PersonalityProfile::default(),
            topics: vec!["rust".to_string()],
            seed: None,
        }
    }

    fn message(sender: &str, conversation: &str, body: &str) -> Message {
        Message {
            id: format!("{}-{}", sender, body),
            sequence: 1,
            sender: sender.to_string(),
            chat_id: Some("group".to_string()),
            conversation_id: Some(conversation.to_string()),
            body: body.to_string(),
            mentions: vec![],
            hop_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_termination_probability_schedule() {
        assert_eq!(termination_probability(4, 5, 10), 0.0);
        assert_eq!(termination_probability(5, 5, 10), 0.0);
        assert!((termination_probability(7, 5, 10) - 0.4).abs() < 1e-9);
        assert_eq!(termination_probability(10, 5, 10), 1.0);
        assert_eq!(termination_probability(12, 5, 10), 1.0);
        assert_eq!(termination_probability(5, 5, 5), 1.0);
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut orch = ConversationOrchestrator::new(
            &agent("eth"),
            &config(),
            Box::new(SequenceRandom::constant(0.0)),
        )
        .unwrap();
        let decision = orch.on_message(&message("eth", "c1", "hi"), Utc::now());
        assert_eq!(decision, ResponseDecision::OwnMessage);
        assert!(orch.conversation("c1").is_none());
    }

    #[test]
    fn test_mention_is_mandatory() {
        // 0.99 fails every probabilistic gate
        let mut orch = ConversationOrchestrator::new(
            &agent("eth"),
            &config(),
            Box::new(SequenceRandom::constant(0.99)),
        )
        .unwrap();
        orch.agent_connected("vc");
        let mut msg = message("vc", "c1", "hello");
        msg.mentions.push("eth".to_string());
        assert_eq!(
            orch.on_message(&msg, Utc::now()),
            ResponseDecision::Respond { mandatory: true }
        );
        let plain = message("vc", "c2", "hello again");
        assert_eq!(orch.on_message(&plain, Utc::now()), ResponseDecision::Declined);
    }

    #[test]
    fn test_initiation_blocked_while_open() {
        let mut orch = ConversationOrchestrator::new(
            &agent("eth"),
            &config(),
            Box::new(SequenceRandom::constant(0.0)),
        )
        .unwrap();
        orch.set_known_agents(["eth", "vc", "mo"]);
        let now = Utc::now();
        let first = orch.check_initiation(now);
        assert!(first.is_some());
        assert!(orch.check_initiation(now).is_none());
    }

    #[test]
    fn test_idle_timeout_ends_below_min() {
        let mut orch = ConversationOrchestrator::new(
            &agent("eth"),
            &config(),
            Box::new(SeededRandom::from_seed(9)),
        )
        .unwrap();
        let now = Utc::now();
        orch.on_message(&message("vc", "c1", "hi"), now);
        orch.tick(now + Duration::seconds(901));
        let conversation = orch.conversation("c1").unwrap();
        assert_eq!(conversation.status, ConversationStatus::Ended);
        assert_eq!(conversation.end_reason, Some(EndReason::IdleTimeout));
        assert_eq!(conversation.message_count, 1);
    }
}
