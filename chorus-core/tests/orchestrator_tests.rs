// ABOUTME: Integration tests for ConversationOrchestrator lifecycle, timers, tagging and termination.
// ABOUTME: Drives time explicitly; probabilistic gates use seeded or scripted random sources.

use chorus_core::config::{AgentConfig, Config};
use chorus_core::orchestrator::{termination_probability, EndReason};
use chorus_core::rng::{SeededRandom, SequenceRandom};
use chorus_core::tagging::SubjectKind;
use chorus_core::{
    ConversationOrchestrator, ConversationStatus, Message, MessageKind, RandomSource, RelayError,
    ResponseDecision,
};
use chrono::{DateTime, Duration, Utc};

fn config(min: u32, max: u32) -> Config {
    let mut config = Config::default();
    config.orchestrator.timezone = "UTC".to_string();
    config.orchestrator.min_messages = min;
    config.orchestrator.max_messages = max;
    config
}

fn agent(id: &str) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        token: format!("{}-token", id),
        chat_id: Some("group".to_string()),
        personality: Default::default(),
        topics: vec!["rust".to_string()],
        seed: None,
    }
}

fn orchestrator(
    id: &str,
    config: &Config,
    rng: impl RandomSource + 'static,
) -> ConversationOrchestrator {
    ConversationOrchestrator::new(&agent(id), config, Box::new(rng)).unwrap()
}

fn message(sender: &str, conversation: &str, body: &str, sequence: u64) -> Message {
    Message {
        id: format!("{}-{}", sender, sequence),
        sequence,
        sender: sender.to_string(),
        chat_id: Some("group".to_string()),
        conversation_id: Some(conversation.to_string()),
        body: body.to_string(),
        mentions: vec![],
        hop_count: 0,
        created_at: Utc::now(),
    }
}

/// Feed messages from alternating peers until the conversation stops being live.
fn run_until_closed(orch: &mut ConversationOrchestrator, now: DateTime<Utc>) -> u32 {
    let peers = ["vc", "mo"];
    for i in 0..100u64 {
        let sender = peers[(i % 2) as usize];
        orch.on_message(&message(sender, "c1", "still talking", i + 1), now);
        let conversation = orch.conversation("c1").unwrap();
        if !conversation.status.is_live() {
            return conversation.message_count;
        }
    }
    panic!("conversation never closed");
}

// =============================================================================
// Termination schedule
// =============================================================================

#[test]
fn test_termination_probability_is_linear() {
    assert_eq!(termination_probability(0, 5, 10), 0.0);
    assert!((termination_probability(6, 5, 10) - 0.2).abs() < 1e-9);
    assert!((termination_probability(8, 5, 10) - 0.6).abs() < 1e-9);
    assert_eq!(termination_probability(10, 5, 10), 1.0);
}

#[test]
fn test_length_distribution_min5_max10() {
    let config = config(5, 10);
    let now = Utc::now();
    let runs = 2000u32;
    let mut total = 0u32;
    for seed in 0..runs {
        let mut orch = orchestrator("eth", &config, SeededRandom::from_seed(u64::from(seed)));
        let length = run_until_closed(&mut orch, now);
        assert!(
            (6..=10).contains(&length),
            "seed {} ended after {} messages",
            seed,
            length
        );
        total += length;
    }
    // Expected mean is 7.51
    let mean = f64::from(total) / f64::from(runs);
    assert!((7.3..=7.7).contains(&mean), "mean length {}", mean);
}

#[test]
fn test_never_ends_before_min() {
    // Every draw succeeds: ends on the first message with nonzero probability
    let mut orch = orchestrator("eth", &config(5, 10), SequenceRandom::constant(0.0));
    assert_eq!(run_until_closed(&mut orch, Utc::now()), 6);
}

#[test]
fn test_always_ends_at_max() {
    // Every draw fails: only the certain end at max applies
    let mut orch = orchestrator("eth", &config(5, 10), SequenceRandom::constant(0.99));
    assert_eq!(run_until_closed(&mut orch, Utc::now()), 10);
}

#[test]
fn test_min_equals_max_ends_exactly() {
    let mut orch = orchestrator("eth", &config(4, 4), SeededRandom::from_seed(3));
    assert_eq!(run_until_closed(&mut orch, Utc::now()), 4);
}

// =============================================================================
// Initiation
// =============================================================================

#[test]
fn test_initiation_schedules_opener_then_invites() {
    let mut orch = orchestrator("vc", &config(5, 15), SequenceRandom::constant(0.0));
    orch.set_known_agents(["eth", "mo", "vc"]);
    let now = Utc::now();

    let conversation_id = orch.check_initiation(now).expect("initiates");
    let conversation = orch.conversation(&conversation_id).unwrap();
    assert_eq!(conversation.status, ConversationStatus::Proposed);
    assert_eq!(conversation.initiator, "vc");
    assert_eq!(conversation.topic, "rust");

    let opener = orch.tick(now);
    assert_eq!(opener.len(), 1);
    assert_eq!(opener[0].kind, MessageKind::Opener);
    assert!(opener[0].mentions.is_empty());

    // Lowest draw puts every invite at invite_delay_min_ms
    assert!(orch.tick(now + Duration::milliseconds(1999)).is_empty());
    let invites = orch.tick(now + Duration::milliseconds(2000));
    assert_eq!(invites.len(), 2);
    let mut invitees: Vec<_> = invites
        .iter()
        .map(|p| {
            assert_eq!(p.kind, MessageKind::Invitation);
            assert_eq!(p.mentions, vec![p.invitee.clone().unwrap()]);
            p.invitee.clone().unwrap()
        })
        .collect();
    invitees.sort();
    assert_eq!(invitees, vec!["eth", "mo"]);
}

#[test]
fn test_no_initiation_without_peers() {
    let mut orch = orchestrator("vc", &config(5, 15), SequenceRandom::constant(0.0));
    assert!(orch.check_initiation(Utc::now()).is_none());
    assert_eq!(orch.conversations().count(), 0);
}

#[test]
fn test_initiation_suppressed_by_zero_rate() {
    let mut config = config(5, 15);
    config.orchestrator.base_initiation_rate = 0.0;
    let mut orch = orchestrator("vc", &config, SequenceRandom::constant(0.0));
    orch.set_known_agents(["eth"]);
    assert!(orch.check_initiation(Utc::now()).is_none());
}

#[test]
fn test_quiet_hours_suppress_initiation() {
    let mut config = config(5, 15);
    config.orchestrator.quiet_hours_start = Some(22);
    config.orchestrator.quiet_hours_end = Some(6);
    config.orchestrator.quiet_hours_weight = 0.0;
    let mut orch = orchestrator("vc", &config, SequenceRandom::constant(0.0));
    orch.set_known_agents(["eth"]);

    let midnight = DateTime::parse_from_rfc3339("2026-03-01T00:30:00Z")
        .unwrap()
        .with_timezone(&Utc);
    assert!(orch.check_initiation(midnight).is_none());
    let noon = midnight + Duration::hours(12);
    assert!(orch.check_initiation(noon).is_some());
}

#[test]
fn test_opener_failure_abandons_conversation() {
    let mut orch = orchestrator("vc", &config(5, 15), SequenceRandom::constant(0.0));
    orch.set_known_agents(["eth"]);
    let now = Utc::now();
    let conversation_id = orch.check_initiation(now).unwrap();
    let opener = orch.tick(now).remove(0);

    orch.record_send_failed(
        &opener,
        &RelayError::UnreachablePeer("broker down".to_string()),
        now,
    );
    assert!(orch.conversation(&conversation_id).is_none());
    // Pending invitations die with it
    assert!(orch.tick(now + Duration::seconds(30)).is_empty());
    assert!(orch.open_conversation().is_none());
}

// =============================================================================
// Participation
// =============================================================================

#[test]
fn test_unknown_conversation_is_adopted() {
    let mut orch = orchestrator("eth", &config(5, 15), SeededRandom::from_seed(1));
    let now = Utc::now();
    orch.on_message(&message("vc", "c9", "what about borrowck?", 1), now);
    let conversation = orch.conversation("c9").unwrap();
    assert_eq!(conversation.initiator, "vc");
    assert_eq!(conversation.message_count, 1);
    assert_eq!(conversation.status, ConversationStatus::Proposed);
}

#[test]
fn test_two_speakers_activate() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.99));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "one", 1), now);
    orch.on_message(&message("mo", "c1", "two", 2), now);
    let conversation = orch.conversation("c1").unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    let mut speakers: Vec<_> = conversation.speakers().collect();
    speakers.sort();
    assert_eq!(speakers, vec!["mo", "vc"]);
}

#[test]
fn test_single_pending_reply_per_conversation() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.0));
    let now = Utc::now();
    assert_eq!(
        orch.on_message(&message("vc", "c1", "one", 1), now),
        ResponseDecision::Respond { mandatory: false }
    );
    assert_eq!(
        orch.on_message(&message("mo", "c1", "two", 2), now),
        ResponseDecision::ReplyPending
    );
}

#[test]
fn test_mandatory_reply_mentions_sender_once_per_cooldown() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.0));
    orch.agent_connected("vc");
    let now = Utc::now();

    let mut question = message("vc", "c1", "@eth thoughts on rust?", 1);
    question.mentions.push("eth".to_string());
    assert_eq!(
        orch.on_message(&question, now),
        ResponseDecision::Respond { mandatory: true }
    );

    // Lowest draw gives the minimum response delay
    let due = now + Duration::milliseconds(1500);
    let reply = orch.tick(due).remove(0);
    assert_eq!(reply.kind, MessageKind::Reply);
    assert_eq!(reply.mentions, vec!["vc"]);
    assert_eq!(reply.reply_to.as_ref().unwrap().id, question.id);

    let outgoing = orch.compose(&reply, "It grows on you");
    assert!(outgoing.body.contains("@vc"));
    assert_eq!(outgoing.mentions, vec!["vc"]);
    assert_eq!(outgoing.conversation_id.as_deref(), Some("c1"));

    // Cooldown starts only once the broker accepted the message
    assert!(orch.tagging().can_tag("vc", SubjectKind::Agent, due));
    let mut sent = message("eth", "c1", &outgoing.body, 2);
    sent.mentions = outgoing.mentions.clone();
    orch.record_sent(&reply, &sent, due);
    assert!(!orch.tagging().can_tag("vc", SubjectKind::Agent, due));

    // Next mandatory reply still happens, but without the tag
    let mut again = message("vc", "c1", "@eth and?", 3);
    again.mentions.push("eth".to_string());
    orch.on_message(&again, due);
    let second = orch.tick(due + Duration::milliseconds(1500)).remove(0);
    assert_eq!(second.kind, MessageKind::Reply);
    assert!(second.mentions.is_empty());
}

#[test]
fn test_reply_to_unmentioning_agent_has_no_tag() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.0));
    orch.agent_connected("vc");
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "rust is neat", 1), now);
    let reply = orch.tick(now + Duration::seconds(10)).remove(0);
    assert!(reply.mentions.is_empty());
}

// =============================================================================
// Ending
// =============================================================================

#[test]
fn test_wind_down_cancels_pending_reply_and_signs_off() {
    let mut orch = orchestrator("eth", &config(1, 2), SequenceRandom::constant(0.0));
    let now = Utc::now();

    // Count 1 = min, no end; reply gets scheduled
    assert_eq!(
        orch.on_message(&message("vc", "c1", "one", 1), now),
        ResponseDecision::Respond { mandatory: false }
    );
    // Count 2 = max, certain end
    assert_eq!(
        orch.on_message(&message("mo", "c1", "two", 2), now),
        ResponseDecision::Ending
    );
    assert_eq!(
        orch.conversation("c1").unwrap().status,
        ConversationStatus::WindingDown
    );
    assert_eq!(
        orch.on_message(&message("vc", "c1", "three", 3), now),
        ResponseDecision::ConversationClosed
    );

    // Sign-off comes due after sign_off_delay_ms; the reply never fires
    let due = orch.tick(now + Duration::seconds(10));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].kind, MessageKind::SignOff);

    let sent = message("eth", "c1", "gotta run", 4);
    orch.record_sent(&due[0], &sent, now + Duration::seconds(10));
    let conversation = orch.conversation("c1").unwrap();
    assert_eq!(conversation.status, ConversationStatus::Ended);
    assert_eq!(conversation.end_reason, Some(EndReason::Completed));
    assert_eq!(conversation.message_count, 2);
}

#[test]
fn test_sign_off_disabled_ends_immediately() {
    let mut config = config(1, 2);
    config.orchestrator.sign_off = false;
    let mut orch = orchestrator("eth", &config, SequenceRandom::constant(0.99));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "one", 1), now);
    orch.on_message(&message("mo", "c1", "two", 2), now);
    assert_eq!(
        orch.conversation("c1").unwrap().status,
        ConversationStatus::Ended
    );
    assert!(orch.tick(now + Duration::minutes(1)).is_empty());
}

#[test]
fn test_idle_timeout_cancels_scheduled_reply() {
    let mut config = config(5, 15);
    config.orchestrator.idle_timeout_secs = 1;
    config.orchestrator.min_response_delay_ms = 5000;
    config.orchestrator.max_response_delay_ms = 5000;
    let mut orch = orchestrator("eth", &config, SequenceRandom::constant(0.0));
    let now = Utc::now();

    orch.on_message(&message("vc", "c1", "anyone?", 1), now);
    assert!(orch.tick(now + Duration::seconds(2)).is_empty());
    let conversation = orch.conversation("c1").unwrap();
    assert_eq!(conversation.end_reason, Some(EndReason::IdleTimeout));
    assert!(orch.tick(now + Duration::seconds(6)).is_empty());
}

#[test]
fn test_ended_conversations_are_forgotten_after_retention() {
    let mut config = config(5, 15);
    config.orchestrator.idle_timeout_secs = 10;
    let mut orch = orchestrator("eth", &config, SequenceRandom::constant(0.99));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "hello", 1), now);

    orch.tick(now + Duration::seconds(10));
    assert!(orch.conversation("c1").is_some());
    orch.tick(now + Duration::seconds(10 + 40));
    assert!(orch.conversation("c1").is_none());
}

#[test]
fn test_own_sent_messages_count_toward_length() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.99));
    orch.agent_connected("vc");
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "hi", 1), now);

    let mut question = message("vc", "c1", "@eth you there?", 2);
    question.mentions.push("eth".to_string());
    orch.on_message(&question, now);
    let reply = orch.tick(now + Duration::seconds(10)).remove(0);
    let sent = message("eth", "c1", "yep", 3);
    orch.record_sent(&reply, &sent, now + Duration::seconds(10));

    let conversation = orch.conversation("c1").unwrap();
    assert_eq!(conversation.message_count, 3);
    assert_eq!(conversation.status, ConversationStatus::Active);
}

#[test]
fn test_reply_stays_pending_until_sent() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.0));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "one", 1), now);

    // Fired but still being drafted and typed
    let due = now + Duration::seconds(10);
    let reply = orch.tick(due).remove(0);
    assert_eq!(
        orch.on_message(&message("mo", "c1", "two", 2), due),
        ResponseDecision::ReplyPending
    );

    orch.record_sent(&reply, &message("eth", "c1", "sure", 3), due);
    assert_eq!(
        orch.on_message(&message("mo", "c1", "three", 4), due),
        ResponseDecision::Respond { mandatory: false }
    );
}

#[test]
fn test_failed_reply_releases_pending_slot() {
    let mut orch = orchestrator("eth", &config(5, 15), SequenceRandom::constant(0.0));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "one", 1), now);

    let due = now + Duration::seconds(10);
    let reply = orch.tick(due).remove(0);
    orch.record_send_failed(
        &reply,
        &RelayError::UnreachablePeer("connection refused".to_string()),
        due,
    );
    assert_eq!(
        orch.on_message(&message("mo", "c1", "two", 2), due),
        ResponseDecision::Respond { mandatory: false }
    );
}

#[test]
fn test_in_flight_reply_unwanted_after_wind_down() {
    let mut orch = orchestrator("eth", &config(1, 2), SequenceRandom::constant(0.0));
    let now = Utc::now();
    orch.on_message(&message("vc", "c1", "one", 1), now);

    let due = now + Duration::seconds(10);
    let reply = orch.tick(due).remove(0);
    assert_eq!(reply.kind, MessageKind::Reply);
    assert!(orch.is_still_wanted(&reply));

    assert_eq!(
        orch.on_message(&message("mo", "c1", "two", 2), due),
        ResponseDecision::Ending
    );
    assert!(reply.cancel.is_cancelled());
    assert!(!orch.is_still_wanted(&reply));

    let sign_off = orch.tick(due + Duration::seconds(10)).remove(0);
    assert_eq!(sign_off.kind, MessageKind::SignOff);
    assert!(orch.is_still_wanted(&sign_off));
}

#[test]
fn test_lost_sign_off_idles_out_and_unblocks_initiation() {
    let mut config = config(1, 2);
    config.orchestrator.idle_timeout_secs = 60;
    let mut orch = orchestrator("eth", &config, SequenceRandom::constant(0.0));
    orch.set_known_agents(["vc", "mo"]);
    let now = Utc::now();

    orch.on_message(&message("vc", "c1", "one", 1), now);
    orch.on_message(&message("mo", "c1", "two", 2), now);
    assert_eq!(
        orch.conversation("c1").unwrap().status,
        ConversationStatus::WindingDown
    );

    // Sign-off comes due but never reaches the broker
    let due = orch.tick(now + Duration::seconds(10));
    assert_eq!(due[0].kind, MessageKind::SignOff);
    drop(due);
    assert!(orch.open_conversation().is_some());

    let later = now + Duration::seconds(61);
    orch.tick(later);
    let conversation = orch.conversation("c1").unwrap();
    assert_eq!(conversation.status, ConversationStatus::Ended);
    assert_eq!(conversation.end_reason, Some(EndReason::IdleTimeout));
    assert!(orch.open_conversation().is_none());
    assert!(orch.check_initiation(later).is_some());
}
