// ABOUTME: Prometheus metrics for relay traffic, registry churn and conversation decisions.
// ABOUTME: Thin wrappers over the metrics facade so call sites stay one-liners.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

pub fn record_message_relayed(recipients: usize) {
    metrics::counter!("chorus_messages_relayed_total").increment(1);
    metrics::counter!("chorus_deliveries_enqueued_total").increment(recipients as u64);
}

pub fn record_message_rejected(reason: &'static str) {
    metrics::counter!("chorus_messages_rejected_total", "reason" => reason).increment(1);
}

pub fn record_action_forwarded() {
    metrics::counter!("chorus_actions_forwarded_total").increment(1);
}

pub fn set_connected_agents(count: usize) {
    metrics::gauge!("chorus_agents_connected").set(count as f64);
}

pub fn record_agent_expired() {
    metrics::counter!("chorus_agents_expired_total").increment(1);
}

pub fn record_conversation_started() {
    metrics::counter!("chorus_conversations_started_total").increment(1);
}

pub fn record_conversation_ended(reason: &'static str) {
    metrics::counter!("chorus_conversations_ended_total", "reason" => reason).increment(1);
}

pub fn record_response_decision(decision: &'static str) {
    metrics::counter!("chorus_responses_total", "decision" => decision).increment(1);
}

pub fn record_send_failure(kind: &'static str) {
    metrics::counter!("chorus_send_failures_total", "kind" => kind).increment(1);
}
