// ABOUTME: Integration tests for AgentRuntime over an in-process broker.
// ABOUTME: Two agents converse through LocalRelay with scripted producers and millisecond pacing.

use async_trait::async_trait;
use chorus::runtime::AgentRuntime;
use chorus_core::{
    config::{AgentConfig, Config},
    message::{ChatAction, OutgoingMessage, PollBatch},
    LocalRelay, Message, RelayBroker, RelayError, RelayResult, RelayTransport,
};
use chorus_producer::{ContentProducer, ScriptedProducer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config(initiation_rate: f64) -> Config {
    let mut config = Config::default();
    let orch = &mut config.orchestrator;
    orch.timezone = "UTC".to_string();
    orch.check_interval_secs = 1;
    orch.poll_interval_ms = 20;
    orch.heartbeat_interval_secs = 1;
    orch.base_initiation_rate = initiation_rate;
    orch.relevance_floor = 1.0;
    orch.agent_response_probability = 0.0;
    orch.min_response_delay_ms = 0;
    orch.max_response_delay_ms = 10;
    orch.min_invitees = 2;
    orch.max_invitees = 2;
    orch.invite_delay_min_ms = 0;
    orch.invite_delay_max_ms = 10;
    orch.sign_off_delay_ms = 0;
    config.pacing.burst_min_ms = 1;
    config.pacing.burst_max_ms = 5;
    config.pacing.max_total_ms = 10;
    config.pacing.pause_probability = 0.0;
    config
}

fn agent(id: &str, seed: u64) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        token: format!("{}-token", id),
        chat_id: Some("group".to_string()),
        personality: Default::default(),
        topics: vec!["rust".to_string()],
        seed: Some(seed),
    }
}

fn producer() -> Arc<dyn ContentProducer> {
    Arc::new(ScriptedProducer::new().with_lines(vec!["that sounds about right".to_string()]))
}

fn relay() -> (Arc<RelayBroker>, Arc<dyn RelayTransport>) {
    let broker = Arc::new(RelayBroker::new(3, chrono::Duration::seconds(300)));
    let transport: Arc<dyn RelayTransport> = Arc::new(LocalRelay::new(Arc::clone(&broker)));
    (broker, transport)
}

/// Local transport whose broker can be replaced, as if the broker restarted
struct RestartableRelay {
    broker: Mutex<Arc<RelayBroker>>,
}

impl RestartableRelay {
    fn new(broker: Arc<RelayBroker>) -> Self {
        Self {
            broker: Mutex::new(broker),
        }
    }

    fn restart(&self, broker: Arc<RelayBroker>) {
        *self.broker.lock().unwrap() = broker;
    }

    fn current(&self) -> LocalRelay {
        LocalRelay::new(Arc::clone(&self.broker.lock().unwrap()))
    }
}

#[async_trait]
impl RelayTransport for RestartableRelay {
    async fn register(&self, agent_id: &str, token: &str) -> RelayResult<Vec<String>> {
        self.current().register(agent_id, token).await
    }

    async fn unregister(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        self.current().unregister(agent_id, token).await
    }

    async fn heartbeat(&self, agent_id: &str, token: &str) -> RelayResult<()> {
        self.current().heartbeat(agent_id, token).await
    }

    async fn poll(&self, agent_id: &str, token: &str, offset: u64) -> RelayResult<PollBatch> {
        self.current().poll(agent_id, token, offset).await
    }

    async fn send(
        &self,
        agent_id: &str,
        token: &str,
        message: OutgoingMessage,
    ) -> RelayResult<Message> {
        self.current().send(agent_id, token, message).await
    }

    async fn send_action(
        &self,
        agent_id: &str,
        token: &str,
        chat_id: Option<String>,
        action: ChatAction,
    ) -> RelayResult<()> {
        self.current()
            .send_action(agent_id, token, chat_id, action)
            .await
    }

    fn name(&self) -> &'static str {
        "restartable"
    }
}

fn group_message(body: &str, conversation_id: &str) -> OutgoingMessage {
    OutgoingMessage::new(body)
        .in_chat(Some("group".to_string()))
        .in_conversation(conversation_id)
}

/// Every message the observer has been sent so far
fn observed(broker: &RelayBroker) -> Vec<Message> {
    broker
        .poll("observer", "observer-token", 0)
        .unwrap()
        .messages()
        .cloned()
        .collect()
}

async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_poll_once_adopts_conversation() {
    let (broker, transport) = relay();
    let config = fast_config(0.0);
    let mut runtime =
        AgentRuntime::new(agent("eth", 1), &config, Arc::clone(&transport), producer()).unwrap();
    runtime.register().await.unwrap();
    assert!(runtime.is_registered());

    broker.register("vc", "vc-token").unwrap();
    broker
        .send(
            "vc",
            "vc-token",
            OutgoingMessage::new("anyone tried the new trait solver?")
                .in_chat(Some("group".to_string()))
                .in_conversation("conv-1"),
        )
        .unwrap();

    let seen = runtime.poll_once().await.unwrap();
    assert_eq!(seen, 1);
    // eth=1, vc connected=2, message=3
    assert_eq!(runtime.offset(), 4);
    assert!(runtime.orchestrator().is_known_agent("vc"));
    assert!(runtime.orchestrator().conversation("conv-1").is_some());

    // Acknowledged updates are not processed twice
    assert_eq!(runtime.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_two_agents_converse() {
    let (broker, transport) = relay();
    broker.register("observer", "observer-token").unwrap();

    let eth = AgentRuntime::new(
        agent("eth", 11),
        &fast_config(0.0),
        Arc::clone(&transport),
        producer(),
    )
    .unwrap();
    let vc = AgentRuntime::new(
        agent("vc", 22),
        &fast_config(1.0),
        Arc::clone(&transport),
        producer(),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let eth_task = tokio::spawn(eth.run(shutdown.child_token()));
    let vc_task = tokio::spawn(vc.run(shutdown.child_token()));

    let conversed = wait_for(Duration::from_secs(10), || {
        let messages = observed(&broker);
        messages.iter().any(|invite| {
            invite.sender == "vc"
                && invite.mentions.iter().any(|m| m == "eth")
                && messages.iter().any(|reply| {
                    reply.sender == "eth" && reply.conversation_id == invite.conversation_id
                })
        })
    })
    .await;

    shutdown.cancel();
    eth_task.await.unwrap().unwrap();
    vc_task.await.unwrap().unwrap();

    assert!(conversed, "eth never answered vc's invitation");
    let messages = observed(&broker);
    assert!(messages.iter().all(|m| m.hop_count == 0));
    assert!(messages.iter().all(|m| m.conversation_id.is_some()));

    // Both runtimes unregistered on shutdown
    assert_eq!(broker.connected_agents(), vec!["observer"]);
}

#[tokio::test]
async fn test_runtime_reregisters_after_removal() {
    let (broker, transport) = relay();
    let runtime = AgentRuntime::new(
        agent("eth", 5),
        &fast_config(0.0),
        Arc::clone(&transport),
        producer(),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(runtime.run(shutdown.child_token()));

    assert!(wait_for(Duration::from_secs(2), || broker.is_registered("eth")).await);
    broker.unregister("eth", "eth-token").unwrap();
    assert!(!broker.is_registered("eth"));

    let back = wait_for(Duration::from_secs(3), || broker.is_registered("eth")).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert!(back, "runtime did not register again");
    assert!(!broker.is_registered("eth"));
}

#[tokio::test]
async fn test_reregistration_after_broker_restart_reads_new_messages() {
    let (first, _) = relay();
    let restartable = Arc::new(RestartableRelay::new(Arc::clone(&first)));
    let transport: Arc<dyn RelayTransport> = restartable.clone();
    let mut runtime =
        AgentRuntime::new(agent("eth", 3), &fast_config(0.0), transport, producer()).unwrap();
    runtime.register().await.unwrap();

    first.register("vc", "vc-token").unwrap();
    for i in 0..5 {
        first
            .send("vc", "vc-token", group_message(&format!("msg {}", i), "conv-1"))
            .unwrap();
    }
    assert_eq!(runtime.poll_once().await.unwrap(), 5);
    // eth=1, vc connected=2, messages=3..=7
    assert_eq!(runtime.offset(), 8);

    let (second, _) = relay();
    restartable.restart(Arc::clone(&second));
    assert!(matches!(
        runtime.poll_once().await,
        Err(RelayError::Unauthorized { .. })
    ));

    runtime.register().await.unwrap();
    assert_eq!(runtime.offset(), 0);

    second.register("vc", "vc-token").unwrap();
    let sent = second
        .send("vc", "vc-token", group_message("after restart", "conv-2"))
        .unwrap();
    assert!(sent.sequence < 8);

    assert_eq!(runtime.poll_once().await.unwrap(), 1);
    assert!(runtime.orchestrator().conversation("conv-2").is_some());
}

#[tokio::test]
async fn test_reply_in_flight_is_dropped_when_conversation_ends() {
    let (broker, transport) = relay();
    broker.register("observer", "observer-token").unwrap();
    broker.register("vc", "vc-token").unwrap();

    let mut config = fast_config(0.0);
    config.orchestrator.min_messages = 1;
    config.orchestrator.max_messages = 2;
    config.orchestrator.sign_off = false;
    config.orchestrator.agent_response_probability = 1.0;
    config.pacing.burst_min_ms = 1_500;
    config.pacing.burst_max_ms = 1_500;
    config.pacing.max_total_ms = 1_500;

    let eth = AgentRuntime::new(agent("eth", 9), &config, Arc::clone(&transport), producer())
        .unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(eth.run(shutdown.child_token()));
    assert!(wait_for(Duration::from_secs(2), || broker.is_registered("eth")).await);

    broker
        .send("vc", "vc-token", group_message("first", "c"))
        .unwrap();
    let mut typing_seen = false;
    let typing = wait_for(Duration::from_secs(2), || {
        let batch = broker.poll("vc", "vc-token", 0).unwrap();
        typing_seen |= batch
            .actions
            .iter()
            .any(|a| a.sender == "eth" && a.action == ChatAction::Typing);
        typing_seen
    })
    .await;
    assert!(typing, "eth never started typing a reply");

    // Reaches max_messages, so the conversation ends while eth is still typing
    broker
        .send("vc", "vc-token", group_message("second", "c"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let replies: Vec<Message> = observed(&broker)
        .into_iter()
        .filter(|m| m.sender == "eth" && m.conversation_id.as_deref() == Some("c"))
        .collect();
    assert!(replies.is_empty(), "reply sent after the conversation ended: {:?}", replies);
}
