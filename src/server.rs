// ABOUTME: HTTP surface of the relay broker plus the background liveness sweeper.
// ABOUTME: Every response carries `success`; bad input and bad credentials become JSON errors, never panics.

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chorus_core::{
    config::Config, message::ChatAction, metrics, OutgoingMessage, RelayBroker, RelayError,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::api::{
    AckResponse, Credentials, ErrorResponse, HealthResponse, RegisterResponse,
    SendChatActionRequest, SendMessageRequest, SendMessageResponse, UpdatesQuery,
    UpdatesResponse,
};

#[derive(Clone)]
struct ServerState {
    broker: Arc<RelayBroker>,
}

/// JSON error with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RelayError::Validation(_) | RelayError::HopLimitExceeded { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RelayError::UnreachablePeer(_) => StatusCode::BAD_GATEWAY,
            RelayError::Scheduling(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Missing fields are 422, anything else unparseable is 400
fn rejection_status(status: StatusCode) -> StatusCode {
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        status
    } else {
        StatusCode::BAD_REQUEST
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection_status(rejection.status()), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection_status(rejection.status()), rejection.body_text())
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the broker router. `metrics` adds a Prometheus `/metrics` route.
pub fn router(broker: Arc<RelayBroker>, metrics: Option<PrometheusHandle>) -> Router {
    let mut app = Router::new()
        .route("/register", post(register_handler))
        .route("/unregister", post(unregister_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/getUpdates", get(get_updates_handler))
        .route("/sendMessage", post(send_message_handler))
        .route("/sendChatAction", post(send_chat_action_handler))
        .route("/health", get(health_handler))
        .with_state(ServerState { broker });

    if let Some(handle) = metrics {
        let metrics_routes = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::new(handle));
        app = app.merge(metrics_routes);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Expire silent agents every `interval` until `shutdown` fires
pub fn spawn_sweeper(
    broker: Arc<RelayBroker>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = broker.sweep();
                    if !expired.is_empty() {
                        tracing::info!(expired = ?expired, "Sweep removed silent agents");
                    }
                }
            }
        }
        tracing::debug!("Sweeper stopped");
    })
}

/// Run the broker HTTP server until `shutdown` fires
pub async fn run_broker(config: Arc<Config>, shutdown: CancellationToken) -> Result<()> {
    let metrics_handle =
        metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;
    let broker = Arc::new(RelayBroker::from_config(&config.broker));

    let sweeper = spawn_sweeper(
        Arc::clone(&broker),
        config.broker.sweep_interval(),
        shutdown.child_token(),
    );

    let app = router(broker, Some(metrics_handle));
    let addr = config.broker.bind_addr();
    tracing::info!(
        addr = %addr,
        max_hops = config.broker.max_hops,
        heartbeat_timeout_secs = config.broker.heartbeat_timeout_secs,
        "Starting relay broker"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Broker server failed")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task failed to complete");
    }
    tracing::info!("Relay broker stopped");
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

async fn register_handler(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<Credentials>, JsonRejection>,
) -> ApiResult<RegisterResponse> {
    let Json(creds) = payload?;
    let connected_agents = state.broker.register(&creds.agent_id, &creds.token)?;
    Ok(Json(RegisterResponse {
        success: true,
        connected_agents,
    }))
}

async fn unregister_handler(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<Credentials>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let Json(creds) = payload?;
    state.broker.unregister(&creds.agent_id, &creds.token)?;
    Ok(Json(AckResponse::ok()))
}

async fn heartbeat_handler(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<Credentials>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let Json(creds) = payload?;
    state.broker.heartbeat(&creds.agent_id, &creds.token)?;
    Ok(Json(AckResponse::ok()))
}

async fn get_updates_handler(
    State(state): State<ServerState>,
    query: std::result::Result<Query<UpdatesQuery>, QueryRejection>,
) -> ApiResult<UpdatesResponse> {
    let Query(query) = query?;
    let batch = state
        .broker
        .poll(&query.agent_id, &query.token, query.offset)?;
    Ok(Json(UpdatesResponse {
        success: true,
        messages: batch.updates,
        actions: batch.actions,
    }))
}

async fn send_message_handler(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<SendMessageResponse> {
    let Json(request) = payload?;
    let outgoing = OutgoingMessage {
        chat_id: request.chat_id,
        conversation_id: request.conversation_id,
        body: request.text,
        mentions: request.mentions,
        hop_count: request.hop_count,
    };
    let message = state
        .broker
        .send(&request.agent_id, &request.token, outgoing)?;
    Ok(Json(SendMessageResponse {
        success: true,
        message_id: message.id,
        sequence: message.sequence,
    }))
}

async fn send_chat_action_handler(
    State(state): State<ServerState>,
    payload: std::result::Result<Json<SendChatActionRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let Json(request) = payload?;
    let action: ChatAction = request.action.parse()?;
    state
        .broker
        .send_action(&request.agent_id, &request.token, request.chat_id, action)?;
    Ok(Json(AckResponse::ok()))
}

async fn health_handler(State(state): State<ServerState>) -> Json<HealthResponse> {
    let health = state.broker.health();
    Json(HealthResponse {
        status: "ok".to_string(),
        agents: health.agents.len(),
        agents_list: health.agents,
        uptime: health.uptime.num_seconds().max(0) as u64,
        last_sequence: health.last_sequence,
    })
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
