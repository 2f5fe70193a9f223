//! Inbound HTTP surface of the agent.
//!
//! Every request runs in its own task, so a slow oracle call behind one
//! message never holds up another.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::domain::{
    AgentId, AgentMessage, Decision, DecisionRequest, MessageEnvelope, Observation, RoomId,
    RoundId,
};
use crate::engine::{MessageOutcome, RoundEngine};
use crate::error::{Result, RoundError};

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<RoundEngine>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub agent_id: AgentId,
    pub room_id: RoomId,
    pub current_round_id: RoundId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub received: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<MessageOutcome> for MessageResponse {
    fn from(outcome: MessageOutcome) -> Self {
        Self {
            received: true,
            success: outcome.is_success(),
            reason: outcome.reason_code().map(str::to_string),
            error_message: outcome.error_message(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub round_id: Option<RoundId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub synced: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub decision: Decision,
    pub fallback: bool,
}

fn error_status(err: &RoundError) -> StatusCode {
    match err {
        RoundError::Validation(_) => StatusCode::BAD_REQUEST,
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_http(err: RoundError) -> (StatusCode, String) {
    (error_status(&err), err.to_string())
}

fn bad_request(rejection: JsonRejection) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, rejection.body_text())
}

fn check_envelope<C: Serialize>(
    engine: &RoundEngine,
    envelope: &MessageEnvelope<C>,
    validate: impl FnOnce() -> Result<()>,
) -> std::result::Result<(), (StatusCode, String)> {
    validate().map_err(to_http)?;
    engine.verify_envelope(envelope).map_err(|e| {
        warn!(sender = %envelope.sender, error = %e, "Inbound signature check failed");
        (StatusCode::BAD_REQUEST, e.to_string())
    })
}

/// GET /health
async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        agent_id: state.engine.agent_id(),
        room_id: state.engine.room_id(),
        current_round_id: state.engine.current_round_id().await,
    })
}

/// GET /agentContext
async fn agent_context(State(state): State<ApiState>) -> ApiResult<serde_json::Value> {
    state.engine.context_snapshot().await.map(Json).map_err(to_http)
}

/// POST /forceRoundSync
async fn force_round_sync(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<SyncRequest>, JsonRejection>,
) -> ApiResult<SyncResponse> {
    let Json(request) = payload.map_err(bad_request)?;
    let synced = state
        .engine
        .sync_state_with_round(request.room_id, request.round_id)
        .await
        .map_err(to_http)?;
    Ok(Json(SyncResponse {
        success: true,
        synced,
    }))
}

/// POST /messages/receiveAgentMessage and /messages/receiveGmInstruction
async fn receive_agent_message(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<AgentMessage>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let Json(message) = payload.map_err(bad_request)?;
    check_envelope(&state.engine, &message, || message.validate())?;
    Ok(Json(state.engine.handle_agent_message(message).await.into()))
}

/// POST /messages/receiveObservation
async fn receive_observation(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<Observation>, JsonRejection>,
) -> ApiResult<MessageResponse> {
    let Json(observation) = payload.map_err(bad_request)?;
    check_envelope(&state.engine, &observation, || observation.validate())?;
    Ok(Json(state.engine.handle_observation(observation).await.into()))
}

/// POST /messages/decision
async fn decision(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<DecisionRequest>, JsonRejection>,
) -> ApiResult<DecisionResponse> {
    let Json(request) = payload.map_err(bad_request)?;
    let outcome = state
        .engine
        .handle_decision_request(request)
        .await
        .map_err(to_http)?;
    Ok(Json(DecisionResponse {
        decision: outcome.decision,
        fallback: outcome.fallback,
    }))
}

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/agentContext", get(agent_context))
        .route("/forceRoundSync", post(force_round_sync))
        .route("/messages/receiveAgentMessage", post(receive_agent_message))
        .route("/messages/receiveGmInstruction", post(receive_agent_message))
        .route("/messages/receiveObservation", post(receive_observation))
        .route("/messages/decision", post(decision))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Agent API listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
