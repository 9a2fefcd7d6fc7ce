//! HTTP API for health checks, status, and administration

use crate::bridge::BridgeRequest;
use crate::config::{ApiConfig, RiskTierConfig, RoutingWeights};
use crate::coordination::CoordinationEngine;
use crate::error::{BridgeError, RegistryError, RelayerError, RelayerResult};
use crate::model::{ChainId, TransactionIntent};
use crate::quorum::QuorumPolicy;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub started_at: Instant,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<CoordinationEngine>) -> RelayerResult<()> {
    let app = router(AppState {
        engine,
        started_at: Instant::now(),
    });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/chains", get(get_chains))
        .route("/chains/:chain_id", delete(deregister_chain))
        .route("/intents", post(submit_intent))
        .route("/bridges", post(request_bridge))
        .route("/bridges/:bridge_id", get(get_bridge))
        .route("/bridges/:bridge_id/cancel", post(cancel_bridge))
        .route("/router/weights", get(get_weights).put(set_weights))
        .route("/sponsorship/tiers/:tier", put(set_tier_limit))
        .route("/quorum", get(get_quorum).put(set_quorum_policy))
        .route("/quorum/flagged", get(get_flagged))
        .route("/quorum/flagged/:validator", delete(clear_flag))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// JSON error body with a status code.
struct ApiError {
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
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let status = match &e {
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::NotCancellable { .. } => StatusCode::CONFLICT,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::ChainNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Draining(_) => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - the store answers and at least one chain is routable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    let database = engine.store().health_check().await.is_ok();
    let routable = engine.registry().routable().await.len();

    let ready = database && routable > 0 && !engine.is_stopping().await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            routable_chains: routable,
        }),
    )
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        registered_chains: engine.registry().chain_ids(),
        validators: engine.quorum().len(),
        flagged_validators: engine.quorum().flagged().len(),
        treasury_balance: engine.sponsorship().treasury_balance(),
    })
}

/// Get bridge transfer statistics
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.engine.store().stats().await?;
    Ok(Json(stats))
}

/// Health table of registered chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registry().health_table().await)
}

async fn deregister_chain(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let chain_id = ChainId::from(chain_id);
    state.engine.registry().deregister(&chain_id).await?;
    state.engine.monitor().reconcile();
    info!("Chain {} deregistered via admin API", chain_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_intent(
    State(state): State<AppState>,
    Json(intent): Json<TransactionIntent>,
) -> Result<impl IntoResponse, ApiError> {
    let intent_id = intent.id;
    state
        .engine
        .submit(intent)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { id: intent_id })))
}

/// Accept a bridge request and drive it in the background
async fn request_bridge(
    State(state): State<AppState>,
    Json(request): Json<BridgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = state.engine.orchestrator().clone();
    let transfer = orchestrator.request(request).await?;

    let bridge_id = transfer.bridge_id;
    tokio::spawn(async move {
        if let Err(e) = orchestrator.drive(bridge_id).await {
            warn!(bridge_id = %bridge_id, "Bridge driver stopped: {}", e);
        }
    });
    Ok((StatusCode::ACCEPTED, Json(transfer)))
}

async fn get_bridge(
    State(state): State<AppState>,
    Path(bridge_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let transfer = state.engine.orchestrator().get(bridge_id).await?;
    Ok(Json(transfer))
}

async fn cancel_bridge(
    State(state): State<AppState>,
    Path(bridge_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let transfer = state.engine.orchestrator().cancel(bridge_id).await?;
    Ok(Json(transfer))
}

async fn get_weights(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.router().weights().await)
}

async fn set_weights(
    State(state): State<AppState>,
    Json(weights): Json<RoutingWeights>,
) -> Result<impl IntoResponse, ApiError> {
    let terms = [
        weights.sponsorship,
        weights.latency,
        weights.cost,
        weights.reliability,
        weights.preference,
    ];
    if terms.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "routing weights must be finite and non-negative",
        ));
    }
    state.engine.router().set_weights(weights).await;
    info!("Routing weights updated: {:?}", weights);
    Ok(Json(weights))
}

async fn set_tier_limit(
    State(state): State<AppState>,
    Path(tier): Path<String>,
    Json(body): Json<TierLimitRequest>,
) -> impl IntoResponse {
    state
        .engine
        .sponsorship()
        .set_tier_limit(&tier, body.daily_limit)
        .await;
    info!("Sponsorship tier {} limit set to {}", tier, body.daily_limit);
    Json(TierLimitResponse {
        tier,
        daily_limit: body.daily_limit,
    })
}

async fn get_quorum(State(state): State<AppState>) -> impl IntoResponse {
    let quorum = state.engine.quorum();
    Json(QuorumResponse {
        validators: quorum.validator_set().into_iter().collect(),
        policy: quorum.policy().await,
    })
}

async fn set_quorum_policy(
    State(state): State<AppState>,
    Json(body): Json<QuorumPolicyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let quorum = state.engine.quorum();
    let tiers = match body.risk_tiers {
        Some(tiers) => tiers,
        None => quorum.policy().await.tiers,
    };
    quorum
        .set_policy(QuorumPolicy::new(body.default_threshold, tiers))
        .await?;
    Ok(Json(quorum.policy().await))
}

async fn get_flagged(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.quorum().flagged())
}

async fn clear_flag(
    State(state): State<AppState>,
    Path(validator): Path<String>,
) -> Result<StatusCode, ApiError> {
    let address: Address = validator
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid validator address"))?;
    if state.engine.quorum().clear_flag(&address) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "validator is not flagged"))
    }
}

// Request and response types

#[derive(Deserialize)]
struct TierLimitRequest {
    daily_limit: u64,
}

#[derive(Deserialize)]
struct QuorumPolicyRequest {
    default_threshold: usize,
    #[serde(default)]
    risk_tiers: Option<Vec<RiskTierConfig>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    routable_chains: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    registered_chains: Vec<ChainId>,
    validators: usize,
    flagged_validators: usize,
    treasury_balance: u64,
}

#[derive(Serialize)]
struct AcceptedResponse {
    id: Uuid,
}

#[derive(Serialize)]
struct TierLimitResponse {
    tier: String,
    daily_limit: u64,
}

#[derive(Serialize)]
struct QuorumResponse {
    validators: Vec<Address>,
    policy: QuorumPolicy,
}
