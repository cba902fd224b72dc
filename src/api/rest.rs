// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token checked via the `AuthBearer` extractor.
//
// Fusion cycles and standalone simulations are CPU-bound and run on the
// blocking pool.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use fusion_oracle::monte_carlo::{estimate_volatility, MonteCarloSimulator};
use fusion_oracle::types::{Direction, Signal};
use fusion_oracle::verdict::Verdict;
use fusion_oracle::{CancelToken, EngineError, MarketContext};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, SettleError};

/// Wall-clock budget for the Monte Carlo refinement of one analyze call.
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/analyze", post(analyze))
        .route("/api/v1/settle", post(settle))
        .route("/api/v1/simulate", post(simulate))
        .route("/api/v1/risk", get(risk))
        .route("/api/v1/risk/reset-period", post(reset_period))
        .route("/api/v1/trust", get(trust))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

fn engine_error_response(e: &EngineError) -> Response {
    match e {
        EngineError::SimulationCancelled { .. } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        _ => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Analyze (authenticated)
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Tier {
    #[default]
    Full,
    Signal,
    Free,
}

#[derive(Deserialize)]
struct SignalPayload {
    source_id: String,
    direction: String,
    confidence: f64,
    /// Defaults to the roster weight for the source.
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    signals: Vec<SignalPayload>,
    #[serde(default)]
    market: Option<MarketContext>,
    #[serde(default)]
    tier: Tier,
}

fn tiered_view(verdict: &Verdict, tier: Tier) -> serde_json::Value {
    match tier {
        Tier::Full => serde_json::to_value(verdict).unwrap_or_default(),
        Tier::Signal => serde_json::json!({
            "id": verdict.id,
            "direction": verdict.direction,
            "confidence": verdict.confidence,
            "position_size": verdict.position_size,
            "risk_score": verdict.risk_score,
            "veto_applied": verdict.veto_applied,
            "circuit_breaker": verdict.circuit_breaker,
            "risk_override": verdict.risk_override,
            "created_at": verdict.created_at,
        }),
        Tier::Free => serde_json::json!({
            "id": verdict.id,
            "direction": verdict.direction,
            "created_at": verdict.created_at,
        }),
    }
}

async fn analyze(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Response {
    let mut signals = Vec::with_capacity(req.signals.len());
    {
        let roster = &state.engine.config().fusion.roster;
        for p in req.signals {
            let direction: Direction = match p.direction.parse() {
                Ok(d) => d,
                Err(e) => return engine_error_response(&e),
            };
            let weight = p
                .weight
                .or_else(|| roster.get(&p.source_id).copied())
                .unwrap_or(0.0);
            signals.push(Signal::new(
                p.source_id,
                direction,
                p.confidence,
                weight,
                p.reasoning,
            ));
        }
    }

    let conditions = req
        .market
        .as_ref()
        .map(|m| m.conditions(state.engine.config()))
        .unwrap_or_default();

    let cycle_state = state.clone();
    let market = req.market;
    let result = tokio::task::spawn_blocking(move || {
        let cancel = CancelToken::with_timeout(ANALYZE_TIMEOUT);
        cycle_state.engine.run_cycle_with_cancel(
            &cycle_state.risk,
            signals,
            market.as_ref(),
            &cancel,
        )
    })
    .await;

    let verdict = match result {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            warn!(error = %e, "analyze cycle failed");
            return engine_error_response(&e);
        }
        Err(e) => {
            error!(error = %e, "analyze task panicked");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "cycle task failed");
        }
    };

    info!(
        verdict_id = %verdict.id,
        direction = %verdict.direction,
        confidence = verdict.confidence,
        position_size = verdict.position_size,
        "verdict emitted"
    );

    let body = tiered_view(&verdict, req.tier);
    state.push_verdict(verdict, conditions);
    Json(body).into_response()
}

// =============================================================================
// Settle (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SettleRequest {
    verdict_id: String,
    actual_outcome: String,
    pnl_percent: f64,
}

async fn settle(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettleRequest>,
) -> Response {
    let actual: Direction = match req.actual_outcome.parse() {
        Ok(Direction::Neutral) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "actual_outcome must be LONG or SHORT",
            )
        }
        Ok(d) => d,
        Err(e) => return engine_error_response(&e),
    };

    match state.settle(&req.verdict_id, actual, req.pnl_percent) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(SettleError::UnknownVerdict) => error_response(
            StatusCode::NOT_FOUND,
            format!("verdict {} not found in recent history", req.verdict_id),
        ),
        Err(SettleError::AlreadySettled) => error_response(
            StatusCode::CONFLICT,
            format!("verdict {} already settled", req.verdict_id),
        ),
    }
}

// =============================================================================
// Simulate (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SimulateRequest {
    current_price: f64,
    direction: String,
    #[serde(default)]
    mu: Option<f64>,
    /// Per-step volatility; estimated from `price_history` when absent.
    #[serde(default)]
    sigma: Option<f64>,
    #[serde(default)]
    price_history: Vec<f64>,
    #[serde(default)]
    n_simulations: Option<usize>,
    #[serde(default)]
    n_steps: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
}

async fn simulate(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SimulateRequest>,
) -> Response {
    let direction: Direction = match req.direction.parse() {
        Ok(d) => d,
        Err(e) => return engine_error_response(&e),
    };

    let config = state.engine.config();
    let mut params = config.monte_carlo.clone();
    if let Some(n) = req.n_simulations {
        params.n_simulations = n;
    }
    if let Some(n) = req.n_steps {
        params.n_steps = n;
    }
    if req.seed.is_some() {
        params.seed = req.seed;
    }
    let simulator = MonteCarloSimulator::new(params, &config.sizing);

    let mu = req.mu.unwrap_or(match direction {
        Direction::Short => -config.monte_carlo.drift,
        _ => config.monte_carlo.drift,
    });
    let sigma = req
        .sigma
        .unwrap_or_else(|| estimate_volatility(&req.price_history));
    let price = req.current_price;

    let result = tokio::task::spawn_blocking(move || {
        simulator.simulate_with_cancel(
            price,
            mu,
            sigma,
            direction,
            &CancelToken::with_timeout(ANALYZE_TIMEOUT),
        )
    })
    .await;

    match result {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => engine_error_response(&e),
        Err(e) => {
            error!(error = %e, "simulation task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

// =============================================================================
// Risk (authenticated)
// =============================================================================

async fn risk(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.risk_snapshot())
}

async fn reset_period(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.reset_period();
    info!("risk period reset via API");
    Json(state.risk_snapshot())
}

// =============================================================================
// Trust, decisions, stats, state (authenticated)
// =============================================================================

async fn trust(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trust_snapshot())
}

async fn decisions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<_> = state.recent_verdicts.read().iter().cloned().collect();
    Json(entries)
}

async fn stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.stats.read().clone();
    Json(serde_json::json!({
        "hit_rate": stats.hit_rate(),
        "stats": stats,
    }))
}

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.build_snapshot())
}
