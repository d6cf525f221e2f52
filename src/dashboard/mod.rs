//! Axum-based health and inspection endpoints.
//!
//! Provides:
//!   GET /health           → JSON HealthReport (503 while degraded)
//!   GET /api/cycles       → JSON recent cycle records, newest first (?limit=)
//!   GET /api/lookup       → JSON LookupResult for ?q=
//!   GET /api/top          → JSON validators by stake (?n=)

use crate::lookup::Lookup;
use crate::metrics::{CycleMetrics, HealthState};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const DEFAULT_CYCLES: usize = 50;
const DEFAULT_TOP: usize = 20;
const MAX_TOP: usize = 200;

/// Shared state for the dashboard routes.
#[derive(Clone)]
pub struct DashboardState {
    pub metrics: Arc<Mutex<CycleMetrics>>,
    pub lookup: Lookup,
}

#[derive(Debug, Deserialize)]
pub struct CyclesParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    pub n: Option<usize>,
}

/// Build the Axum router.
pub fn build_router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/cycles", get(api_cycles))
        .route("/api/lookup", get(api_lookup))
        .route("/api/top", get(api_top))
        .with_state(state)
}

/// Start the dashboard server.
pub async fn serve(state: DashboardState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "dashboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// --- API Handlers ---

async fn health(State(state): State<DashboardState>) -> impl IntoResponse {
    let report = state.metrics.lock().await.health();
    let code = match report.status {
        HealthState::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

async fn api_cycles(
    State(state): State<DashboardState>,
    Query(params): Query<CyclesParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_CYCLES);
    Json(state.metrics.lock().await.recent(limit))
}

async fn api_lookup(
    State(state): State<DashboardState>,
    Query(params): Query<LookupParams>,
) -> impl IntoResponse {
    if params.q.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "missing query parameter q"})),
        )
            .into_response();
    }
    Json(state.lookup.find(&params.q).await).into_response()
}

async fn api_top(
    State(state): State<DashboardState>,
    Query(params): Query<TopParams>,
) -> impl IntoResponse {
    let n = params.n.unwrap_or(DEFAULT_TOP).min(MAX_TOP);
    Json(state.lookup.top(n).await)
}
