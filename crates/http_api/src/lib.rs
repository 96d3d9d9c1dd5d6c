//! Dashboard-facing HTTP surface for player history.

use anyhow::Result;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use metrics::MetricsHandle;
use query::{PlayerHistoryView, QueryService};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

mod error;

pub use error::{ApiError, ErrorBody};

pub const PLAYER_HISTORY_PATH: &str = "/api/player-history";

#[derive(Clone)]
pub struct ApiState {
    pub query: QueryService,
    pub metrics: MetricsHandle,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub name: Option<String>,
    pub range: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(PLAYER_HISTORY_PATH, get(player_history))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn player_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<PlayerHistoryView>, ApiError> {
    let result = state
        .query
        .query(params.name.as_deref(), params.range.as_deref())
        .await
        .map_err(ApiError::from);
    match &result {
        Ok(_) => state.metrics.record_query("ok"),
        Err(err) => state.metrics.record_query(err.outcome()),
    }
    result.map(Json)
}

pub async fn serve(listener: TcpListener, state: ApiState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "history api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
