//! Axum ops API for the trigger: scheduler switch, manual ticks, tick
//! history, per-entity reruns and ledger retention.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use daymark_storage::RetentionHorizon;
use daymark_sync::{TickRecord, TriggerParams, TriggerService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "daymark-web";

#[derive(Clone)]
pub struct AppState {
    pub service: TriggerService,
    pub tick_cron: String,
}

impl AppState {
    pub fn new(service: TriggerService, tick_cron: impl Into<String>) -> Self {
        Self {
            service,
            tick_cron: tick_cron.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SchedulerView {
    enabled: bool,
    tick_cron: String,
    sessionizer: String,
    retention_days: i64,
    #[serde(flatten)]
    params: TriggerParams,
}

#[derive(Debug, Deserialize, Default)]
struct TicksQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PurgeQuery {
    older_than_days: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/scheduler", get(scheduler_handler))
        .route("/scheduler/enable", post(enable_handler))
        .route("/scheduler/disable", post(disable_handler))
        .route("/ticks", get(ticks_handler))
        .route("/ticks/run", post(run_tick_handler))
        .route("/ticks/stats", get(tick_stats_handler))
        .route("/entities/{id}/rerun", post(rerun_handler))
        .route("/ledger/purge", post(purge_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ops api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn scheduler_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(scheduler_view(&state)).into_response()
}

async fn enable_handler(State(state): State<Arc<AppState>>) -> Response {
    set_switch(&state, true)
}

async fn disable_handler(State(state): State<Arc<AppState>>) -> Response {
    set_switch(&state, false)
}

fn set_switch(state: &AppState, enabled: bool) -> Response {
    let previous = state.service.switch.set(enabled);
    if previous != enabled {
        info!(enabled, "scheduled ticks toggled");
    }
    Json(scheduler_view(state)).into_response()
}

fn scheduler_view(state: &AppState) -> SchedulerView {
    let service = &state.service;
    SchedulerView {
        enabled: service.switch.is_enabled(),
        tick_cron: state.tick_cron.clone(),
        sessionizer: service.driver.sessionizer_name().to_string(),
        retention_days: service.retention.duration().num_days(),
        params: service.driver.params(),
    }
}

async fn ticks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TicksQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let recent: Vec<TickRecord> = state.service.history.recent(limit).await;
    Json(recent).into_response()
}

async fn run_tick_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.run_tick_now().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn tick_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.history.stats().await).into_response()
}

async fn rerun_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.service.rerun(id).await {
        Ok(rows_affected) => Json(json!({
            "entity_id": id,
            "rows_affected": rows_affected,
        }))
        .into_response(),
        Err(err) => {
            warn!(entity_id = %id, error = %err, "manual rerun failed");
            error_response(StatusCode::BAD_GATEWAY, err)
        }
    }
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PurgeQuery>,
) -> Response {
    let horizon = match query.older_than_days {
        None => state.service.retention,
        Some(days) => match RetentionHorizon::days(days) {
            Ok(horizon) => horizon,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        },
    };
    match state.service.driver.purge(horizon).await {
        Ok(purged) => Json(json!({
            "purged": purged,
            "older_than_days": horizon.duration().num_days(),
        }))
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
