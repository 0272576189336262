//! Admin API route handlers.
//!
//! All endpoints return JSON. Errors go through `EngineError`'s
//! `IntoResponse`, so a conflicting run start is a 409 and an unknown id
//! a 404.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::{PriceDispatcher, RunOverrides, ScanOrchestrator};
use crate::error::{EngineError, Result};
use crate::storage::{RunStats, ScanStore};
use crate::types::{
    CostModel, PriceUpdateFeed, ScanFailure, ScanItemResult, ScanRun, TrackedItem, TriggerSource,
};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct AdminState {
    pub store: Arc<dyn ScanStore>,
    pub orchestrator: Arc<ScanOrchestrator>,
    pub dispatcher: Arc<PriceDispatcher>,
    /// Currency for items created without one.
    pub default_currency: String,
    pub started_at: DateTime<Utc>,
}

impl AdminState {
    pub fn new(
        store: Arc<dyn ScanStore>,
        orchestrator: Arc<ScanOrchestrator>,
        dispatcher: Arc<PriceDispatcher>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            dispatcher,
            default_currency: default_currency.into(),
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<AdminState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_run: Option<Uuid>,
    pub uptime_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
}

fn default_window_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ItemRequest {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Defaults to the existing item's currency, then the engine's.
    #[serde(default)]
    pub currency: Option<String>,
    pub base_cost: Decimal,
    #[serde(default)]
    pub shipping_cost: Decimal,
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
    #[serde(default)]
    pub price_floor: Option<Decimal>,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PriceRequest {
    pub price: Decimal,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_run: state.orchestrator.active_run(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// POST /api/runs
pub async fn start_run(
    State(state): State<AppState>,
    overrides: Option<Json<RunOverrides>>,
) -> Result<(StatusCode, Json<RunAccepted>)> {
    let overrides = overrides.map(|Json(o)| o).unwrap_or_default();
    let handle = state.orchestrator.start_run(TriggerSource::Admin, overrides).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: handle.run_id(),
        }),
    ))
}

/// POST /api/runs/:id/stop
pub async fn stop_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Result<StatusCode> {
    state.orchestrator.stop_run(run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/runs/:id/resume
pub async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunAccepted>)> {
    let handle = state.orchestrator.resume_run(run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: handle.run_id(),
        }),
    ))
}

/// GET /api/runs/:id
pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Result<Json<ScanRun>> {
    Ok(Json(state.orchestrator.run_status(run_id).await?))
}

/// GET /api/runs/:id/failures
pub async fn get_run_failures(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Vec<ScanFailure>>> {
    state.orchestrator.run_status(run_id).await?;
    Ok(Json(state.store.failures_for_run(run_id).await?))
}

/// GET /api/stats?window_hours=24
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<RunStats>> {
    if query.window_hours <= 0 {
        return Err(EngineError::InvalidInput("window_hours must be positive".into()));
    }
    let since = Utc::now() - Duration::hours(query.window_hours);
    Ok(Json(state.store.stats_since(since).await?))
}

/// PUT /api/items/:id
pub async fn put_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(req): Json<ItemRequest>,
) -> Result<Json<TrackedItem>> {
    let negative = [Some(req.base_cost), Some(req.shipping_cost), req.price_floor]
        .into_iter()
        .flatten()
        .any(|v| v < Decimal::ZERO);
    if negative {
        return Err(EngineError::InvalidInput("costs and floor must not be negative".into()));
    }
    if req.fee_rate.is_some_and(|f| f < Decimal::ZERO || f >= Decimal::ONE) {
        return Err(EngineError::InvalidInput("fee_rate must be in [0, 1)".into()));
    }
    let cost = CostModel {
        base_cost: req.base_cost,
        shipping_cost: req.shipping_cost,
        fee_rate: req.fee_rate,
        price_floor: req.price_floor,
    };
    if cost.total_cost().is_none() {
        return Err(EngineError::InvalidInput("base_cost + shipping_cost is out of range".into()));
    }

    let existing = state.store.tracked_item(&item_id).await?;
    let currency = req
        .currency
        .or_else(|| existing.as_ref().map(|e| e.currency.clone()))
        .unwrap_or_else(|| state.default_currency.clone());
    let item = TrackedItem {
        item_id,
        sku: req.sku,
        title: req.title,
        currency,
        cost,
        current_price: req.current_price.or(existing.and_then(|e| e.current_price)),
        active: req.active,
        updated_at: Utc::now(),
    };
    state.store.upsert_tracked_item(&item).await?;
    Ok(Json(item))
}

/// GET /api/items/:id/history
pub async fn get_item_history(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ScanItemResult>>> {
    let limit = query.limit.clamp(1, 500);
    Ok(Json(state.store.results_for_item(&item_id, limit).await?))
}

/// POST /api/items/:id/recheck
pub async fn recheck_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> Result<Json<ScanItemResult>> {
    Ok(Json(state.orchestrator.recheck_item(&item_id).await?))
}

/// POST /api/items/:id/price-feeds
pub async fn submit_price(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(req): Json<PriceRequest>,
) -> Result<(StatusCode, Json<PriceUpdateFeed>)> {
    let item = state
        .store
        .tracked_item(&item_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("tracked item {item_id}")))?;
    let feed = state.dispatcher.submit(&item, req.price).await?;
    state.dispatcher.spawn_polling(feed.id).await;
    Ok((StatusCode::ACCEPTED, Json(feed)))
}

/// GET /api/price-feeds/:id (polls the service once)
pub async fn poll_feed(
    State(state): State<AppState>,
    Path(feed_id): Path<Uuid>,
) -> Result<Json<PriceUpdateFeed>> {
    Ok(Json(state.dispatcher.poll_once(feed_id).await?))
}

/// GET /api/price-feeds/stuck
pub async fn get_stuck_feeds(State(state): State<AppState>) -> Result<Json<Vec<PriceUpdateFeed>>> {
    Ok(Json(state.dispatcher.stuck_feeds().await?))
}
