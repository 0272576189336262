//! Persistence layer.
//!
//! `ScanStore` is the seam between the engine and its database. The shipped
//! implementation is SQLite via sqlx (`sqlite::SqliteStore`); the engine
//! only ever talks to the trait.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{PriceUpdateFeed, RunStatus, ScanFailure, ScanItemResult, ScanRun, TrackedItem};

pub use sqlite::SqliteStore;

/// Aggregate activity over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub since: Option<DateTime<Utc>>,
    pub runs_started: u64,
    pub results_captured: u64,
    pub featured_offer_wins: u64,
    pub opportunities: u64,
    pub failure_rows: u64,
    pub failed_items: u64,
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    // ---- runs -------------------------------------------------------------

    /// Insert the run together with the ids it will scan, atomically.
    async fn create_run(&self, run: &ScanRun, item_ids: &[String]) -> Result<()>;

    /// The item ids a run was created over, in dispatch order.
    async fn run_items(&self, run_id: Uuid) -> Result<Vec<String>>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScanRun>>;

    /// The most recent run still marked `running`, if any.
    async fn running_run(&self) -> Result<Option<ScanRun>>;

    /// Single-row counter bump.
    async fn increment_run_counters(&self, run_id: Uuid, succeeded: u32, failed: u32) -> Result<()>;

    /// Move a running run to a terminal status. Returns false if the run was
    /// already terminal (and leaves it untouched).
    async fn finish_run(&self, run_id: Uuid, status: RunStatus, at: DateTime<Utc>) -> Result<bool>;

    /// Recompute a run's counters from its result and failure rows.
    async fn recount_run(&self, run_id: Uuid) -> Result<ScanRun>;

    // ---- catalog ----------------------------------------------------------

    async fn tracked_items(&self, active_only: bool) -> Result<Vec<TrackedItem>>;

    async fn tracked_item(&self, item_id: &str) -> Result<Option<TrackedItem>>;

    async fn upsert_tracked_item(&self, item: &TrackedItem) -> Result<()>;

    async fn update_item_price(&self, item_id: &str, price: Decimal, at: DateTime<Utc>) -> Result<()>;

    // ---- results & failures -----------------------------------------------

    /// Upsert keyed by (run, item). Run-less results are plain inserts.
    async fn write_result(&self, result: &ScanItemResult) -> Result<()>;

    async fn write_failure(&self, failure: &ScanFailure) -> Result<()>;

    /// Items with at least one result or failure row in this run.
    async fn processed_items(&self, run_id: Uuid) -> Result<HashSet<String>>;

    async fn failures_for_run(&self, run_id: Uuid) -> Result<Vec<ScanFailure>>;

    /// Newest first.
    async fn results_for_item(&self, item_id: &str, limit: u32) -> Result<Vec<ScanItemResult>>;

    async fn stats_since(&self, since: DateTime<Utc>) -> Result<RunStats>;

    // ---- price feeds ------------------------------------------------------

    async fn save_feed(&self, feed: &PriceUpdateFeed) -> Result<()>;

    async fn get_feed(&self, feed_id: Uuid) -> Result<Option<PriceUpdateFeed>>;

    /// Feeds not yet in a terminal status, oldest first.
    async fn open_feeds(&self) -> Result<Vec<PriceUpdateFeed>>;
}
