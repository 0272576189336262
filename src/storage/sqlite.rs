//! SQLite implementation of `ScanStore`.
//!
//! Queries are built at runtime (`sqlx::query`) and mapped through private
//! row structs. Decimals are TEXT, timestamps INTEGER unix milliseconds,
//! UUIDs TEXT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{RunStats, ScanStore};
use crate::error::{EngineError, Result};
use crate::types::{
    CostModel, FeedStatus, PriceUpdateFeed, RunStatus, ScanFailure, ScanItemResult, ScanRun,
    TrackedItem,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Fresh in-memory database. One connection that never recycles, or the
    /// data would vanish with it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Column conversions
// ---------------------------------------------------------------------------

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| EngineError::Corrupt(format!("timestamp out of range: {value}")))
}

fn opt_from_ms(value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(from_ms).transpose()
}

fn decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|e| EngineError::Corrupt(format!("decimal '{value}': {e}")))
}

fn opt_decimal(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(decimal).transpose()
}

fn opt_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

fn uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| EngineError::Corrupt(format!("uuid '{value}': {e}")))
}

fn parsed<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(EngineError::Corrupt)
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    status: String,
    trigger_src: String,
    started_at: i64,
    completed_at: Option<i64>,
    total: i64,
    succeeded: i64,
    failed: i64,
}

impl TryFrom<RunRow> for ScanRun {
    type Error = EngineError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(ScanRun {
            id: uuid(&row.id)?,
            status: parsed(&row.status)?,
            trigger: parsed(&row.trigger_src)?,
            started_at: from_ms(row.started_at)?,
            completed_at: opt_from_ms(row.completed_at)?,
            total: count(row.total),
            succeeded: count(row.succeeded),
            failed: count(row.failed),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    sku: Option<String>,
    title: Option<String>,
    currency: String,
    base_cost: String,
    shipping_cost: String,
    fee_rate: Option<String>,
    price_floor: Option<String>,
    current_price: Option<String>,
    active: bool,
    updated_at: i64,
}

impl TryFrom<ItemRow> for TrackedItem {
    type Error = EngineError;

    fn try_from(row: ItemRow) -> Result<Self> {
        Ok(TrackedItem {
            item_id: row.item_id,
            sku: row.sku,
            title: row.title,
            currency: row.currency,
            cost: CostModel {
                base_cost: decimal(&row.base_cost)?,
                shipping_cost: decimal(&row.shipping_cost)?,
                fee_rate: opt_decimal(row.fee_rate)?,
                price_floor: opt_decimal(row.price_floor)?,
            },
            current_price: opt_decimal(row.current_price)?,
            active: row.active,
            updated_at: from_ms(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    id: String,
    run_id: Option<String>,
    item_id: String,
    observed_price: Option<String>,
    currency: Option<String>,
    is_winner: bool,
    winner_seller_id: Option<String>,
    winner_price: Option<String>,
    own_price: Option<String>,
    own_rank: Option<i64>,
    competitor_count: i64,
    margin: Option<String>,
    roi_margin_percent: Option<String>,
    is_opportunity: bool,
    min_profitable_price: Option<String>,
    captured_at: i64,
}

impl TryFrom<ResultRow> for ScanItemResult {
    type Error = EngineError;

    fn try_from(row: ResultRow) -> Result<Self> {
        Ok(ScanItemResult {
            id: uuid(&row.id)?,
            run_id: row.run_id.as_deref().map(uuid).transpose()?,
            item_id: row.item_id,
            observed_price: opt_decimal(row.observed_price)?,
            currency: row.currency,
            is_winner: row.is_winner,
            winner_seller_id: row.winner_seller_id,
            winner_price: opt_decimal(row.winner_price)?,
            own_price: opt_decimal(row.own_price)?,
            own_rank: row.own_rank.map(count),
            competitor_count: count(row.competitor_count),
            margin: opt_decimal(row.margin)?,
            roi_margin_percent: opt_decimal(row.roi_margin_percent)?,
            is_opportunity: row.is_opportunity,
            min_profitable_price: opt_decimal(row.min_profitable_price)?,
            captured_at: from_ms(row.captured_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: String,
    run_id: String,
    item_id: String,
    attempt: i64,
    kind: String,
    reason: String,
    occurred_at: i64,
}

impl TryFrom<FailureRow> for ScanFailure {
    type Error = EngineError;

    fn try_from(row: FailureRow) -> Result<Self> {
        Ok(ScanFailure {
            id: uuid(&row.id)?,
            run_id: uuid(&row.run_id)?,
            item_id: row.item_id,
            attempt: count(row.attempt),
            kind: parsed(&row.kind)?,
            reason: row.reason,
            occurred_at: from_ms(row.occurred_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FeedRow {
    id: String,
    item_id: String,
    submitted_price: String,
    previous_price: Option<String>,
    external_feed_id: String,
    status: String,
    submitted_at: i64,
    completed_at: Option<i64>,
    last_polled_at: Option<i64>,
}

impl TryFrom<FeedRow> for PriceUpdateFeed {
    type Error = EngineError;

    fn try_from(row: FeedRow) -> Result<Self> {
        Ok(PriceUpdateFeed {
            id: uuid(&row.id)?,
            item_id: row.item_id,
            submitted_price: decimal(&row.submitted_price)?,
            previous_price: opt_decimal(row.previous_price)?,
            external_feed_id: row.external_feed_id,
            status: parsed::<FeedStatus>(&row.status)?,
            submitted_at: from_ms(row.submitted_at)?,
            completed_at: opt_from_ms(row.completed_at)?,
            last_polled_at: opt_from_ms(row.last_polled_at)?,
        })
    }
}

const RUN_COLUMNS: &str =
    "id, status, trigger_src, started_at, completed_at, total, succeeded, failed";
const ITEM_COLUMNS: &str = "item_id, sku, title, currency, base_cost, shipping_cost, fee_rate, \
     price_floor, current_price, active, updated_at";
const RESULT_COLUMNS: &str = "id, run_id, item_id, observed_price, currency, is_winner, \
     winner_seller_id, winner_price, own_price, own_rank, competitor_count, margin, \
     roi_margin_percent, is_opportunity, min_profitable_price, captured_at";
const FAILURE_COLUMNS: &str = "id, run_id, item_id, attempt, kind, reason, occurred_at";
const FEED_COLUMNS: &str = "id, item_id, submitted_price, previous_price, external_feed_id, \
     status, submitted_at, completed_at, last_polled_at";

// ---------------------------------------------------------------------------
// ScanStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ScanStore for SqliteStore {
    async fn create_run(&self, run: &ScanRun, item_ids: &[String]) -> Result<()> {
        let run_id = run.id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO scan_runs (id, status, trigger_src, started_at, completed_at, total, succeeded, failed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(run.status.as_str())
        .bind(run.trigger.as_str())
        .bind(ms(run.started_at))
        .bind(run.completed_at.map(ms))
        .bind(i64::from(run.total))
        .bind(i64::from(run.succeeded))
        .bind(i64::from(run.failed))
        .execute(&mut *tx)
        .await?;

        for (position, item_id) in item_ids.iter().enumerate() {
            sqlx::query("INSERT INTO scan_run_items (run_id, item_id, position) VALUES (?, ?, ?)")
                .bind(&run_id)
                .bind(item_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(run_id = %run.id, total = run.total, items = item_ids.len(), "Run row created");
        Ok(())
    }

    async fn run_items(&self, run_id: Uuid) -> Result<Vec<String>> {
        let items = sqlx::query_scalar(
            "SELECT item_id FROM scan_run_items WHERE run_id = ? ORDER BY position",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScanRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM scan_runs WHERE id = ?");
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(ScanRun::try_from)
            .transpose()
    }

    async fn running_run(&self) -> Result<Option<ScanRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM scan_runs WHERE status = 'running' ORDER BY started_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, RunRow>(&sql)
            .fetch_optional(&self.pool)
            .await?
            .map(ScanRun::try_from)
            .transpose()
    }

    async fn increment_run_counters(&self, run_id: Uuid, succeeded: u32, failed: u32) -> Result<()> {
        sqlx::query(
            "UPDATE scan_runs SET succeeded = succeeded + ?, failed = failed + ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(i64::from(succeeded))
        .bind(i64::from(failed))
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus, at: DateTime<Utc>) -> Result<bool> {
        if !status.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "cannot finish run {run_id} as {status}"
            )));
        }
        let done = sqlx::query(
            "UPDATE scan_runs SET status = ?, completed_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(ms(at))
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn recount_run(&self, run_id: Uuid) -> Result<ScanRun> {
        let id = run_id.to_string();
        let succeeded: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT item_id) FROM scan_item_results WHERE run_id = ?",
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await?;
        let failed: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT f.item_id) FROM scan_failures f
             WHERE f.run_id = ?1
               AND NOT EXISTS (SELECT 1 FROM scan_item_results r
                               WHERE r.run_id = ?1 AND r.item_id = f.item_id)",
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE scan_runs SET succeeded = ?, failed = ? WHERE id = ?")
            .bind(succeeded)
            .bind(failed)
            .bind(&id)
            .execute(&self.pool)
            .await?;

        self.get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    async fn tracked_items(&self, active_only: bool) -> Result<Vec<TrackedItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM tracked_items WHERE (? = 0 OR active = 1) ORDER BY item_id"
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TrackedItem::try_from)
            .collect()
    }

    async fn tracked_item(&self, item_id: &str) -> Result<Option<TrackedItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM tracked_items WHERE item_id = ?");
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?
            .map(TrackedItem::try_from)
            .transpose()
    }

    async fn upsert_tracked_item(&self, item: &TrackedItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO tracked_items (item_id, sku, title, currency, base_cost, shipping_cost,
                                        fee_rate, price_floor, current_price, active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(item_id) DO UPDATE SET
                sku = excluded.sku,
                title = excluded.title,
                currency = excluded.currency,
                base_cost = excluded.base_cost,
                shipping_cost = excluded.shipping_cost,
                fee_rate = excluded.fee_rate,
                price_floor = excluded.price_floor,
                current_price = excluded.current_price,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&item.item_id)
        .bind(&item.sku)
        .bind(&item.title)
        .bind(&item.currency)
        .bind(item.cost.base_cost.to_string())
        .bind(item.cost.shipping_cost.to_string())
        .bind(opt_text(item.cost.fee_rate))
        .bind(opt_text(item.cost.price_floor))
        .bind(opt_text(item.current_price))
        .bind(item.active)
        .bind(ms(item.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_item_price(&self, item_id: &str, price: Decimal, at: DateTime<Utc>) -> Result<()> {
        let done = sqlx::query(
            "UPDATE tracked_items SET current_price = ?, updated_at = ? WHERE item_id = ?",
        )
        .bind(price.to_string())
        .bind(ms(at))
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("tracked item {item_id}")));
        }
        Ok(())
    }

    async fn write_result(&self, result: &ScanItemResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_item_results (id, run_id, item_id, observed_price, currency, is_winner,
                 winner_seller_id, winner_price, own_price, own_rank, competitor_count, margin,
                 roi_margin_percent, is_opportunity, min_profitable_price, captured_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id, item_id) DO UPDATE SET
                observed_price = excluded.observed_price,
                currency = excluded.currency,
                is_winner = excluded.is_winner,
                winner_seller_id = excluded.winner_seller_id,
                winner_price = excluded.winner_price,
                own_price = excluded.own_price,
                own_rank = excluded.own_rank,
                competitor_count = excluded.competitor_count,
                margin = excluded.margin,
                roi_margin_percent = excluded.roi_margin_percent,
                is_opportunity = excluded.is_opportunity,
                min_profitable_price = excluded.min_profitable_price,
                captured_at = excluded.captured_at",
        )
        .bind(result.id.to_string())
        .bind(result.run_id.map(|id| id.to_string()))
        .bind(&result.item_id)
        .bind(opt_text(result.observed_price))
        .bind(&result.currency)
        .bind(result.is_winner)
        .bind(&result.winner_seller_id)
        .bind(opt_text(result.winner_price))
        .bind(opt_text(result.own_price))
        .bind(result.own_rank.map(i64::from))
        .bind(i64::from(result.competitor_count))
        .bind(opt_text(result.margin))
        .bind(opt_text(result.roi_margin_percent))
        .bind(result.is_opportunity)
        .bind(opt_text(result.min_profitable_price))
        .bind(ms(result.captured_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_failure(&self, failure: &ScanFailure) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_failures (id, run_id, item_id, attempt, kind, reason, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(failure.id.to_string())
        .bind(failure.run_id.to_string())
        .bind(&failure.item_id)
        .bind(i64::from(failure.attempt))
        .bind(failure.kind.as_str())
        .bind(&failure.reason)
        .bind(ms(failure.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn processed_items(&self, run_id: Uuid) -> Result<HashSet<String>> {
        let items: Vec<String> = sqlx::query_scalar(
            "SELECT item_id FROM scan_item_results WHERE run_id = ?1
             UNION
             SELECT item_id FROM scan_failures WHERE run_id = ?1",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(items.into_iter().collect())
    }

    async fn failures_for_run(&self, run_id: Uuid) -> Result<Vec<ScanFailure>> {
        let sql = format!(
            "SELECT {FAILURE_COLUMNS} FROM scan_failures WHERE run_id = ? ORDER BY occurred_at, item_id, attempt"
        );
        sqlx::query_as::<_, FailureRow>(&sql)
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScanFailure::try_from)
            .collect()
    }

    async fn results_for_item(&self, item_id: &str, limit: u32) -> Result<Vec<ScanItemResult>> {
        let sql = format!(
            "SELECT {RESULT_COLUMNS} FROM scan_item_results WHERE item_id = ?
             ORDER BY captured_at DESC LIMIT ?"
        );
        sqlx::query_as::<_, ResultRow>(&sql)
            .bind(item_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ScanItemResult::try_from)
            .collect()
    }

    async fn stats_since(&self, since: DateTime<Utc>) -> Result<RunStats> {
        let from = ms(since);

        let runs_started: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scan_runs WHERE started_at >= ?")
                .bind(from)
                .fetch_one(&self.pool)
                .await?;

        let (results, wins, opportunities): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_winner), 0), COALESCE(SUM(is_opportunity), 0)
             FROM scan_item_results WHERE captured_at >= ?",
        )
        .bind(from)
        .fetch_one(&self.pool)
        .await?;

        let (failure_rows, failed_items): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT item_id) FROM scan_failures WHERE occurred_at >= ?",
        )
        .bind(from)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunStats {
            since: Some(since),
            runs_started: runs_started.max(0) as u64,
            results_captured: results.max(0) as u64,
            featured_offer_wins: wins.max(0) as u64,
            opportunities: opportunities.max(0) as u64,
            failure_rows: failure_rows.max(0) as u64,
            failed_items: failed_items.max(0) as u64,
        })
    }

    async fn save_feed(&self, feed: &PriceUpdateFeed) -> Result<()> {
        sqlx::query(
            "INSERT INTO price_update_feeds (id, item_id, submitted_price, previous_price,
                 external_feed_id, status, submitted_at, completed_at, last_polled_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                last_polled_at = excluded.last_polled_at",
        )
        .bind(feed.id.to_string())
        .bind(&feed.item_id)
        .bind(feed.submitted_price.to_string())
        .bind(opt_text(feed.previous_price))
        .bind(&feed.external_feed_id)
        .bind(feed.status.as_str())
        .bind(ms(feed.submitted_at))
        .bind(feed.completed_at.map(ms))
        .bind(feed.last_polled_at.map(ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_feed(&self, feed_id: Uuid) -> Result<Option<PriceUpdateFeed>> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM price_update_feeds WHERE id = ?");
        sqlx::query_as::<_, FeedRow>(&sql)
            .bind(feed_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(PriceUpdateFeed::try_from)
            .transpose()
    }

    async fn open_feeds(&self) -> Result<Vec<PriceUpdateFeed>> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM price_update_feeds
             WHERE status NOT IN ('done', 'cancelled', 'fatal') ORDER BY submitted_at"
        );
        sqlx::query_as::<_, FeedRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PriceUpdateFeed::try_from)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
