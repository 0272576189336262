//! Shared types for the OFFERSCAN engine.
//!
//! These types form the data model used across all modules: the tracked
//! catalog, the offers returned by the pricing service, and the four record
//! kinds the engine persists (runs, item results, failures, price feeds).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Cost inputs for one item. Owned by the catalog, read by the calculator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub base_cost: Decimal,
    /// Shipping plus packaging.
    #[serde(default)]
    pub shipping_cost: Decimal,
    /// Per-item marketplace fee rate; falls back to the calculator default.
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
    /// Never reprice below this.
    #[serde(default)]
    pub price_floor: Option<Decimal>,
}

impl CostModel {
    pub fn new(base_cost: Decimal, shipping_cost: Decimal) -> Self {
        Self {
            base_cost,
            shipping_cost,
            fee_rate: None,
            price_floor: None,
        }
    }

    /// Base plus shipping. `None` if the sum does not fit a `Decimal`.
    pub fn total_cost(&self) -> Option<Decimal> {
        self.base_cost.checked_add(self.shipping_cost)
    }
}

/// An item the engine watches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    pub item_id: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub currency: String,
    pub cost: CostModel,
    /// Our listed price; written back when a price feed completes.
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl TrackedItem {
    pub fn new(item_id: impl Into<String>, currency: impl Into<String>, cost: CostModel) -> Self {
        Self {
            item_id: item_id.into(),
            sku: None,
            title: None,
            currency: currency.into(),
            cost,
            current_price: None,
            active: true,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Offers
// ---------------------------------------------------------------------------

/// How an offer is fulfilled. Used as the ranking tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentChannel {
    /// Fulfilled by the marketplace itself.
    Marketplace,
    /// Fulfilled by the seller.
    Merchant,
}

impl fmt::Display for FulfillmentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillmentChannel::Marketplace => write!(f, "marketplace"),
            FulfillmentChannel::Merchant => write!(f, "merchant"),
        }
    }
}

impl std::str::FromStr for FulfillmentChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "marketplace" | "afn" | "amazon" => Ok(FulfillmentChannel::Marketplace),
            "merchant" | "mfn" => Ok(FulfillmentChannel::Merchant),
            other => Err(format!("unknown fulfillment channel: {other}")),
        }
    }
}

/// One competing offer on an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub seller_id: String,
    pub price: Decimal,
    #[serde(default)]
    pub shipping: Decimal,
    pub currency: String,
    pub channel: FulfillmentChannel,
}

impl Offer {
    /// Price plus shipping. `None` if the sum does not fit a `Decimal`.
    pub fn landed_price(&self) -> Option<Decimal> {
        self.price.checked_add(self.shipping)
    }
}

/// Response of a competitive-offers lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompetitiveOffers {
    pub offers: Vec<Offer>,
    /// Requests per second the service currently allows, when advertised.
    #[serde(default)]
    pub rate_limit_hint: Option<f64>,
}

// ---------------------------------------------------------------------------
// Scan runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Admin,
    StartupResume,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Admin => "admin",
            TriggerSource::StartupResume => "startup_resume",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerSource::Scheduled),
            "admin" => Ok(TriggerSource::Admin),
            "startup_resume" => Ok(TriggerSource::StartupResume),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// One batch pass over the catalog.
///
/// Only the orchestrator that created a run mutates it, and only while it
/// is `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl ScanRun {
    pub fn start(trigger: TriggerSource, total: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            total,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn processed(&self) -> u32 {
        self.succeeded + self.failed
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed())
    }
}

impl fmt::Display for ScanRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} [{}]: {}/{} processed ({} ok, {} failed)",
            self.id,
            self.status,
            self.processed(),
            self.total,
            self.succeeded,
            self.failed,
        )
    }
}

// ---------------------------------------------------------------------------
// Per-item outcomes
// ---------------------------------------------------------------------------

/// The priced view of one item at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanItemResult {
    pub id: Uuid,
    /// `None` for a manual re-check outside any run.
    pub run_id: Option<Uuid>,
    pub item_id: String,
    /// Competitive (winning) landed price; `None` when nobody is offering.
    pub observed_price: Option<Decimal>,
    pub currency: Option<String>,
    pub is_winner: bool,
    pub winner_seller_id: Option<String>,
    pub winner_price: Option<Decimal>,
    pub own_price: Option<Decimal>,
    pub own_rank: Option<u32>,
    pub competitor_count: u32,
    pub margin: Option<Decimal>,
    pub roi_margin_percent: Option<Decimal>,
    pub is_opportunity: bool,
    pub min_profitable_price: Option<Decimal>,
    pub captured_at: DateTime<Utc>,
}

/// Classification of a failed item attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 429, 5xx, timeouts; recorded only once the retry budget is spent.
    TransientUpstream,
    /// Any other 4xx.
    RejectedRequest,
    /// The service answered with something we could not parse.
    MalformedResponse,
    /// The engine's own circuit breaker refused the call.
    BreakerOpen,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientUpstream => "transient_upstream",
            FailureKind::RejectedRequest => "rejected_request",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::BreakerOpen => "breaker_open",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_upstream" => Ok(FailureKind::TransientUpstream),
            "rejected_request" => Ok(FailureKind::RejectedRequest),
            "malformed_response" => Ok(FailureKind::MalformedResponse),
            "breaker_open" => Ok(FailureKind::BreakerOpen),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// One failed orchestration-level attempt for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFailure {
    pub id: Uuid,
    pub run_id: Uuid,
    pub item_id: String,
    pub attempt: u32,
    pub kind: FailureKind,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Price feeds
// ---------------------------------------------------------------------------

/// Lifecycle of an asynchronous price update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Submitted,
    InQueue,
    InProgress,
    Done,
    Cancelled,
    Fatal,
}

impl FeedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedStatus::Done | FeedStatus::Cancelled | FeedStatus::Fatal)
    }

    /// Position in the lifecycle; terminal states share the last stage.
    fn stage(&self) -> u8 {
        match self {
            FeedStatus::Submitted => 0,
            FeedStatus::InQueue => 1,
            FeedStatus::InProgress => 2,
            FeedStatus::Done | FeedStatus::Cancelled | FeedStatus::Fatal => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(&self, next: FeedStatus) -> bool {
        !self.is_terminal() && next.stage() > self.stage()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Submitted => "submitted",
            FeedStatus::InQueue => "in_queue",
            FeedStatus::InProgress => "in_progress",
            FeedStatus::Done => "done",
            FeedStatus::Cancelled => "cancelled",
            FeedStatus::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both our snake_case names and the upstream's SCREAMING names.
impl std::str::FromStr for FeedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "submitted" => Ok(FeedStatus::Submitted),
            "in_queue" => Ok(FeedStatus::InQueue),
            "in_progress" => Ok(FeedStatus::InProgress),
            "done" => Ok(FeedStatus::Done),
            "cancelled" => Ok(FeedStatus::Cancelled),
            "fatal" => Ok(FeedStatus::Fatal),
            other => Err(format!("unknown feed status: {other}")),
        }
    }
}

/// A submitted price change and its last known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdateFeed {
    pub id: Uuid,
    pub item_id: String,
    pub submitted_price: Decimal,
    pub previous_price: Option<Decimal>,
    pub external_feed_id: String,
    pub status: FeedStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl PriceUpdateFeed {
    /// Time spent since submission, measured against `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.submitted_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
