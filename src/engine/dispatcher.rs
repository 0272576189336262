//! Price-update dispatcher.
//!
//! Submitting a price is asynchronous on the service side: the submission
//! returns a feed id immediately and the change is applied minutes later.
//!
//! ```text
//! submitted → in_queue → in_progress → { done | cancelled | fatal }
//! ```
//!
//! Status only ever moves forward and is driven solely by polling. When a
//! feed reaches `done` the submitted price becomes the tracked item's
//! current price. Feeds that sit in a non-terminal state for longer than
//! `stuck_after` are reported, never mutated.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{CallOutcome, ResilientExecutor};
use crate::error::{EngineError, Result};
use crate::platforms::PricingService;
use crate::storage::ScanStore;
use crate::strategy::undercut_target;
use crate::types::{FeedStatus, PriceUpdateFeed, ScanItemResult, TrackedItem};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    #[serde(with = "secs")]
    pub stuck_after: Duration,
    /// Amount taken off the competitive price when repricing an opportunity.
    pub undercut: Decimal,
    /// Submit flagged opportunities without an operator in the loop.
    pub auto_submit: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stuck_after: Duration::from_secs(30 * 60),
            undercut: dec!(0.01),
            auto_submit: false,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct PriceDispatcher {
    store: Arc<dyn ScanStore>,
    service: Arc<dyn PricingService>,
    executor: Arc<ResilientExecutor>,
    config: DispatcherConfig,
    pollers: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl PriceDispatcher {
    pub fn new(
        store: Arc<dyn ScanStore>,
        service: Arc<dyn PricingService>,
        executor: Arc<ResilientExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            service,
            executor,
            config,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub async fn feed(&self, feed_id: Uuid) -> Result<PriceUpdateFeed> {
        self.store
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("price feed {feed_id}")))
    }

    /// Send a new price for one item and record the submission.
    pub async fn submit(&self, item: &TrackedItem, new_price: Decimal) -> Result<PriceUpdateFeed> {
        if new_price <= Decimal::ZERO {
            return Err(EngineError::InvalidInput(format!(
                "price must be positive, got {new_price}"
            )));
        }
        if let Some(floor) = item.cost.price_floor.filter(|f| new_price < *f) {
            return Err(EngineError::InvalidInput(format!(
                "price {new_price} is below the floor {floor} for {}",
                item.item_id
            )));
        }

        let outcome = self
            .executor
            .execute(|| self.service.submit_price_feed(&item.item_id, new_price))
            .await;
        let external_feed_id = match outcome {
            CallOutcome::Succeeded(id) | CallOutcome::Recovered { value: id, .. } => id,
            other => {
                let reason = other.failure_reason().unwrap_or_default();
                warn!(item_id = %item.item_id, reason = %reason, "Price feed submission failed");
                return Err(EngineError::Upstream(reason));
            }
        };

        let feed = PriceUpdateFeed {
            id: Uuid::new_v4(),
            item_id: item.item_id.clone(),
            submitted_price: new_price,
            previous_price: item.current_price,
            external_feed_id,
            status: FeedStatus::Submitted,
            submitted_at: Utc::now(),
            completed_at: None,
            last_polled_at: None,
        };
        self.store.save_feed(&feed).await?;

        info!(
            feed_id = %feed.id,
            external_feed_id = %feed.external_feed_id,
            item_id = %feed.item_id,
            price = %new_price,
            previous = ?feed.previous_price,
            "Price feed submitted"
        );
        Ok(feed)
    }

    /// Reprice a flagged opportunity just under the competitive price.
    pub async fn submit_opportunity(&self, result: &ScanItemResult) -> Result<PriceUpdateFeed> {
        let observed = result.observed_price.ok_or_else(|| {
            EngineError::InvalidInput(format!("no competitive price observed for {}", result.item_id))
        })?;
        let item = self
            .store
            .tracked_item(&result.item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tracked item {}", result.item_id)))?;

        let target = undercut_target(
            observed,
            self.config.undercut,
            result.min_profitable_price,
            item.cost.price_floor,
        )
        .ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "undercutting {observed} for {} would be unprofitable or below floor",
                item.item_id
            ))
        })?;

        self.submit(&item, target).await
    }

    /// Fetch the feed's status once and apply it if it moves forward.
    pub async fn poll_once(&self, feed_id: Uuid) -> Result<PriceUpdateFeed> {
        let mut feed = self.feed(feed_id).await?;
        if feed.status.is_terminal() {
            return Ok(feed);
        }

        let outcome = self
            .executor
            .execute(|| self.service.get_feed_status(&feed.external_feed_id))
            .await;
        let now = Utc::now();
        feed.last_polled_at = Some(now);

        let status = match outcome {
            CallOutcome::Succeeded(s) | CallOutcome::Recovered { value: s, .. } => s,
            other => {
                let reason = other.failure_reason().unwrap_or_default();
                warn!(feed_id = %feed.id, reason = %reason, "Feed status poll failed");
                self.store.save_feed(&feed).await?;
                return Ok(feed);
            }
        };

        if feed.status.can_advance_to(status) {
            debug!(feed_id = %feed.id, from = %feed.status, to = %status, "Feed advanced");
            feed.status = status;
            if status.is_terminal() {
                feed.completed_at = Some(now);
            }
        } else if status != feed.status {
            warn!(
                feed_id = %feed.id,
                current = %feed.status,
                reported = %status,
                "Ignoring backwards feed status"
            );
        }
        self.store.save_feed(&feed).await?;

        match feed.status {
            FeedStatus::Done if feed.completed_at == Some(now) => {
                self.store
                    .update_item_price(&feed.item_id, feed.submitted_price, now)
                    .await?;
                info!(
                    feed_id = %feed.id,
                    item_id = %feed.item_id,
                    price = %feed.submitted_price,
                    "Price update applied"
                );
            }
            FeedStatus::Cancelled | FeedStatus::Fatal if feed.completed_at == Some(now) => {
                warn!(feed_id = %feed.id, item_id = %feed.item_id, status = %feed.status, "Price update not applied");
            }
            _ => {}
        }
        Ok(feed)
    }

    /// Poll a feed on its own interval until it is terminal or cancelled.
    pub async fn spawn_polling(self: &Arc<Self>, feed_id: Uuid) {
        let (tx, mut cancelled) = watch::channel(false);
        if let Some(previous) = self.pollers.lock().await.insert(feed_id, tx) {
            let _ = previous.send(true);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.poll_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            debug!(feed_id = %feed_id, "Feed polling cancelled");
                            return;
                        }
                        continue;
                    }
                }

                match this.poll_once(feed_id).await {
                    Ok(feed) if feed.status.is_terminal() => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(feed_id = %feed_id, error = %e, "Feed polling stopped on error");
                        break;
                    }
                }
            }
            this.pollers.lock().await.remove(&feed_id);
        });
    }

    /// Stop the poller for one feed. Returns false if none was running.
    pub async fn cancel_polling(&self, feed_id: Uuid) -> bool {
        match self.pollers.lock().await.remove(&feed_id) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    pub async fn active_pollers(&self) -> usize {
        self.pollers.lock().await.len()
    }

    /// Non-terminal feeds older than `stuck_after`. Logged, left as they are.
    pub async fn stuck_feeds(&self) -> Result<Vec<PriceUpdateFeed>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.config.stuck_after)
            .map_err(|e| EngineError::Config(format!("stuck_after: {e}")))?;

        let stuck: Vec<PriceUpdateFeed> = self
            .store
            .open_feeds()
            .await?
            .into_iter()
            .filter(|f| f.age(now) > threshold)
            .collect();

        for feed in &stuck {
            warn!(
                feed_id = %feed.id,
                item_id = %feed.item_id,
                status = %feed.status,
                age_mins = feed.age(now).num_minutes(),
                "Price feed appears stuck"
            );
        }
        Ok(stuck)
    }

    /// Resume polling every open feed, e.g. after a restart.
    pub async fn resume_open_feeds(self: &Arc<Self>) -> Result<usize> {
        let open = self.store.open_feeds().await?;
        for feed in &open {
            self.spawn_polling(feed.id).await;
        }
        if !open.is_empty() {
            info!(count = open.len(), "Resumed polling of open price feeds");
        }
        Ok(open.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
