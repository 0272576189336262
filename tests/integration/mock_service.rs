//! Mock pricing service for integration testing.
//!
//! Provides a deterministic `PricingService` implementation that returns
//! scripted offers per item, can be told to fail specific items, and
//! plays back a fixed sequence of feed statuses. All in-memory.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use offerscan::platforms::{CallError, PricingService};
use offerscan::types::*;

/// A mock pricing service for deterministic testing.
///
/// Offers, failures and feed progress are fully controllable from test
/// code; every call is counted.
#[derive(Clone, Default)]
pub struct MockPricingService {
    offers: Arc<Mutex<HashMap<String, Vec<Offer>>>>,
    /// Items that answer with this error on every offers lookup.
    failing: Arc<Mutex<HashMap<String, CallError>>>,
    /// Statuses returned by successive feed polls; the last one repeats.
    feed_script: Arc<Mutex<VecDeque<FeedStatus>>>,
    offer_calls: Arc<Mutex<HashMap<String, u32>>>,
    /// Offers lookups in call order.
    call_log: Arc<Mutex<Vec<String>>>,
    /// Lookups after this many never return, like a process that died mid-call.
    hang_after: Arc<Mutex<Option<u32>>>,
    total_calls: Arc<AtomicU32>,
    submitted: Arc<Mutex<Vec<(String, Decimal)>>>,
}

impl MockPricingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the offers returned for one item.
    pub fn set_offers(&self, item_id: &str, offers: Vec<Offer>) {
        self.offers.lock().unwrap().insert(item_id.to_string(), offers);
    }

    /// Make every offers lookup for `item_id` fail with `error`.
    pub fn fail_item(&self, item_id: &str, error: CallError) {
        self.failing.lock().unwrap().insert(item_id.to_string(), error);
    }

    pub fn script_feed(&self, statuses: &[FeedStatus]) {
        *self.feed_script.lock().unwrap() = statuses.iter().copied().collect();
    }

    pub fn offer_calls(&self, item_id: &str) -> u32 {
        self.offer_calls.lock().unwrap().get(item_id).copied().unwrap_or(0)
    }

    /// Every offers lookup after the first `calls` hangs forever.
    pub fn hang_after(&self, calls: u32) {
        *self.hang_after.lock().unwrap() = Some(calls);
    }

    pub fn total_calls(&self) -> u32 {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<(String, Decimal)> {
        self.submitted.lock().unwrap().clone()
    }
}

/// An offer from another seller.
pub fn rival(seller_id: &str, price: Decimal, channel: FulfillmentChannel) -> Offer {
    Offer {
        seller_id: seller_id.to_string(),
        price,
        shipping: Decimal::ZERO,
        currency: "GBP".into(),
        channel,
    }
}

#[async_trait]
impl PricingService for MockPricingService {
    async fn get_competitive_offers(&self, item_id: &str) -> Result<CompetitiveOffers, CallError> {
        *self.offer_calls.lock().unwrap().entry(item_id.to_string()).or_insert(0) += 1;
        self.call_log.lock().unwrap().push(item_id.to_string());
        let n = self.total_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = *self.hang_after.lock().unwrap();
        if limit.is_some_and(|limit| n > limit) {
            futures::future::pending::<()>().await;
        }
        if let Some(err) = self.failing.lock().unwrap().get(item_id) {
            return Err(err.clone());
        }
        Ok(CompetitiveOffers {
            offers: self.offers.lock().unwrap().get(item_id).cloned().unwrap_or_default(),
            rate_limit_hint: None,
        })
    }

    async fn submit_price_feed(&self, item_id: &str, new_price: Decimal) -> Result<String, CallError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((item_id.to_string(), new_price));
        Ok(format!("FEED-{}", submitted.len()))
    }

    async fn get_feed_status(&self, _feed_id: &str) -> Result<FeedStatus, CallError> {
        let mut script = self.feed_script.lock().unwrap();
        let status = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        Ok(status.unwrap_or(FeedStatus::InQueue))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mock_counts_calls() {
        let svc = MockPricingService::new();
        svc.set_offers("B01", vec![rival("R1", dec!(10), FulfillmentChannel::Merchant)]);
        let offers = svc.get_competitive_offers("B01").await.unwrap();
        assert_eq!(offers.offers.len(), 1);
        assert_eq!(svc.offer_calls("B01"), 1);
        assert_eq!(svc.offer_calls("B02"), 0);
    }

    #[tokio::test]
    async fn test_feed_script_repeats_last_status() {
        let svc = MockPricingService::new();
        svc.script_feed(&[FeedStatus::InProgress, FeedStatus::Done]);
        assert_eq!(svc.get_feed_status("F").await.unwrap(), FeedStatus::InProgress);
        assert_eq!(svc.get_feed_status("F").await.unwrap(), FeedStatus::Done);
        assert_eq!(svc.get_feed_status("F").await.unwrap(), FeedStatus::Done);
    }

    #[tokio::test]
    async fn test_hang_after_blocks_later_calls() {
        let svc = MockPricingService::new();
        svc.hang_after(1);
        assert!(svc.get_competitive_offers("A").await.is_ok());
        let hung = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            svc.get_competitive_offers("B"),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(svc.total_calls(), 2);
        assert_eq!(svc.call_log(), vec!["A", "B"]);
    }
}
