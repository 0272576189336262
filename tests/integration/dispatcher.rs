//! Opportunity → price feed → applied price, end to end.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use offerscan::engine::{DispatcherConfig, PriceDispatcher, RunOverrides, ScanConfig, ScanOrchestrator};
use offerscan::error::EngineError;
use offerscan::storage::{ScanStore, SqliteStore};
use offerscan::strategy::PricingEvaluator;
use offerscan::types::*;

use crate::fast_executor;
use crate::mock_service::{rival, MockPricingService};

async fn seeded_store(item: TrackedItem) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    store.upsert_tracked_item(&item).await.unwrap();
    store
}

fn dispatcher(store: Arc<SqliteStore>, service: &MockPricingService, stuck_after: Duration) -> Arc<PriceDispatcher> {
    Arc::new(PriceDispatcher::new(
        store,
        Arc::new(service.clone()),
        fast_executor("feeds"),
        DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            stuck_after,
            ..DispatcherConfig::default()
        },
    ))
}

#[tokio::test]
async fn test_opportunity_reprices_item() {
    let mut item = TrackedItem::new("B01", "GBP", CostModel::new(dec!(4), dec!(1)));
    item.current_price = Some(dec!(12.00));
    let store = seeded_store(item).await;

    let service = MockPricingService::new();
    service.set_offers("B01", vec![rival("R1", dec!(10.00), FulfillmentChannel::Merchant)]);
    service.script_feed(&[FeedStatus::InQueue, FeedStatus::InProgress, FeedStatus::Done]);

    let (tx, mut rx) = mpsc::channel(8);
    let orchestrator = Arc::new(
        ScanOrchestrator::new(
            store.clone(),
            Arc::new(service.clone()),
            fast_executor("offers"),
            PricingEvaluator::default(),
            ScanConfig::default(),
        )
        .with_opportunity_sink(tx),
    );
    let dispatcher = dispatcher(store.clone(), &service, Duration::from_secs(1800));

    orchestrator
        .start_run(TriggerSource::Scheduled, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let opportunity = rx.recv().await.unwrap();
    assert_eq!(opportunity.item_id, "B01");

    let feed = dispatcher.submit_opportunity(&opportunity).await.unwrap();
    assert_eq!(feed.submitted_price, dec!(9.99));
    assert_eq!(feed.previous_price, Some(dec!(12.00)));
    assert_eq!(feed.status, FeedStatus::Submitted);
    assert_eq!(service.submitted(), vec![("B01".to_string(), dec!(9.99))]);

    let mut last = feed.status;
    for _ in 0..3 {
        last = dispatcher.poll_once(feed.id).await.unwrap().status;
    }
    assert_eq!(last, FeedStatus::Done);

    let done = dispatcher.feed(feed.id).await.unwrap();
    assert!(done.completed_at.is_some());
    let item = store.tracked_item("B01").await.unwrap().unwrap();
    assert_eq!(item.current_price, Some(dec!(9.99)));
    assert!(store.open_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_background_polling_reaches_terminal_state() {
    let store = seeded_store(TrackedItem::new("B02", "GBP", CostModel::new(dec!(4), dec!(1)))).await;
    let service = MockPricingService::new();
    service.script_feed(&[FeedStatus::InProgress, FeedStatus::Fatal]);
    let dispatcher = dispatcher(store.clone(), &service, Duration::from_secs(1800));

    let item = store.tracked_item("B02").await.unwrap().unwrap();
    let feed = dispatcher.submit(&item, dec!(11.00)).await.unwrap();
    dispatcher.spawn_polling(feed.id).await;

    let mut status = FeedStatus::Submitted;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = dispatcher.feed(feed.id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, FeedStatus::Fatal);

    // A fatal feed leaves the listed price untouched.
    let item = store.tracked_item("B02").await.unwrap().unwrap();
    assert_eq!(item.current_price, None);
}

#[tokio::test]
async fn test_unprofitable_opportunity_is_refused() {
    let mut item = TrackedItem::new("B03", "GBP", CostModel::new(dec!(4), dec!(1)));
    item.cost.price_floor = Some(dec!(9.995));
    let store = seeded_store(item).await;
    let service = MockPricingService::new();
    service.set_offers("B03", vec![rival("R1", dec!(10.00), FulfillmentChannel::Merchant)]);

    let orchestrator = ScanOrchestrator::new(
        store.clone(),
        Arc::new(service.clone()),
        fast_executor("offers"),
        PricingEvaluator::default(),
        ScanConfig::default(),
    );
    let result = orchestrator.recheck_item("B03").await.unwrap();
    assert!(result.is_opportunity);

    let dispatcher = dispatcher(store, &service, Duration::from_secs(1800));
    let err = dispatcher.submit_opportunity(&result).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert!(service.submitted().is_empty());
}

#[tokio::test]
async fn test_resume_and_stuck_feeds() {
    let store = seeded_store(TrackedItem::new("B04", "GBP", CostModel::new(dec!(4), dec!(1)))).await;
    let service = MockPricingService::new();
    service.script_feed(&[FeedStatus::InQueue]);

    let first = dispatcher(store.clone(), &service, Duration::ZERO);
    let item = store.tracked_item("B04").await.unwrap().unwrap();
    let feed = first.submit(&item, dec!(10.50)).await.unwrap();

    // A fresh dispatcher (as after a restart) picks the open feed back up.
    let restarted = dispatcher(store.clone(), &service, Duration::ZERO);
    assert_eq!(restarted.resume_open_feeds().await.unwrap(), 1);
    assert_eq!(restarted.active_pollers().await, 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let stuck = restarted.stuck_feeds().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, feed.id);

    assert!(restarted.cancel_polling(feed.id).await);
    assert_eq!(restarted.active_pollers().await, 0);
    // Stuck detection reports but never changes a feed.
    assert!(!restarted.feed(feed.id).await.unwrap().status.is_terminal());
}

#[tokio::test]
async fn test_feed_stuck_after_startup_is_reported_later() {
    let store = seeded_store(TrackedItem::new("B05", "GBP", CostModel::new(dec!(4), dec!(1)))).await;
    let service = MockPricingService::new();
    service.script_feed(&[FeedStatus::InProgress]);
    let dispatcher = dispatcher(store.clone(), &service, Duration::from_millis(50));

    // Nothing outstanding at startup.
    assert!(dispatcher.stuck_feeds().await.unwrap().is_empty());

    let item = store.tracked_item("B05").await.unwrap().unwrap();
    let feed = dispatcher.submit(&item, dec!(10.50)).await.unwrap();
    dispatcher.poll_once(feed.id).await.unwrap();
    assert!(dispatcher.stuck_feeds().await.unwrap().is_empty());

    // A later scheduled check sees it once it has aged past the threshold.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let stuck = dispatcher.stuck_feeds().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].status, FeedStatus::InProgress);
}
