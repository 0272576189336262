//! Full scan runs against the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use offerscan::engine::{RunOverrides, ScanConfig, ScanOrchestrator};
use offerscan::platforms::CallError;
use offerscan::storage::{ScanStore, SqliteStore};
use offerscan::strategy::offers::OfferAnalyzer;
use offerscan::strategy::profit::{ProfitCalculator, ProfitConfig};
use offerscan::strategy::PricingEvaluator;
use offerscan::types::*;

use crate::fast_executor;
use crate::mock_service::{rival, MockPricingService};

const SELLER: &str = "ME";

struct Harness {
    store: Arc<SqliteStore>,
    service: MockPricingService,
    orchestrator: Arc<ScanOrchestrator>,
}

async fn harness(items: &[(&str, Decimal, Decimal)]) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    for (id, base, shipping) in items {
        store
            .upsert_tracked_item(&TrackedItem::new(*id, "GBP", CostModel::new(*base, *shipping)))
            .await
            .unwrap();
    }

    let service = MockPricingService::new();
    let orchestrator = orchestrator(&store, &service);
    Harness {
        store,
        service,
        orchestrator,
    }
}

/// An engine over `store`, as a freshly started process would build it.
fn orchestrator(store: &Arc<SqliteStore>, service: &MockPricingService) -> Arc<ScanOrchestrator> {
    Arc::new(ScanOrchestrator::new(
        store.clone(),
        Arc::new(service.clone()),
        fast_executor("offers"),
        PricingEvaluator::new(
            OfferAnalyzer::new(SELLER, vec![FulfillmentChannel::Marketplace, FulfillmentChannel::Merchant]),
            ProfitCalculator::new(ProfitConfig::default()),
        ),
        ScanConfig {
            concurrency: 2,
            batch_size: None,
            max_item_attempts: 2,
            item_retry_delay: Duration::from_millis(5),
        },
    ))
}

async fn only_result(store: &SqliteStore, item_id: &str) -> ScanItemResult {
    let mut results = store.results_for_item(item_id, 10).await.unwrap();
    assert_eq!(results.len(), 1, "expected exactly one result for {item_id}");
    results.remove(0)
}

#[tokio::test]
async fn test_full_run_prices_every_item() {
    let h = harness(&[
        ("WIN", dec!(4), dec!(1)),
        ("OPP", dec!(4), dec!(1)),
        ("LOSS", dec!(9), dec!(1)),
        ("EMPTY", dec!(4), dec!(1)),
    ])
    .await;
    h.service.set_offers(
        "WIN",
        vec![
            rival("R1", dec!(10), FulfillmentChannel::Merchant),
            rival(SELLER, dec!(9.50), FulfillmentChannel::Marketplace),
        ],
    );
    h.service.set_offers("OPP", vec![rival("R1", dec!(10), FulfillmentChannel::Merchant)]);
    h.service.set_offers("LOSS", vec![rival("R1", dec!(10), FulfillmentChannel::Merchant)]);

    let handle = h
        .orchestrator
        .start_run(TriggerSource::Scheduled, RunOverrides::default())
        .await
        .unwrap();
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total, 4);
    assert_eq!(run.succeeded, 4);
    assert_eq!(run.failed, 0);
    assert!(run.completed_at.is_some());

    let win = only_result(&h.store, "WIN").await;
    assert!(win.is_winner);
    assert_eq!(win.own_rank, Some(1));
    assert_eq!(win.observed_price, Some(dec!(9.50)));

    let opp = only_result(&h.store, "OPP").await;
    assert!(!opp.is_winner);
    assert!(opp.is_opportunity);
    assert_eq!(opp.margin, Some(dec!(3.50)));

    let loss = only_result(&h.store, "LOSS").await;
    assert!(!loss.is_opportunity);
    assert!(loss.margin.unwrap() < Decimal::ZERO);

    let empty = only_result(&h.store, "EMPTY").await;
    assert_eq!(empty.observed_price, None);
    assert_eq!(empty.competitor_count, 0);
    assert!(!empty.is_opportunity);

    let stats = h
        .store
        .stats_since(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(stats.runs_started, 1);
    assert_eq!(stats.results_captured, 4);
    assert_eq!(stats.featured_offer_wins, 1);
    assert_eq!(stats.failure_rows, 0);
}

#[tokio::test]
async fn test_rejected_item_fails_without_retry() {
    let h = harness(&[("GOOD", dec!(4), dec!(1)), ("BAD", dec!(4), dec!(1))]).await;
    h.service.set_offers("GOOD", vec![rival("R1", dec!(10), FulfillmentChannel::Merchant)]);
    h.service.fail_item(
        "BAD",
        CallError::Rejected {
            status: 403,
            message: "not your listing".into(),
        },
    );

    let run = h
        .orchestrator
        .start_run(TriggerSource::Admin, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.succeeded, 1);
    assert_eq!(run.failed, 1);
    assert_eq!(h.service.offer_calls("BAD"), 1);

    let failures = h.store.failures_for_run(run.id).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].item_id, "BAD");
    assert_eq!(failures[0].kind, FailureKind::RejectedRequest);
    assert!(h.store.results_for_item("BAD", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_item_records_each_attempt() {
    let h = harness(&[("FLAKY", dec!(4), dec!(1))]).await;
    h.service.fail_item(
        "FLAKY",
        CallError::Server {
            status: 503,
            message: "busy".into(),
        },
    );

    let run = h
        .orchestrator
        .start_run(TriggerSource::Admin, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.failed, 1);
    // Two item attempts, each one call plus one executor retry.
    assert_eq!(h.service.offer_calls("FLAKY"), 4);

    let failures = h.store.failures_for_run(run.id).await.unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.kind == FailureKind::TransientUpstream));
    let mut attempts: Vec<u32> = failures.iter().map(|f| f.attempt).collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_batch_override_limits_run() {
    let h = harness(&[
        ("A", dec!(4), dec!(1)),
        ("B", dec!(4), dec!(1)),
        ("C", dec!(4), dec!(1)),
    ])
    .await;

    let run = h
        .orchestrator
        .start_run(
            TriggerSource::Admin,
            RunOverrides {
                batch_size: Some(2),
                concurrency: Some(1),
            },
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.total, 2);
    assert_eq!(run.succeeded, 2);
    assert_eq!(h.store.processed_items(run.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_inactive_items_are_skipped() {
    let h = harness(&[("ON", dec!(4), dec!(1))]).await;
    let mut off = TrackedItem::new("OFF", "GBP", CostModel::new(dec!(4), dec!(1)));
    off.active = false;
    h.store.upsert_tracked_item(&off).await.unwrap();

    let run = h
        .orchestrator
        .start_run(TriggerSource::Admin, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(run.total, 1);
    assert_eq!(h.service.offer_calls("OFF"), 0);
}

#[tokio::test]
async fn test_second_run_after_first_completes() {
    let h = harness(&[("A", dec!(4), dec!(1))]).await;

    let first = h
        .orchestrator
        .start_run(TriggerSource::Scheduled, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = h
        .orchestrator
        .start_run(TriggerSource::Scheduled, RunOverrides::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(h.store.results_for_item("A", 10).await.unwrap().len(), 2);
    assert!(h.orchestrator.active_run().is_none());
}

#[tokio::test]
async fn test_interrupted_batch_resumes_its_own_items() {
    let catalog: Vec<(String, Decimal, Decimal)> =
        (1..=8).map(|i| (format!("ITEM-{i}"), dec!(4), dec!(1))).collect();
    let refs: Vec<(&str, Decimal, Decimal)> =
        catalog.iter().map(|(id, b, s)| (id.as_str(), *b, *s)).collect();
    let h = harness(&refs).await;

    // The first process scans one item and dies inside the second lookup.
    h.service.hang_after(1);
    let handle = h
        .orchestrator
        .start_run(
            TriggerSource::Scheduled,
            RunOverrides {
                batch_size: Some(2),
                concurrency: Some(1),
            },
        )
        .await
        .unwrap();
    let run_id = handle.run_id();
    for _ in 0..200 {
        if h.service.total_calls() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.service.total_calls(), 2);

    let batch = h.store.run_items(run_id).await.unwrap();
    assert_eq!(batch.len(), 2);
    let first_log = h.service.call_log();
    assert_eq!(first_log[0], batch[0]);
    assert_eq!(first_log[1], batch[1]);
    assert_eq!(h.store.processed_items(run_id).await.unwrap().len(), 1);

    // A restarted process over the same database finishes the run.
    let restarted_service = MockPricingService::new();
    let restarted = orchestrator(&h.store, &restarted_service);
    let run = restarted.resume_run(run_id).await.unwrap().wait().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total, 2);
    assert_eq!((run.succeeded, run.failed), (2, 0));
    assert_eq!(restarted_service.call_log(), vec![batch[1].clone()]);
    for item_id in &batch {
        assert_eq!(h.store.results_for_item(item_id, 10).await.unwrap().len(), 1);
    }
    let expected: HashSet<String> = batch.into_iter().collect();
    assert_eq!(h.store.processed_items(run_id).await.unwrap(), expected);
}
