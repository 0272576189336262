//! OFFERSCAN: rate-governed featured-offer scanning and repricing engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, picks up work a previous process left behind, and
//! runs scheduled scans until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use offerscan::admin::{self, routes::AdminState};
use offerscan::config::{AppConfig, FEEDS_ENDPOINT, OFFERS_ENDPOINT};
use offerscan::engine::{
    CircuitBreaker, PriceDispatcher, ResilientExecutor, RunHandle, RunOverrides,
    ScanOrchestrator,
};
use offerscan::error::EngineError;
use offerscan::platforms::credentials::{EnvTokenProvider, TokenCache};
use offerscan::platforms::http::HttpPricingClient;
use offerscan::platforms::PricingService;
use offerscan::storage::{ScanStore, SqliteStore};
use offerscan::strategy::offers::OfferAnalyzer;
use offerscan::strategy::profit::ProfitCalculator;
use offerscan::strategy::PricingEvaluator;
use offerscan::types::{ScanItemResult, TriggerSource};

/// Buffered opportunities awaiting auto-submission.
const OPPORTUNITY_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load_default()?;
    init_logging();

    info!(
        engine = %cfg.engine.name,
        seller_id = %cfg.engine.seller_id,
        scan_interval_secs = cfg.engine.scan_interval_secs,
        concurrency = cfg.scan.concurrency,
        auto_submit = cfg.dispatcher.auto_submit,
        "OFFERSCAN starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = Arc::new(
        SqliteStore::connect(&cfg.storage.database_url)
            .await
            .with_context(|| format!("Failed to open store at {}", cfg.storage.database_url))?,
    );
    let store_dyn: Arc<dyn ScanStore> = store.clone();

    let credentials = Arc::new(TokenCache::new(Box::new(EnvTokenProvider::new(
        cfg.service.access_token_env.clone(),
    ))));
    let service: Arc<dyn PricingService> = Arc::new(HttpPricingClient::new(
        &cfg.service.base_url,
        credentials,
        cfg.service.timeout(),
    )?);

    // One governor per endpoint; each endpoint also gets its own breaker.
    let governors = cfg.governor_registry();
    let offers_executor = Arc::new(ResilientExecutor::new(
        OFFERS_ENDPOINT,
        cfg.retry.clone(),
        governors.for_endpoint(OFFERS_ENDPOINT),
        Arc::new(CircuitBreaker::new(OFFERS_ENDPOINT, cfg.breaker.clone())),
    ));
    let feeds_executor = Arc::new(ResilientExecutor::new(
        FEEDS_ENDPOINT,
        cfg.retry.clone(),
        governors.for_endpoint(FEEDS_ENDPOINT),
        Arc::new(CircuitBreaker::new(FEEDS_ENDPOINT, cfg.breaker.clone())),
    ));

    let evaluator = PricingEvaluator::new(
        OfferAnalyzer::new(cfg.engine.seller_id.clone(), cfg.pricing.channel_preference.clone()),
        ProfitCalculator::new(cfg.pricing.profit()),
    );

    let dispatcher = Arc::new(PriceDispatcher::new(
        store_dyn.clone(),
        service.clone(),
        feeds_executor,
        cfg.dispatcher.clone(),
    ));

    let mut orchestrator = ScanOrchestrator::new(
        store_dyn.clone(),
        service,
        offers_executor,
        evaluator,
        cfg.scan.clone(),
    );
    if cfg.dispatcher.auto_submit {
        let (tx, rx) = mpsc::channel(OPPORTUNITY_BUFFER);
        orchestrator = orchestrator.with_opportunity_sink(tx);
        spawn_auto_submit(dispatcher.clone(), rx);
    }
    let orchestrator = Arc::new(orchestrator);

    // -- Recover work left by a previous process --------------------------

    let mut current: Option<RunHandle> = None;
    if let Some(stalled) = store_dyn.running_run().await? {
        if cfg.engine.resume_on_startup {
            match orchestrator.resume_run(stalled.id).await {
                Ok(handle) => current = Some(handle),
                Err(e) => error!(run_id = %stalled.id, error = %e, "Failed to resume stalled run"),
            }
        } else {
            warn!(
                run_id = %stalled.id,
                "A run is still marked running; new runs are blocked until it is stopped or resumed"
            );
        }
    }

    if let Err(e) = dispatcher.resume_open_feeds().await {
        error!(error = %e, "Failed to resume open price feeds");
    }
    report_stuck_feeds(&dispatcher).await;

    // -- Admin API ----------------------------------------------------------

    if cfg.admin.enabled {
        let state = Arc::new(AdminState::new(
            store_dyn.clone(),
            orchestrator.clone(),
            dispatcher.clone(),
            cfg.engine.currency.clone(),
        ));
        admin::spawn_admin(state, cfg.admin.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if cfg.engine.scan_interval_secs == 0 {
        info!("Scheduled scans disabled. Press Ctrl+C to stop.");
        shutdown.await.context("Failed to listen for shutdown signal")?;
    } else {
        let mut interval = tokio::time::interval(Duration::from_secs(cfg.engine.scan_interval_secs));
        info!(
            interval_secs = cfg.engine.scan_interval_secs,
            "Entering main loop. Press Ctrl+C to stop."
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    report_stuck_feeds(&dispatcher).await;
                    match orchestrator.start_run(TriggerSource::Scheduled, RunOverrides::default()).await {
                        Ok(handle) => current = Some(handle),
                        Err(EngineError::RunConflict(active)) => {
                            info!(active_run = %active, "Previous run still in progress, skipping tick");
                        }
                        Err(e) => error!(error = %e, "Failed to start scheduled run"),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received.");
                    break;
                }
            }
        }
    }

    // Let in-flight items finish so the run closes cleanly.
    if let Some(handle) = current {
        handle.stop();
        match handle.wait().await {
            Ok(run) => info!(
                run_id = %run.id,
                status = %run.status,
                succeeded = run.succeeded,
                failed = run.failed,
                "Final run closed"
            ),
            Err(e) => error!(error = %e, "Run did not close cleanly"),
        }
    }

    store.pool().close().await;
    info!("OFFERSCAN shut down cleanly.");
    Ok(())
}

/// Reprice each flagged opportunity and track its feed to completion.
fn spawn_auto_submit(dispatcher: Arc<PriceDispatcher>, mut rx: mpsc::Receiver<ScanItemResult>) {
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match dispatcher.submit_opportunity(&result).await {
                Ok(feed) => dispatcher.spawn_polling(feed.id).await,
                Err(EngineError::InvalidInput(reason)) => {
                    info!(item_id = %result.item_id, reason = %reason, "Opportunity not repriced");
                }
                Err(e) => error!(item_id = %result.item_id, error = %e, "Auto-submit failed"),
            }
        }
    });
}

/// Feeds that have sat non-terminal past the stuck threshold are logged by
/// the dispatcher; this only adds the summary line.
async fn report_stuck_feeds(dispatcher: &PriceDispatcher) {
    match dispatcher.stuck_feeds().await {
        Ok(stuck) if !stuck.is_empty() => {
            warn!(count = stuck.len(), "Stuck price feeds need attention");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Failed to check for stuck price feeds"),
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("offerscan=info"));

    let json_logging = std::env::var("OFFERSCAN_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
