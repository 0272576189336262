//! Scan job orchestrator.
//!
//! Owns the lifecycle of one batch pass over the tracked catalog:
//!
//! ```text
//! start_run → running → completed   (iteration finished, or stopped)
//!                     → failed      (persistence fault or panic)
//! ```
//!
//! Items are processed with bounded concurrency over one shared executor,
//! so every worker draws from the same rate governor and trips the same
//! breaker. Per-item upstream failures are recorded as `ScanFailure` rows
//! and never abort the run. At most one run is active at a time, both in
//! this process and according to the store.
//!
//! The item set is fixed when the run is created and persisted with it, so
//! a resumed run finishes exactly the batch it started.

use chrono::Utc;
use futures::stream::{self, TryStreamExt};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{CallOutcome, ResilientExecutor};
use crate::error::{EngineError, Result};
use crate::platforms::{CallError, PricingService};
use crate::storage::ScanStore;
use crate::strategy::PricingEvaluator;
use crate::types::{
    FailureKind, RunStatus, ScanFailure, ScanItemResult, ScanRun, TrackedItem, TriggerSource,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Items in flight at once.
    pub concurrency: usize,
    /// Cap on items per run; `None` scans every active item.
    pub batch_size: Option<usize>,
    /// Orchestration-level attempts per item, each a full executor call.
    pub max_item_attempts: u32,
    #[serde(with = "millis")]
    pub item_retry_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_size: None,
            max_item_attempts: 2,
            item_retry_delay: Duration::from_secs(5),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Per-run knobs supplied by whoever starts the run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOverrides {
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// Run handle
// ---------------------------------------------------------------------------

/// A run executing in the background.
pub struct RunHandle {
    run_id: Uuid,
    stop: Arc<AtomicBool>,
    join: JoinHandle<Result<ScanRun>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stop dispatching new items. In-flight items still finish.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the run to close and return its final record.
    pub async fn wait(self) -> Result<ScanRun> {
        self.join.await?
    }
}

struct ActiveRun {
    run_id: Uuid,
    stop: Arc<AtomicBool>,
}

/// Frees the active-run slot however the driving task ends.
struct SlotGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
    run_id: Uuid,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|a| a.run_id == self.run_id) {
            *slot = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Succeeded,
    Failed,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct ScanOrchestrator {
    store: Arc<dyn ScanStore>,
    service: Arc<dyn PricingService>,
    executor: Arc<ResilientExecutor>,
    evaluator: PricingEvaluator,
    config: ScanConfig,
    active: Mutex<Option<ActiveRun>>,
    opportunities: Option<mpsc::Sender<ScanItemResult>>,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn ScanStore>,
        service: Arc<dyn PricingService>,
        executor: Arc<ResilientExecutor>,
        evaluator: PricingEvaluator,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            service,
            executor,
            evaluator,
            config,
            active: Mutex::new(None),
            opportunities: None,
        }
    }

    /// Push every flagged opportunity onto `sink` as it is found.
    pub fn with_opportunity_sink(mut self, sink: mpsc::Sender<ScanItemResult>) -> Self {
        self.opportunities = Some(sink);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Id of the run this process is currently driving.
    pub fn active_run(&self) -> Option<Uuid> {
        self.lock_active().as_ref().map(|a| a.run_id)
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<ScanRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("scan run {run_id}")))
    }

    /// Create a run over the active catalog and drive it in the background.
    pub async fn start_run(
        self: &Arc<Self>,
        trigger: TriggerSource,
        overrides: RunOverrides,
    ) -> Result<RunHandle> {
        let concurrency = self.concurrency(&overrides)?;
        let batch_size = overrides.batch_size.or(self.config.batch_size);
        if batch_size == Some(0) {
            return Err(EngineError::InvalidInput("batch_size must be at least 1".into()));
        }

        if let Some(active) = self.active_run() {
            return Err(EngineError::RunConflict(active));
        }
        if let Some(stalled) = self.store.running_run().await? {
            warn!(run_id = %stalled.id, "Refusing to start: a run is still marked running");
            return Err(EngineError::RunConflict(stalled.id));
        }

        let mut items = self.store.tracked_items(true).await?;
        items.shuffle(&mut rand::thread_rng());
        if let Some(limit) = batch_size {
            items.truncate(limit);
        }

        let run = ScanRun::start(trigger, items.len() as u32);
        let item_ids: Vec<String> = items.iter().map(|i| i.item_id.clone()).collect();
        let stop = self.reserve(run.id)?;
        if let Err(e) = self.store.create_run(&run, &item_ids).await {
            self.release(run.id);
            return Err(e);
        }

        info!(
            run_id = %run.id,
            trigger = %trigger,
            items = items.len(),
            concurrency,
            "Scan run started"
        );
        Ok(self.spawn_drive(run.id, items, concurrency, stop))
    }

    /// Pick up a run left `running` by a previous process. Counters are
    /// recomputed from persisted rows. The remaining items are the run's own
    /// item set minus those with a result or failure row, in their original
    /// order; ids since deleted from the catalog are skipped.
    pub async fn resume_run(self: &Arc<Self>, run_id: Uuid) -> Result<RunHandle> {
        let run = self.run_status(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidInput(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        let stop = self.reserve(run_id)?;
        let prepared = async {
            let run = self.store.recount_run(run_id).await?;
            let done = self.store.processed_items(run_id).await?;
            let mut catalog: HashMap<String, TrackedItem> = self
                .store
                .tracked_items(false)
                .await?
                .into_iter()
                .map(|i| (i.item_id.clone(), i))
                .collect();

            let mut items = Vec::new();
            for item_id in self.store.run_items(run_id).await? {
                if done.contains(&item_id) {
                    continue;
                }
                match catalog.remove(&item_id) {
                    Some(item) => items.push(item),
                    None => warn!(run_id = %run_id, item_id = %item_id, "Run item no longer tracked, skipped"),
                }
            }
            Ok::<_, EngineError>((run, items))
        }
        .await;

        let (run, items) = match prepared {
            Ok(p) => p,
            Err(e) => {
                self.release(run_id);
                return Err(e);
            }
        };

        info!(
            run_id = %run_id,
            succeeded = run.succeeded,
            failed = run.failed,
            remaining = items.len(),
            "Resuming stalled scan run"
        );
        Ok(self.spawn_drive(run_id, items, self.config.concurrency.max(1), stop))
    }

    /// Ask a run to stop. A run this process is driving stops dispatching
    /// and closes `completed` once in-flight items finish; a stalled
    /// `running` row with no driver is closed directly.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<()> {
        {
            let active = self.lock_active();
            if let Some(a) = active.as_ref().filter(|a| a.run_id == run_id) {
                a.stop.store(true, Ordering::SeqCst);
                info!(run_id = %run_id, "Stop requested");
                return Ok(());
            }
        }

        let run = self.run_status(run_id).await?;
        if run.status == RunStatus::Running {
            self.store
                .finish_run(run_id, RunStatus::Completed, Utc::now())
                .await?;
            info!(run_id = %run_id, "Closed stalled run on stop request");
        }
        Ok(())
    }

    /// Run the per-item pipeline once for one item, outside any run.
    pub async fn recheck_item(&self, item_id: &str) -> Result<ScanItemResult> {
        let item = self
            .store
            .tracked_item(item_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tracked item {item_id}")))?;

        let outcome = self
            .executor
            .execute(|| self.service.get_competitive_offers(&item.item_id))
            .await;

        let offers = match outcome {
            CallOutcome::Succeeded(offers) | CallOutcome::Recovered { value: offers, .. } => offers,
            other => return Err(EngineError::Upstream(other.failure_reason().unwrap_or_default())),
        };

        self.apply_hint(&offers.rate_limit_hint);
        let result = self
            .evaluator
            .to_result(None, &item, &offers)
            .map_err(|e| EngineError::Upstream(CallError::Malformed(e.to_string()).to_string()))?;
        self.store.write_result(&result).await?;
        self.notify_opportunity(&result).await;
        info!(item_id, opportunity = result.is_opportunity, "Item re-checked");
        Ok(result)
    }

    // ---- driving ----------------------------------------------------------

    fn concurrency(&self, overrides: &RunOverrides) -> Result<usize> {
        match overrides.concurrency.unwrap_or(self.config.concurrency) {
            0 => Err(EngineError::InvalidInput("concurrency must be at least 1".into())),
            n => Ok(n),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, run_id: Uuid) -> Result<Arc<AtomicBool>> {
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            return Err(EngineError::RunConflict(existing.run_id));
        }
        let stop = Arc::new(AtomicBool::new(false));
        *active = Some(ActiveRun {
            run_id,
            stop: stop.clone(),
        });
        Ok(stop)
    }

    fn release(&self, run_id: Uuid) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.run_id == run_id) {
            *active = None;
        }
    }

    fn spawn_drive(
        self: &Arc<Self>,
        run_id: Uuid,
        items: Vec<TrackedItem>,
        concurrency: usize,
        stop: Arc<AtomicBool>,
    ) -> RunHandle {
        let this = Arc::clone(self);
        let flag = stop.clone();
        let join = tokio::spawn(async move {
            let driver = Arc::clone(&this);
            let driving =
                tokio::spawn(async move { driver.drive(run_id, items, concurrency, flag).await });
            match driving.await {
                Ok(result) => result,
                Err(e) => {
                    // The slot guard went down with the panicked future.
                    error!(run_id = %run_id, error = %e, "Scan run task died");
                    if let Err(close) = this.store.finish_run(run_id, RunStatus::Failed, Utc::now()).await {
                        error!(run_id = %run_id, error = %close, "Could not close dead run");
                    }
                    Err(EngineError::Task(e))
                }
            }
        });
        RunHandle { run_id, stop, join }
    }

    async fn drive(
        &self,
        run_id: Uuid,
        items: Vec<TrackedItem>,
        concurrency: usize,
        stop: Arc<AtomicBool>,
    ) -> Result<ScanRun> {
        let _slot = SlotGuard {
            slot: &self.active,
            run_id,
        };

        let iteration = stream::iter(items.into_iter().map(Ok::<_, EngineError>))
            .try_for_each_concurrent(concurrency, |item| {
                let stop = &stop;
                async move {
                    if stop.load(Ordering::SeqCst) {
                        debug!(run_id = %run_id, item_id = %item.item_id, "Run stopping, item skipped");
                        return Ok(());
                    }
                    self.process_item(run_id, &item).await.map(|_| ())
                }
            })
            .await;

        let status = match &iteration {
            Ok(()) => RunStatus::Completed,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Scan run failed");
                RunStatus::Failed
            }
        };
        self.store.finish_run(run_id, status, Utc::now()).await?;
        iteration?;

        let run = self.run_status(run_id).await?;
        info!(
            run_id = %run_id,
            succeeded = run.succeeded,
            failed = run.failed,
            total = run.total,
            stopped = stop.load(Ordering::SeqCst),
            "Scan run completed"
        );
        Ok(run)
    }

    /// One item through executor → analyzer → calculator, with up to
    /// `max_item_attempts` tries. `Err` only for persistence faults.
    async fn process_item(&self, run_id: Uuid, item: &TrackedItem) -> Result<ItemOutcome> {
        let max_attempts = self.config.max_item_attempts.max(1);

        for attempt in 1..=max_attempts {
            let outcome = self
                .executor
                .execute(|| self.service.get_competitive_offers(&item.item_id))
                .await;

            let (kind, reason, retry) = match outcome {
                CallOutcome::Succeeded(offers) | CallOutcome::Recovered { value: offers, .. } => {
                    self.apply_hint(&offers.rate_limit_hint);
                    match self.evaluator.to_result(Some(run_id), item, &offers) {
                        Ok(result) => {
                            self.store.write_result(&result).await?;
                            self.store.increment_run_counters(run_id, 1, 0).await?;
                            self.notify_opportunity(&result).await;
                            debug!(
                                run_id = %run_id,
                                item_id = %item.item_id,
                                attempt,
                                opportunity = result.is_opportunity,
                                "Item scanned"
                            );
                            return Ok(ItemOutcome::Succeeded);
                        }
                        // Unpriceable offers will not improve on a retry.
                        Err(e) => {
                            let error = CallError::Malformed(e.to_string());
                            (classify(&error), error.to_string(), false)
                        }
                    }
                }
                CallOutcome::Rejected { error, .. } => (classify(&error), error.to_string(), false),
                CallOutcome::Exhausted { last_error, attempts } => (
                    FailureKind::TransientUpstream,
                    format!("{last_error} (after {attempts} calls)"),
                    true,
                ),
                open @ CallOutcome::BreakerOpen { .. } => (
                    FailureKind::BreakerOpen,
                    open.failure_reason().unwrap_or_default(),
                    true,
                ),
            };

            self.store
                .write_failure(&ScanFailure {
                    id: Uuid::new_v4(),
                    run_id,
                    item_id: item.item_id.clone(),
                    attempt,
                    kind,
                    reason: reason.clone(),
                    occurred_at: Utc::now(),
                })
                .await?;
            warn!(
                run_id = %run_id,
                item_id = %item.item_id,
                attempt,
                kind = %kind,
                reason = %reason,
                "Item attempt failed"
            );

            if !retry || attempt == max_attempts {
                break;
            }
            tokio::time::sleep(self.config.item_retry_delay).await;
        }

        self.store.increment_run_counters(run_id, 0, 1).await?;
        Ok(ItemOutcome::Failed)
    }

    fn apply_hint(&self, hint: &Option<f64>) {
        if let Some(rate) = *hint {
            self.executor.governor().apply_rate_hint(rate);
        }
    }

    /// Waits for room in the channel; a slow consumer slows the run rather
    /// than losing opportunities.
    async fn notify_opportunity(&self, result: &ScanItemResult) {
        if !result.is_opportunity {
            return;
        }
        if let Some(sink) = &self.opportunities {
            if sink.send(result.clone()).await.is_err() {
                warn!(item_id = %result.item_id, "Opportunity consumer gone, result not forwarded");
            }
        }
    }
}

fn classify(error: &CallError) -> FailureKind {
    match error {
        CallError::Malformed(_) => FailureKind::MalformedResponse,
        CallError::Rejected { .. } => FailureKind::RejectedRequest,
        CallError::RateLimited { .. } | CallError::Server { .. } | CallError::Transport(_) => {
            FailureKind::TransientUpstream
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
