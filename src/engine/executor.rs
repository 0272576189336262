//! Resilient call executor.
//!
//! The one place upstream calls are retried. Every attempt first takes a
//! token from the endpoint's rate governor and asks the shared circuit
//! breaker for admission. Retryable failures back off with
//! `min(max_delay, base * 2^attempt) + jitter * random()`; non-retryable
//! failures return immediately without touching the retry budget.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::breaker::{Admission, CircuitBreaker};
use super::governor::RateGovernor;
use crate::platforms::CallError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff.
    #[serde(with = "millis")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), jitter drawn fresh.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay);
        let jitter = self.jitter.mul_f64(rand::thread_rng().gen::<f64>());
        exp.min(self.max_delay) + jitter
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Everything that can come of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    /// First attempt worked.
    Succeeded(T),
    /// Worked after `attempts` tries.
    Recovered { value: T, attempts: u32 },
    /// Retry budget spent on retryable failures.
    Exhausted { attempts: u32, last_error: CallError },
    /// Non-retryable failure; returned as soon as it happened.
    Rejected { attempts: u32, error: CallError },
    /// The breaker refused; `attempts` network calls were made before that,
    /// the last of which failed with `last_error`.
    BreakerOpen {
        attempts: u32,
        last_error: Option<CallError>,
    },
}

impl<T> CallOutcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            CallOutcome::Succeeded(value) | CallOutcome::Recovered { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Succeeded(_) | CallOutcome::Recovered { .. })
    }

    /// Network attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            CallOutcome::Succeeded(_) => 1,
            CallOutcome::Recovered { attempts, .. }
            | CallOutcome::Exhausted { attempts, .. }
            | CallOutcome::Rejected { attempts, .. }
            | CallOutcome::BreakerOpen { attempts, .. } => *attempts,
        }
    }

    /// Human-readable failure, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            CallOutcome::Succeeded(_) | CallOutcome::Recovered { .. } => None,
            CallOutcome::Exhausted { last_error, .. } => Some(last_error.to_string()),
            CallOutcome::Rejected { error, .. } => Some(error.to_string()),
            CallOutcome::BreakerOpen {
                last_error: Some(err),
                ..
            } => Some(format!("circuit breaker open (last error: {err})")),
            CallOutcome::BreakerOpen { last_error: None, .. } => Some("circuit breaker open".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ResilientExecutor {
    name: String,
    policy: RetryPolicy,
    governor: Arc<RateGovernor>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientExecutor {
    pub fn new(
        name: impl Into<String>,
        policy: RetryPolicy,
        governor: Arc<RateGovernor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            governor,
            breaker,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `call` under pacing, retry and breaker protection.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            let Some(admission) = self.breaker.try_admit() else {
                debug!(executor = %self.name, attempts, "Breaker open, failing fast");
                return CallOutcome::BreakerOpen { attempts, last_error };
            };

            let probe = ProbeGuard {
                breaker: &self.breaker,
                armed: admission == Admission::Probe,
            };
            self.governor.acquire().await;
            attempts += 1;
            let result = call().await;
            probe.disarm();

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    if admission == Admission::Probe {
                        info!(executor = %self.name, "Probe call succeeded");
                    }
                    return if attempts == 1 {
                        CallOutcome::Succeeded(value)
                    } else {
                        debug!(executor = %self.name, attempts, "Call recovered after retry");
                        CallOutcome::Recovered { value, attempts }
                    };
                }
                Err(err) if !err.is_retryable() => {
                    // The service answered; it just said no.
                    self.breaker.record_success();
                    warn!(executor = %self.name, error = %err, "Non-retryable upstream error");
                    return CallOutcome::Rejected { attempts, error: err };
                }
                Err(err) => {
                    if let CallError::RateLimited { rate_limit_hint: Some(hint) } = &err {
                        self.governor.apply_rate_hint(*hint);
                    }
                    self.breaker.record_failure();

                    let retries_used = attempts - 1;
                    if retries_used >= self.policy.max_retries {
                        warn!(executor = %self.name, attempts, error = %err, "Retry budget exhausted");
                        return CallOutcome::Exhausted { attempts, last_error: err };
                    }

                    let delay = self.policy.delay_for(retries_used);
                    debug!(
                        executor = %self.name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after backoff"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Hands the half-open probe slot back if the caller is dropped mid-attempt.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
