//! Rate governor.
//!
//! A token bucket per upstream endpoint. `acquire()` waits until a token
//! is available; every wait is stretched by a random jitter fraction so
//! workers sharing a governor do not wake in lockstep. The service may
//! advertise a tighter rate at any time (`apply_rate_hint`); the governor
//! follows it down immediately and back up only as far as the operator
//! ceiling.
//!
//! Governors are constructed explicitly through a `GovernorRegistry` and
//! passed to the components that need them. There is no global instance.

use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Rate used for any endpoint nobody configured.
pub const UNSEEN_ENDPOINT_RATE: f64 = 0.5;

/// Slowest rate a hint can push us to.
const MIN_RATE: f64 = 0.01;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Steady-state tokens per second.
    pub rate_per_sec: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// Fraction of each wait added as random jitter (0.30-0.40 expected).
    pub jitter: f64,
    /// Hints can never push the rate above this.
    pub ceiling_per_sec: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: UNSEEN_ENDPOINT_RATE,
            burst: 1,
            jitter: 0.35,
            ceiling_per_sec: 1.0,
        }
    }
}

impl GovernorConfig {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
            ceiling_per_sec: rate_per_sec,
            ..Self::default()
        }
    }

    /// Clamp nonsense values rather than fail at startup.
    fn sanitized(mut self) -> Self {
        if !(self.rate_per_sec.is_finite() && self.rate_per_sec > 0.0) {
            self.rate_per_sec = UNSEEN_ENDPOINT_RATE;
        }
        if !(self.ceiling_per_sec.is_finite() && self.ceiling_per_sec > 0.0) {
            self.ceiling_per_sec = self.rate_per_sec;
        }
        self.rate_per_sec = self.rate_per_sec.max(MIN_RATE).min(self.ceiling_per_sec);
        self.burst = self.burst.max(1);
        self.jitter = if self.jitter.is_finite() { self.jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    ceiling: f64,
}

impl Bucket {
    fn refill(&mut self, now: Instant, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(burst);
        self.last_refill = now;
    }
}

/// Token-bucket limiter shared by every worker calling one endpoint.
#[derive(Debug)]
pub struct RateGovernor {
    name: String,
    burst: f64,
    jitter: f64,
    bucket: Mutex<Bucket>,
}

impl RateGovernor {
    pub fn new(name: impl Into<String>, config: GovernorConfig) -> Self {
        let config = config.sanitized();
        let burst = f64::from(config.burst);
        Self {
            name: name.into(),
            burst,
            jitter: config.jitter,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
                rate: config.rate_per_sec,
                ceiling: config.ceiling_per_sec,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current steady-state rate.
    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    pub fn ceiling(&self) -> f64 {
        self.lock().ceiling
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_take() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            let jittered = wait.mul_f64(1.0 + self.jitter * rand::thread_rng().gen::<f64>());
            debug!(governor = %self.name, wait_ms = jittered.as_millis() as u64, "Waiting for token");
            tokio::time::sleep(jittered).await;
        }
    }

    /// Take a token if one is ready, otherwise report how long until one is.
    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.lock();
        bucket.refill(Instant::now(), self.burst);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate))
        }
    }

    /// Follow a rate advertised by the service.
    ///
    /// Lower hints apply immediately. Higher hints raise the rate no further
    /// than the ceiling.
    pub fn apply_rate_hint(&self, advertised: f64) {
        if !(advertised.is_finite() && advertised > 0.0) {
            return;
        }
        let mut bucket = self.lock();
        bucket.refill(Instant::now(), self.burst);

        let target = advertised.min(bucket.ceiling).max(MIN_RATE);
        if target < bucket.rate {
            warn!(
                governor = %self.name,
                from = bucket.rate,
                to = target,
                "Upstream advertised a tighter rate, clamping down"
            );
            bucket.rate = target;
        } else if target > bucket.rate {
            info!(governor = %self.name, from = bucket.rate, to = target, "Raising rate toward advertised limit");
            bucket.rate = target;
        }
    }

    /// Explicit operator override of the ceiling. The current rate is
    /// lowered if it now exceeds the new ceiling, never raised.
    pub fn override_ceiling(&self, ceiling: f64) {
        if !(ceiling.is_finite() && ceiling > 0.0) {
            return;
        }
        let mut bucket = self.lock();
        bucket.refill(Instant::now(), self.burst);
        info!(governor = %self.name, from = bucket.ceiling, to = ceiling, "Ceiling overridden");
        bucket.ceiling = ceiling;
        if bucket.rate > ceiling {
            bucket.rate = ceiling;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Hands out one governor per endpoint name.
///
/// Configured endpoints get their configured limits; anything else gets a
/// conservative sub-1 req/s default on first use.
#[derive(Debug, Default)]
pub struct GovernorRegistry {
    configured: HashMap<String, GovernorConfig>,
    governors: Mutex<HashMap<String, Arc<RateGovernor>>>,
}

impl GovernorRegistry {
    pub fn new(configured: HashMap<String, GovernorConfig>) -> Self {
        Self {
            configured,
            governors: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> Arc<RateGovernor> {
        let mut governors = self.governors.lock().unwrap_or_else(PoisonError::into_inner);
        governors
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                let config = match self.configured.get(endpoint) {
                    Some(c) => c.clone(),
                    None => {
                        info!(endpoint, rate = UNSEEN_ENDPOINT_RATE, "Unconfigured endpoint, using conservative rate");
                        GovernorConfig::default()
                    }
                };
                Arc::new(RateGovernor::new(endpoint, config))
            })
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
