//! End-to-end tests: a real SQLite store (in memory) and the full engine
//! wired against a scripted pricing service.

mod dispatcher;
mod mock_service;
mod scan_run;

use std::sync::Arc;
use std::time::Duration;

use offerscan::engine::{
    BreakerConfig, CircuitBreaker, GovernorConfig, RateGovernor, ResilientExecutor, RetryPolicy,
};

/// An executor that paces loosely and retries quickly.
pub fn fast_executor(name: &str) -> Arc<ResilientExecutor> {
    Arc::new(ResilientExecutor::new(
        name,
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: Duration::ZERO,
        },
        Arc::new(RateGovernor::new(name, GovernorConfig::new(1000.0, 50))),
        Arc::new(CircuitBreaker::new(
            name,
            BreakerConfig {
                failure_threshold: 50,
                ..BreakerConfig::default()
            },
        )),
    ))
}
