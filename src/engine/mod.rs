//! Core engine: pacing, resilient calls, scan runs and price feeds.

pub mod breaker;
pub mod dispatcher;
pub mod executor;
pub mod governor;
pub mod scanner;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use dispatcher::{DispatcherConfig, PriceDispatcher};
pub use executor::{CallOutcome, ResilientExecutor, RetryPolicy};
pub use governor::{GovernorConfig, GovernorRegistry, RateGovernor};
pub use scanner::{RunHandle, RunOverrides, ScanConfig, ScanOrchestrator};
