//! Pricing service integrations.
//!
//! Defines the `PricingService` trait the engine drives and the
//! `CallError` taxonomy every implementation must map its failures onto.
//! - `http`: JSON-over-HTTP client for the competitive-pricing and feeds API
//! - `credentials`: access-token provider trait and expiry-aware cache

pub mod credentials;
pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{CompetitiveOffers, FeedStatus};

/// Failure of a single upstream call, classified for retry purposes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// 429. May carry the rate the service now allows.
    #[error("rate limited by upstream (hint: {rate_limit_hint:?} req/s)")]
    RateLimited { rate_limit_hint: Option<f64> },

    /// 5xx.
    #[error("upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Timeout, connection reset, DNS, and friends.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other 4xx.
    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    /// A 2xx we could not make sense of.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl CallError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited { .. } | CallError::Server { .. } | CallError::Transport(_)
        )
    }

    /// Map an HTTP status to its class. Only meaningful for non-2xx codes.
    pub fn from_status(status: u16, message: impl Into<String>, rate_limit_hint: Option<f64>) -> Self {
        let message = message.into();
        match status {
            429 => CallError::RateLimited { rate_limit_hint },
            500..=599 => CallError::Server { status, message },
            408 => CallError::Transport(format!("request timeout: {message}")),
            _ => CallError::Rejected { status, message },
        }
    }
}

/// Abstraction over the competitive-pricing and feeds API.
///
/// Implementations make exactly one network attempt per call; retries,
/// pacing and the circuit breaker live in the engine's executor.
#[async_trait]
pub trait PricingService: Send + Sync {
    /// All live offers on an item, plus an optional rate-limit hint.
    async fn get_competitive_offers(&self, item_id: &str) -> Result<CompetitiveOffers, CallError>;

    /// Queue a price change. Returns the service's feed id.
    async fn submit_price_feed(&self, item_id: &str, new_price: Decimal) -> Result<String, CallError>;

    /// Current processing status of a previously submitted feed.
    async fn get_feed_status(&self, feed_id: &str) -> Result<FeedStatus, CallError>;

    /// Name for logging and identification.
    fn name(&self) -> &str;
}
