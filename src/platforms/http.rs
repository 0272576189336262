//! JSON-over-HTTP pricing client.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  /items/{item_id}/offers` → `{ "offers": [...], "rate_limit": 0.5? }`
//! - `POST /feeds` with `{ "item_id", "price" }` → `{ "feed_id" }`
//! - `GET  /feeds/{feed_id}` → `{ "status": "IN_QUEUE" }`
//!
//! The advertised rate limit is read from the `x-amzn-ratelimit-limit`
//! response header, falling back to the body field. Each method makes one
//! attempt; failures are classified into `CallError`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::TokenCache;
use super::{CallError, PricingService};
use crate::error::{EngineError, Result};
use crate::types::{CompetitiveOffers, FeedStatus, FulfillmentChannel, Offer};

const CLIENT_NAME: &str = "http-pricing";
const RATE_LIMIT_HEADER: &str = "x-amzn-ratelimit-limit";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OffersResponse {
    #[serde(default)]
    offers: Vec<WireOffer>,
    #[serde(default)]
    rate_limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireOffer {
    seller_id: String,
    price: Decimal,
    #[serde(default)]
    shipping: Decimal,
    currency: String,
    #[serde(default)]
    fulfillment_channel: Option<String>,
}

#[derive(Debug, Serialize)]
struct FeedRequest<'a> {
    item_id: &'a str,
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct FeedSubmitResponse {
    feed_id: String,
}

#[derive(Debug, Deserialize)]
struct FeedStatusResponse {
    status: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpPricingClient {
    http: Client,
    base_url: String,
    credentials: Arc<TokenCache>,
}

impl HttpPricingClient {
    pub fn new(base_url: &str, credentials: Arc<TokenCache>, timeout: Duration) -> Result<Self> {
        if base_url.is_empty() {
            return Err(EngineError::Config("service.base_url must not be empty".into()));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Attach the bearer token and send. 401 drops the cached token so the
    /// executor's next attempt re-authenticates.
    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, CallError> {
        let token = self
            .credentials
            .bearer()
            .await
            .map_err(|e| CallError::Transport(format!("credentials unavailable: {e:#}")))?;

        let resp = request
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let hint = rate_limit_hint(&resp);
        let body = resp.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            warn!("Access token rejected, invalidating cache");
            self.credentials.invalidate().await;
            return Err(CallError::Transport(format!("unauthorized: {body}")));
        }

        Err(CallError::from_status(status.as_u16(), body, hint))
    }
}

fn classify_transport(err: reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::Transport(format!("timeout: {err}"))
    } else if err.is_decode() {
        CallError::Malformed(err.to_string())
    } else {
        CallError::Transport(err.to_string())
    }
}

fn rate_limit_hint(resp: &Response) -> Option<f64> {
    resp.headers()
        .get(RATE_LIMIT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

fn parse_channel(raw: Option<&str>) -> FulfillmentChannel {
    raw.and_then(|c| c.parse().ok()).unwrap_or(FulfillmentChannel::Merchant)
}

#[async_trait]
impl PricingService for HttpPricingClient {
    async fn get_competitive_offers(
        &self,
        item_id: &str,
    ) -> std::result::Result<CompetitiveOffers, CallError> {
        let url = format!("{}/items/{}/offers", self.base_url, urlencoding::encode(item_id));
        debug!(url = %url, "Fetching competitive offers");

        let resp = self.send(self.http.get(&url)).await?;
        let header_hint = rate_limit_hint(&resp);
        let body: OffersResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(format!("offers for {item_id}: {e}")))?;

        let offers = body
            .offers
            .into_iter()
            .map(|o| Offer {
                channel: parse_channel(o.fulfillment_channel.as_deref()),
                seller_id: o.seller_id,
                price: o.price,
                shipping: o.shipping,
                currency: o.currency,
            })
            .collect();

        Ok(CompetitiveOffers {
            offers,
            rate_limit_hint: header_hint.or(body.rate_limit),
        })
    }

    async fn submit_price_feed(
        &self,
        item_id: &str,
        new_price: Decimal,
    ) -> std::result::Result<String, CallError> {
        let url = format!("{}/feeds", self.base_url);
        let payload = FeedRequest {
            item_id,
            price: new_price,
        };

        let resp = self.send(self.http.post(&url).json(&payload)).await?;
        let body: FeedSubmitResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(format!("feed submission for {item_id}: {e}")))?;

        if body.feed_id.is_empty() {
            return Err(CallError::Malformed("empty feed id".into()));
        }
        Ok(body.feed_id)
    }

    async fn get_feed_status(&self, feed_id: &str) -> std::result::Result<FeedStatus, CallError> {
        let url = format!("{}/feeds/{}", self.base_url, urlencoding::encode(feed_id));

        let resp = self.send(self.http.get(&url)).await?;
        let body: FeedStatusResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Malformed(format!("feed status {feed_id}: {e}")))?;

        body.status
            .parse()
            .map_err(|e: String| CallError::Malformed(e))
    }

    fn name(&self) -> &str {
        CLIENT_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
