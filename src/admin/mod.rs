//! Admin API: Axum web server for operating the engine.
//!
//! Start, stop and resume scan runs, inspect run progress and failures,
//! manage tracked items, and drive price feeds by hand.
//! CORS enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Bind the admin port and serve in a background task.
pub async fn spawn_admin(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin port {port}"))?;
    info!(port, "Admin API listening on http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Admin server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Runs
        .route("/api/runs", post(routes::start_run))
        .route("/api/runs/:id", get(routes::get_run))
        .route("/api/runs/:id/stop", post(routes::stop_run))
        .route("/api/runs/:id/resume", post(routes::resume_run))
        .route("/api/runs/:id/failures", get(routes::get_run_failures))
        .route("/api/stats", get(routes::get_stats))
        // Catalog
        .route("/api/items/:id", put(routes::put_item))
        .route("/api/items/:id/history", get(routes::get_item_history))
        .route("/api/items/:id/recheck", post(routes::recheck_item))
        .route("/api/items/:id/price-feeds", post(routes::submit_price))
        // Price feeds
        .route("/api/price-feeds/stuck", get(routes::get_stuck_feeds))
        .route("/api/price-feeds/:id", get(routes::poll_feed))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        BreakerConfig, CircuitBreaker, DispatcherConfig, GovernorConfig, PriceDispatcher,
        RateGovernor, ResilientExecutor, RetryPolicy, ScanConfig, ScanOrchestrator,
    };
    use crate::platforms::{CallError, PricingService};
    use crate::storage::{ScanStore, SqliteStore};
    use crate::strategy::PricingEvaluator;
    use crate::types::{CompetitiveOffers, FeedStatus, FulfillmentChannel, Offer, ScanRun, TriggerSource};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use routes::AdminState;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct OneRival;

    #[async_trait]
    impl PricingService for OneRival {
        async fn get_competitive_offers(&self, _: &str) -> std::result::Result<CompetitiveOffers, CallError> {
            Ok(CompetitiveOffers {
                offers: vec![Offer {
                    seller_id: "RIVAL".into(),
                    price: dec!(10.00),
                    shipping: Decimal::ZERO,
                    currency: "GBP".into(),
                    channel: FulfillmentChannel::Merchant,
                }],
                rate_limit_hint: None,
            })
        }

        async fn submit_price_feed(&self, _: &str, _: Decimal) -> std::result::Result<String, CallError> {
            Ok("EXT-9".into())
        }

        async fn get_feed_status(&self, _: &str) -> std::result::Result<FeedStatus, CallError> {
            Ok(FeedStatus::InProgress)
        }

        fn name(&self) -> &str {
            "one-rival"
        }
    }

    fn executor(name: &str) -> Arc<ResilientExecutor> {
        Arc::new(ResilientExecutor::new(
            name,
            RetryPolicy::default(),
            Arc::new(RateGovernor::new(name, GovernorConfig::new(1000.0, 50))),
            Arc::new(CircuitBreaker::new(name, BreakerConfig::default())),
        ))
    }

    async fn test_state() -> (AppState, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let service: Arc<dyn PricingService> = Arc::new(OneRival);
        let orchestrator = Arc::new(ScanOrchestrator::new(
            store.clone(),
            service.clone(),
            executor("offers"),
            PricingEvaluator::default(),
            ScanConfig::default(),
        ));
        let dispatcher = Arc::new(PriceDispatcher::new(
            store.clone(),
            service,
            executor("feeds"),
            DispatcherConfig {
                poll_interval: Duration::from_secs(3600),
                ..DispatcherConfig::default()
            },
        ));
        (Arc::new(AdminState::new(store.clone(), orchestrator, dispatcher, "EUR")), store)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn put_widget(app: &Router) {
        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/items/B01",
                Some(serde_json::json!({ "currency": "GBP", "base_cost": 4.0, "shipping_cost": 1.0 })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _) = test_state().await;
        let resp = build_router(state).oneshot(request("GET", "/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_put_item_validates() {
        let (state, _) = test_state().await;
        let resp = build_router(state)
            .oneshot(request(
                "PUT",
                "/api/items/B01",
                Some(serde_json::json!({ "currency": "GBP", "base_cost": -1.0 })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_item_rejects_overflowing_cost() {
        let (state, _) = test_state().await;
        let resp = build_router(state)
            .oneshot(request(
                "PUT",
                "/api/items/B01",
                // Each fits a Decimal, the sum does not.
                Some(serde_json::json!({ "base_cost": 5e28, "shipping_cost": 5e28 })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_item_currency_defaults() {
        let (state, store) = test_state().await;
        let app = build_router(state);

        let resp = app
            .clone()
            .oneshot(request("PUT", "/api/items/B02", Some(serde_json::json!({ "base_cost": 4.0 }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.tracked_item("B02").await.unwrap().unwrap().currency, "EUR");

        put_widget(&app).await;
        let resp = app
            .oneshot(request("PUT", "/api/items/B01", Some(serde_json::json!({ "base_cost": 5.0 }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let item = store.tracked_item("B01").await.unwrap().unwrap();
        assert_eq!(item.currency, "GBP");
        assert_eq!(item.cost.base_cost, dec!(5.0));
    }

    #[tokio::test]
    async fn test_recheck_and_history() {
        let (state, _) = test_state().await;
        let app = build_router(state);
        put_widget(&app).await;

        let resp = app.clone().oneshot(request("POST", "/api/items/B01/recheck", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result = json(resp).await;
        assert_eq!(result["is_opportunity"], true);
        assert!(result["run_id"].is_null());

        let resp = app.oneshot(request("GET", "/api/items/B01/history", None)).await.unwrap();
        assert_eq!(json(resp).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let (state, _) = test_state().await;
        let uri = format!("/api/runs/{}", uuid::Uuid::new_v4());
        let resp = build_router(state).oneshot(request("GET", &uri, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_run_conflicts_with_stalled_run() {
        let (state, store) = test_state().await;
        let stalled = ScanRun::start(TriggerSource::Scheduled, 0);
        store.create_run(&stalled, &[]).await.unwrap();

        let resp = build_router(state).oneshot(request("POST", "/api/runs", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_start_run_accepted() {
        let (state, _) = test_state().await;
        let app = build_router(state);
        put_widget(&app).await;

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/runs", Some(serde_json::json!({ "concurrency": 1 }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let run_id = json(resp).await["run_id"].as_str().unwrap().to_string();

        let resp = app.oneshot(request("GET", &format!("/api/runs/{run_id}"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["total"], 1);
    }

    #[tokio::test]
    async fn test_price_feed_submit_and_poll() {
        let (state, _) = test_state().await;
        let app = build_router(state);
        put_widget(&app).await;

        let resp = app
            .clone()
            .oneshot(request("POST", "/api/items/B01/price-feeds", Some(serde_json::json!({ "price": 9.99 }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let feed = json(resp).await;
        assert_eq!(feed["status"], "submitted");
        let feed_id = feed["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/api/price-feeds/{feed_id}"), None))
            .await
            .unwrap();
        assert_eq!(json(resp).await["status"], "in_progress");

        let resp = app.oneshot(request("GET", "/api/price-feeds/stuck", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(json(resp).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_rejects_bad_window() {
        let (state, _) = test_state().await;
        let resp = build_router(state)
            .oneshot(request("GET", "/api/stats?window_hours=0", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
