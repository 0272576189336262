//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` (or the file named by `OFFERSCAN_CONFIG`) into
//! strongly-typed structs. Every section has defaults, so a minimal file
//! only needs what differs. Secrets (the service access token) are
//! referenced by env-var name and resolved at runtime.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::engine::{
    BreakerConfig, DispatcherConfig, GovernorConfig, GovernorRegistry, RetryPolicy, ScanConfig,
};
use crate::strategy::profit::ProfitConfig;
use crate::types::FulfillmentChannel;

/// Env var that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "OFFERSCAN_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Governor endpoint names used by the engine.
pub const OFFERS_ENDPOINT: &str = "competitive_offers";
pub const FEEDS_ENDPOINT: &str = "price_feeds";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub service: ServiceConfig,
    /// Per-endpoint rate limits, keyed by endpoint name.
    pub governors: HashMap<String, GovernorConfig>,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub scan: ScanConfig,
    pub pricing: PricingConfig,
    pub dispatcher: DispatcherConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// Our seller id on the marketplace; used to find our own offer.
    pub seller_id: String,
    pub currency: String,
    /// 0 disables scheduled runs.
    pub scan_interval_secs: u64,
    /// Resume a run left `running` by a previous process on startup.
    pub resume_on_startup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "OFFERSCAN-001".into(),
            seller_id: String::new(),
            currency: "GBP".into(),
            scan_interval_secs: 3600,
            resume_on_startup: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://offerscan.db".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub access_token_env: String,
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            access_token_env: "PRICING_ACCESS_TOKEN".into(),
            timeout_secs: 30,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PricingConfig {
    pub default_fee_rate: Decimal,
    pub opportunity_threshold_pct: Decimal,
    /// Landed-price ties go to the earliest channel listed.
    pub channel_preference: Vec<FulfillmentChannel>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_fee_rate: dec!(0.15),
            opportunity_threshold_pct: dec!(10),
            channel_preference: vec![FulfillmentChannel::Marketplace, FulfillmentChannel::Merchant],
        }
    }
}

impl PricingConfig {
    pub fn profit(&self) -> ProfitConfig {
        ProfitConfig {
            default_fee_rate: self.default_fee_rate,
            opportunity_threshold_pct: self.opportunity_threshold_pct,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `OFFERSCAN_CONFIG`, falling back to `config.toml`.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(&path)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scan.concurrency == 0 {
            anyhow::bail!("scan.concurrency must be at least 1");
        }
        if self.pricing.default_fee_rate < Decimal::ZERO || self.pricing.default_fee_rate >= Decimal::ONE {
            anyhow::bail!("pricing.default_fee_rate must be in [0, 1)");
        }
        if self.dispatcher.undercut < Decimal::ZERO {
            anyhow::bail!("dispatcher.undercut must not be negative");
        }
        Ok(())
    }

    /// One governor per configured endpoint; unlisted endpoints get the
    /// conservative default.
    pub fn governor_registry(&self) -> GovernorRegistry {
        GovernorRegistry::new(self.governors.clone())
    }

    /// Resolve an environment variable name to its value.
    /// Used for the secrets the config references by name.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
