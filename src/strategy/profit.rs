//! Profitability calculation.
//!
//! Given a reference price and an item's cost model:
//!
//! ```text
//! fees               = price * fee_rate
//! margin             = price - fees - total_cost
//! roi_margin_percent = margin / (total_cost + fees) * 100
//! min_profitable     = total_cost / (1 - fee_rate)
//! ```
//!
//! All arithmetic is exact decimal, so `margin + fees + total_cost == price`
//! holds to the penny. A missing or zero price yields no fees, margin or
//! percentage rather than a division by zero, and so does any step that
//! would overflow.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::CostModel;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfitConfig {
    /// Fee rate when neither the caller nor the cost model supplies one.
    pub default_fee_rate: Decimal,
    /// Minimum ROI-margin percentage for an opportunity.
    pub opportunity_threshold_pct: Decimal,
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            default_fee_rate: dec!(0.15),
            opportunity_threshold_pct: dec!(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profitability {
    pub price: Option<Decimal>,
    pub fee_rate: Decimal,
    /// `None` if base plus shipping overflows.
    pub total_cost: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub margin: Option<Decimal>,
    pub roi_margin_percent: Option<Decimal>,
    pub is_opportunity: bool,
    /// Price at which margin is exactly zero. `None` when fees eat everything.
    pub min_profitable_price: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProfitCalculator {
    config: ProfitConfig,
}

impl ProfitCalculator {
    pub fn new(config: ProfitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProfitConfig {
        &self.config
    }

    /// Override, then the cost model's own rate, then the default.
    pub fn effective_fee_rate(&self, cost: &CostModel, fee_override: Option<Decimal>) -> Decimal {
        fee_override
            .or(cost.fee_rate)
            .unwrap_or(self.config.default_fee_rate)
    }

    pub fn min_profitable_price(&self, cost: &CostModel, fee_rate: Decimal) -> Option<Decimal> {
        let keep = Decimal::ONE - fee_rate;
        if keep <= Decimal::ZERO {
            return None;
        }
        cost.total_cost()?.checked_div(keep)
    }

    /// Fees, margin and capital deployed at `price`.
    fn split(price: Decimal, fee_rate: Decimal, total_cost: Decimal) -> Option<(Decimal, Decimal, Decimal)> {
        let fees = price.checked_mul(fee_rate)?;
        let margin = price.checked_sub(fees)?.checked_sub(total_cost)?;
        let deployed = total_cost.checked_add(fees)?;
        Some((fees, margin, deployed))
    }

    pub fn calculate(
        &self,
        price: Option<Decimal>,
        cost: &CostModel,
        fee_override: Option<Decimal>,
    ) -> Profitability {
        let fee_rate = self.effective_fee_rate(cost, fee_override);
        let total_cost = cost.total_cost();
        let min_profitable_price = self.min_profitable_price(cost, fee_rate);

        let nothing = Profitability {
            price,
            fee_rate,
            total_cost,
            fees: None,
            margin: None,
            roi_margin_percent: None,
            is_opportunity: false,
            min_profitable_price,
        };
        let (Some(price), Some(cost_total)) = (price.filter(|p| !p.is_zero()), total_cost) else {
            return nothing;
        };
        let Some((fees, margin, deployed)) = Self::split(price, fee_rate, cost_total) else {
            warn!(%price, %fee_rate, "Profitability overflows; reporting no margin");
            return nothing;
        };

        let roi_margin_percent = if deployed.is_zero() {
            None
        } else {
            margin
                .checked_div(deployed)
                .and_then(|r| r.checked_mul(dec!(100)))
        };

        let above_floor = cost.price_floor.map_or(true, |floor| price >= floor);
        let is_opportunity = margin > Decimal::ZERO
            && roi_margin_percent.is_some_and(|pct| pct >= self.config.opportunity_threshold_pct)
            && above_floor;

        Profitability {
            price: Some(price),
            fee_rate,
            total_cost,
            fees: Some(fees),
            margin: Some(margin),
            roi_margin_percent,
            is_opportunity,
            min_profitable_price,
        }
    }
}
