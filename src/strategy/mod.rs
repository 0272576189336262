//! Pricing decisions: offer analysis and profitability.

pub mod offers;
pub mod profit;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::types::{CompetitiveOffers, ScanItemResult, TrackedItem};
use offers::{OfferAnalyzer, OfferError, OfferSnapshot};
use profit::{ProfitCalculator, Profitability};

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Pipelines offer analysis → profitability for one item.
///
/// The reference price for profitability is the winning landed price: what
/// we would have to match to take the featured offer.
#[derive(Debug, Clone, Default)]
pub struct PricingEvaluator {
    analyzer: OfferAnalyzer,
    calculator: ProfitCalculator,
}

/// Everything learned about one item from one offers fetch.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub snapshot: OfferSnapshot,
    pub profitability: Profitability,
}

impl PricingEvaluator {
    pub fn new(analyzer: OfferAnalyzer, calculator: ProfitCalculator) -> Self {
        Self {
            analyzer,
            calculator,
        }
    }

    pub fn analyzer(&self) -> &OfferAnalyzer {
        &self.analyzer
    }

    pub fn calculator(&self) -> &ProfitCalculator {
        &self.calculator
    }

    pub fn evaluate(&self, item: &TrackedItem, offers: &CompetitiveOffers) -> Result<Evaluation, OfferError> {
        let snapshot = self.analyzer.analyze(&offers.offers)?;
        let profitability = self
            .calculator
            .calculate(snapshot.winner_price, &item.cost, None);

        debug!(
            item_id = %item.item_id,
            offers = snapshot.offer_count,
            winner = ?snapshot.winner_seller_id,
            own_won = snapshot.own_won,
            margin = ?profitability.margin,
            opportunity = profitability.is_opportunity,
            "Item evaluated"
        );

        Ok(Evaluation {
            snapshot,
            profitability,
        })
    }

    /// Evaluate and shape into the persisted record.
    pub fn to_result(
        &self,
        run_id: Option<Uuid>,
        item: &TrackedItem,
        offers: &CompetitiveOffers,
    ) -> Result<ScanItemResult, OfferError> {
        let Evaluation {
            snapshot,
            profitability,
        } = self.evaluate(item, offers)?;

        Ok(ScanItemResult {
            id: Uuid::new_v4(),
            run_id,
            item_id: item.item_id.clone(),
            observed_price: snapshot.winner_price,
            currency: snapshot.currency.clone().or_else(|| Some(item.currency.clone())),
            is_winner: snapshot.own_won,
            competitor_count: snapshot.competitor_count(),
            winner_seller_id: snapshot.winner_seller_id,
            winner_price: snapshot.winner_price,
            own_price: snapshot.own_price,
            own_rank: snapshot.own_rank,
            margin: profitability.margin,
            roi_margin_percent: profitability.roi_margin_percent,
            is_opportunity: profitability.is_opportunity,
            min_profitable_price: profitability.min_profitable_price,
            captured_at: Utc::now(),
        })
    }
}

/// Undercut target for an observed price, or `None` if it would be
/// unprofitable or below the item's floor.
pub fn undercut_target(
    observed: Decimal,
    undercut: Decimal,
    min_profitable: Option<Decimal>,
    floor: Option<Decimal>,
) -> Option<Decimal> {
    let target = observed.checked_sub(undercut)?.round_dp(2);
    if target <= Decimal::ZERO {
        return None;
    }
    if min_profitable.is_some_and(|min| target < min) {
        return None;
    }
    if floor.is_some_and(|f| target < f) {
        return None;
    }
    Some(target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CostModel, FulfillmentChannel, Offer};
    use rust_decimal_macros::dec;

    fn item() -> TrackedItem {
        TrackedItem::new("B0001", "GBP", CostModel::new(dec!(4.00), dec!(1.00)))
    }

    fn offer(seller: &str, price: Decimal) -> Offer {
        Offer {
            seller_id: seller.to_string(),
            price,
            shipping: Decimal::ZERO,
            currency: "GBP".to_string(),
            channel: FulfillmentChannel::Merchant,
        }
    }

    fn evaluator() -> PricingEvaluator {
        PricingEvaluator::new(
            OfferAnalyzer::new("ME", vec![FulfillmentChannel::Marketplace]),
            ProfitCalculator::default(),
        )
    }

    #[test]
    fn test_result_uses_winning_price() {
        let offers = CompetitiveOffers {
            offers: vec![offer("A", dec!(10.00)), offer("ME", dec!(11.00))],
            rate_limit_hint: None,
        };
        let result = evaluator().to_result(None, &item(), &offers).unwrap();
        assert_eq!(result.observed_price, Some(dec!(10.00)));
        assert_eq!(result.margin, Some(dec!(3.50)));
        assert!(result.is_opportunity);
        assert!(!result.is_winner);
        assert_eq!(result.own_rank, Some(2));
        assert_eq!(result.competitor_count, 1);
        assert!(result.run_id.is_none());
    }

    #[test]
    fn test_no_offers_gives_null_margin() {
        let result = evaluator()
            .to_result(Some(Uuid::new_v4()), &item(), &CompetitiveOffers::default())
            .unwrap();
        assert!(result.observed_price.is_none());
        assert!(result.margin.is_none());
        assert!(result.roi_margin_percent.is_none());
        assert!(!result.is_opportunity);
        assert_eq!(result.currency.as_deref(), Some("GBP"));
    }

    #[test]
    fn test_undercut_target() {
        assert_eq!(undercut_target(dec!(10.00), dec!(0.01), Some(dec!(5.88)), None), Some(dec!(9.99)));
        assert_eq!(undercut_target(dec!(6.00), dec!(0.50), Some(dec!(5.88)), None), None);
        assert_eq!(undercut_target(dec!(10.00), dec!(0.01), None, Some(dec!(10.00))), None);
        assert_eq!(undercut_target(dec!(0.01), dec!(0.01), None, None), None);
        assert_eq!(undercut_target(Decimal::MIN, dec!(1), None, None), None);
    }

    #[test]
    fn test_overflowing_offer_is_not_evaluated() {
        let offers = CompetitiveOffers {
            offers: vec![Offer {
                shipping: dec!(1),
                ..offer("A", Decimal::MAX)
            }],
            rate_limit_hint: None,
        };
        assert!(evaluator().to_result(None, &item(), &offers).is_err());
    }
}
