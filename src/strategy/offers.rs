//! Offer analysis.
//!
//! Turns the raw competitive offers for one item into the facts the engine
//! cares about: who holds the featured offer, at what landed price, where
//! our own offer ranks, and how far we are from winning.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::types::{FulfillmentChannel, Offer};

/// Offer data that cannot be priced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OfferError {
    #[error("landed price overflows for seller {0}")]
    Overflow(String),
}

/// Winner/rank/spread facts for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferSnapshot {
    pub offer_count: u32,
    /// Lowest landed price (price + shipping) among all offers.
    pub lowest_total: Option<Decimal>,
    pub winner_seller_id: Option<String>,
    pub winner_price: Option<Decimal>,
    pub currency: Option<String>,
    pub own_won: bool,
    pub own_price: Option<Decimal>,
    /// 1-based.
    pub own_rank: Option<u32>,
    /// Own landed price minus the winning landed price.
    pub spread: Option<Decimal>,
}

impl OfferSnapshot {
    /// Number of offers that are not ours.
    pub fn competitor_count(&self) -> u32 {
        if self.own_rank.is_some() {
            self.offer_count.saturating_sub(1)
        } else {
            self.offer_count
        }
    }
}

#[derive(Debug, Clone)]
pub struct OfferAnalyzer {
    own_seller_id: String,
    /// Earlier channels win landed-price ties.
    channel_preference: Vec<FulfillmentChannel>,
}

impl OfferAnalyzer {
    pub fn new(own_seller_id: impl Into<String>, channel_preference: Vec<FulfillmentChannel>) -> Self {
        Self {
            own_seller_id: own_seller_id.into(),
            channel_preference,
        }
    }

    pub fn own_seller_id(&self) -> &str {
        &self.own_seller_id
    }

    fn channel_rank(&self, channel: FulfillmentChannel) -> usize {
        self.channel_preference
            .iter()
            .position(|c| *c == channel)
            .unwrap_or(self.channel_preference.len())
    }

    /// Landed price of every offer, in input order.
    fn landed(offers: &[Offer]) -> Result<Vec<Decimal>, OfferError> {
        offers
            .iter()
            .map(|o| {
                o.landed_price()
                    .ok_or_else(|| OfferError::Overflow(o.seller_id.clone()))
            })
            .collect()
    }

    /// Rank offers: ascending landed price, then channel preference, then
    /// input order.
    pub fn rank<'a>(&self, offers: &'a [Offer]) -> Result<Vec<&'a Offer>, OfferError> {
        Ok(self
            .ranked(offers)?
            .into_iter()
            .map(|(o, _)| o)
            .collect())
    }

    fn ranked<'a>(&self, offers: &'a [Offer]) -> Result<Vec<(&'a Offer, Decimal)>, OfferError> {
        let landed = Self::landed(offers)?;
        let mut ranked: Vec<(usize, &Offer, Decimal)> = offers
            .iter()
            .zip(landed)
            .enumerate()
            .map(|(i, (o, l))| (i, o, l))
            .collect();
        ranked.sort_by(|(ia, a, la), (ib, b, lb)| {
            la.cmp(lb)
                .then_with(|| self.channel_rank(a.channel).cmp(&self.channel_rank(b.channel)))
                .then_with(|| ia.cmp(ib))
        });
        Ok(ranked.into_iter().map(|(_, o, l)| (o, l)).collect())
    }

    pub fn analyze(&self, offers: &[Offer]) -> Result<OfferSnapshot, OfferError> {
        let ranked = self.ranked(offers)?;
        let winner = ranked.first().copied();

        let own = ranked
            .iter()
            .enumerate()
            .find(|(_, (o, _))| o.seller_id == self.own_seller_id);

        let own_won = matches!(own, Some((0, _)));
        let own_price = own.map(|(_, (_, landed))| *landed);
        let own_rank = own.map(|(i, _)| i as u32 + 1);

        let spread = match (own, winner) {
            (Some((_, (o, ours))), Some((_, theirs))) => Some(
                ours.checked_sub(theirs)
                    .ok_or_else(|| OfferError::Overflow(o.seller_id.clone()))?,
            ),
            _ => None,
        };

        Ok(OfferSnapshot {
            offer_count: offers.len() as u32,
            // The ranking is ascending, so the winner holds the minimum.
            lowest_total: winner.map(|(_, landed)| landed),
            winner_seller_id: winner.map(|(w, _)| w.seller_id.clone()),
            winner_price: winner.map(|(_, landed)| landed),
            currency: winner.map(|(w, _)| w.currency.clone()),
            own_won,
            own_price,
            own_rank,
            spread,
        })
    }
}

impl Default for OfferAnalyzer {
    fn default() -> Self {
        Self::new(
            String::new(),
            vec![FulfillmentChannel::Marketplace, FulfillmentChannel::Merchant],
        )
    }
}
