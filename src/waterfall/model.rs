use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::WaterfallError;
use crate::types::{Money, Multiple};

/// Threshold below which an option strike is treated as "cheap" — it is
/// assumed to always exercise and is never subject to a dilution breakpoint.
pub const CHEAP_STRIKE_THRESHOLD: Decimal = dec!(0.01);

/// Round-half-up narrowing to `dp` decimal places. `Decimal::round_dp`
/// rounds half-to-even, so explicit narrowing goes through this instead.
pub fn round_half_up(d: Decimal, dp: u32) -> Decimal {
    use rust_decimal::RoundingStrategy;
    d.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareClassKind {
    Common,
    Preferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferenceType {
    NonParticipating,
    Participating,
    ParticipatingWithCap,
}

/// A single class of stock in the cap table: common, or a series of
/// preferred with its own preference terms and seniority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareClass {
    pub id: String,
    pub name: String,
    pub kind: ShareClassKind,
    pub shares_outstanding: u64,
    pub price_per_share: Money,
    pub conversion_ratio: Multiple,
    /// `None` for Common.
    pub preference_type: Option<PreferenceType>,
    /// 0 for Common; typically >= 1 for Preferred.
    pub lp_multiple: Multiple,
    /// `None` for Common. Lower is more senior; classes sharing a rank are pari passu.
    pub seniority_rank: Option<i64>,
    /// Required iff `preference_type == Some(ParticipatingWithCap)`.
    pub participation_cap: Option<Multiple>,
}

impl ShareClass {
    pub fn is_preferred(&self) -> bool {
        matches!(self.kind, ShareClassKind::Preferred)
    }

    pub fn shares_decimal(&self) -> Decimal {
        Decimal::from(self.shares_outstanding)
    }

    pub fn as_converted_shares(&self) -> Decimal {
        self.shares_decimal() * self.conversion_ratio
    }

    /// `shares × pricePerShare × lpMultiple`. Zero for Common.
    pub fn liquidation_preference(&self) -> Decimal {
        if !self.is_preferred() {
            return Decimal::ZERO;
        }
        self.shares_decimal() * self.price_per_share * self.lp_multiple
    }

    pub fn participation_cap_value(&self) -> Option<Decimal> {
        self.participation_cap.map(|cap| self.liquidation_preference() * cap)
    }
}

/// A pool of options, all vesting at the same strike price conceptually
/// distinct grants may still share a strike and are aggregated by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionGrant {
    pub id: String,
    pub num_options: u64,
    /// Defaults to `num_options` when unset by the caller.
    #[serde(default)]
    pub vested_count: Option<u64>,
    pub strike_price: Money,
}

impl OptionGrant {
    pub fn is_cheap(&self) -> bool {
        self.strike_price <= CHEAP_STRIKE_THRESHOLD
    }

    /// `vested_count` if the caller set one, else every granted option.
    pub fn effective_vested_count(&self) -> u64 {
        self.vested_count.unwrap_or(self.num_options)
    }

    pub fn vested_decimal(&self) -> Decimal {
        Decimal::from(self.effective_vested_count())
    }
}

/// Immutable snapshot of a company's capitalization: its share classes and
/// outstanding option grants. Everything derived from it (total liquidation
/// preference, as-converted share counts, strike schedules) is computed on
/// demand rather than cached on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapTable {
    pub share_classes: Vec<ShareClass>,
    pub option_grants: Vec<OptionGrant>,
}

impl CapTable {
    pub fn common_classes(&self) -> impl Iterator<Item = &ShareClass> {
        self.share_classes
            .iter()
            .filter(|c| matches!(c.kind, ShareClassKind::Common))
    }

    pub fn preferred_classes(&self) -> impl Iterator<Item = &ShareClass> {
        self.share_classes
            .iter()
            .filter(|c| matches!(c.kind, ShareClassKind::Preferred))
    }

    pub fn common_shares(&self) -> Decimal {
        self.common_classes().map(|c| c.shares_decimal()).sum()
    }

    /// Total liquidation preference across every preferred class.
    pub fn total_liquidation_preference(&self) -> Decimal {
        self.preferred_classes().map(|c| c.liquidation_preference()).sum()
    }

    /// `commonShares + Σ preferredShares × conversionRatio`, the base share
    /// count sequential option-exercise dilution is measured against.
    pub fn base_common_equivalent_shares(&self) -> Decimal {
        self.common_shares() + self.preferred_classes().map(|c| c.as_converted_shares()).sum::<Decimal>()
    }

    /// Distinct seniority ranks present among preferred classes, ascending.
    pub fn seniority_ranks(&self) -> Vec<i64> {
        let mut ranks: Vec<i64> = self
            .preferred_classes()
            .filter_map(|c| c.seniority_rank)
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }

    pub fn classes_at_rank(&self, rank: i64) -> Vec<&ShareClass> {
        self.preferred_classes()
            .filter(|c| c.seniority_rank == Some(rank))
            .collect()
    }

    pub fn cheap_option_vested_shares(&self) -> Decimal {
        self.option_grants
            .iter()
            .filter(|g| g.is_cheap())
            .map(|g| g.vested_decimal())
            .sum()
    }

    pub fn cheap_option_proceeds(&self) -> Decimal {
        self.option_grants
            .iter()
            .filter(|g| g.is_cheap())
            .map(|g| g.vested_decimal() * g.strike_price)
            .sum()
    }

    /// Unique strikes strictly above the cheap threshold, ascending, each
    /// with its aggregate vested option count across grants sharing that strike.
    pub fn priced_strikes(&self) -> Vec<(Decimal, Decimal)> {
        let mut by_strike: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for grant in self.option_grants.iter().filter(|g| !g.is_cheap()) {
            *by_strike.entry(grant.strike_price).or_insert(Decimal::ZERO) += grant.vested_decimal();
        }
        by_strike.into_iter().collect()
    }

    pub fn class_by_id(&self, id: &str) -> Option<&ShareClass> {
        self.share_classes.iter().find(|c| c.id == id)
    }
}

/// Validate a cap table per the five fatal structural checks. Gaps in
/// seniority ranks, duplicate names, and unusual-but-legal configurations
/// are accepted — only these five conditions abort analysis.
pub fn validate(cap_table: &CapTable) -> Result<(), WaterfallError> {
    for class in cap_table.preferred_classes() {
        if class.price_per_share.is_sign_negative() || class.lp_multiple.is_sign_negative() {
            return Err(WaterfallError::NegativeLiquidationPreference {
                class_name: class.name.clone(),
            });
        }
        let rank = class.seniority_rank.unwrap_or(0);
        if rank < 0 {
            return Err(WaterfallError::NegativeSeniority {
                class_name: class.name.clone(),
                seniority_rank: rank,
            });
        }
        if class.preference_type == Some(PreferenceType::ParticipatingWithCap) {
            match class.participation_cap {
                Some(cap) if cap >= Decimal::ONE => {}
                _ => {
                    return Err(WaterfallError::MissingParticipationCap {
                        class_name: class.name.clone(),
                    })
                }
            }
        }
    }

    for grant in &cap_table.option_grants {
        if grant.strike_price.is_sign_negative() {
            return Err(WaterfallError::NegativeStrike {
                grant_id: grant.id.clone(),
                strike: grant.strike_price,
            });
        }
        if grant.num_options == 0 {
            return Err(WaterfallError::NonPositiveOptionCount {
                grant_id: grant.id.clone(),
                num_options: 0,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn common(shares: u64) -> ShareClass {
        ShareClass {
            id: "common".into(),
            name: "Common".into(),
            kind: ShareClassKind::Common,
            shares_outstanding: shares,
            price_per_share: Decimal::ZERO,
            conversion_ratio: Decimal::ONE,
            preference_type: None,
            lp_multiple: Decimal::ZERO,
            seniority_rank: None,
            participation_cap: None,
        }
    }

    fn series_a(shares: u64) -> ShareClass {
        ShareClass {
            id: "series_a".into(),
            name: "Series A".into(),
            kind: ShareClassKind::Preferred,
            shares_outstanding: shares,
            price_per_share: dec!(1.00),
            conversion_ratio: Decimal::ONE,
            preference_type: Some(PreferenceType::NonParticipating),
            lp_multiple: Decimal::ONE,
            seniority_rank: Some(0),
            participation_cap: None,
        }
    }

    #[test]
    fn total_lp_sums_preferred_only() {
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a(1_000_000)],
            option_grants: vec![],
        };
        assert_eq!(cap_table.total_liquidation_preference(), dec!(1_000_000));
    }

    #[test]
    fn negative_price_is_rejected() {
        let mut a = series_a(1_000_000);
        a.price_per_share = dec!(-1);
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), a],
            option_grants: vec![],
        };
        assert!(matches!(
            validate(&cap_table),
            Err(WaterfallError::NegativeLiquidationPreference { .. })
        ));
    }

    #[test]
    fn missing_cap_on_capped_participating_is_rejected() {
        let mut a = series_a(1_000_000);
        a.preference_type = Some(PreferenceType::ParticipatingWithCap);
        a.participation_cap = None;
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), a],
            option_grants: vec![],
        };
        assert!(matches!(
            validate(&cap_table),
            Err(WaterfallError::MissingParticipationCap { .. })
        ));
    }

    #[test]
    fn zero_option_count_is_rejected() {
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000)],
            option_grants: vec![OptionGrant {
                id: "g1".into(),
                num_options: 0,
                vested_count: Some(0),
                strike_price: dec!(1.0),
            }],
        };
        assert!(matches!(
            validate(&cap_table),
            Err(WaterfallError::NonPositiveOptionCount { .. })
        ));
    }

    #[test]
    fn unset_vested_count_defaults_to_num_options() {
        let grant = OptionGrant {
            id: "g1".into(),
            num_options: 250_000,
            vested_count: None,
            strike_price: dec!(1.0),
        };
        assert_eq!(grant.effective_vested_count(), 250_000);
        assert_eq!(grant.vested_decimal(), dec!(250_000));
    }

    #[test]
    fn priced_strikes_aggregate_across_grants() {
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000)],
            option_grants: vec![
                OptionGrant { id: "g1".into(), num_options: 100_000, vested_count: Some(100_000), strike_price: dec!(2.00) },
                OptionGrant { id: "g2".into(), num_options: 50_000, vested_count: Some(50_000), strike_price: dec!(2.00) },
                OptionGrant { id: "g3".into(), num_options: 10_000, vested_count: Some(10_000), strike_price: dec!(0.001) },
            ],
        };
        let strikes = cap_table.priced_strikes();
        assert_eq!(strikes, vec![(dec!(2.00), dec!(150_000))]);
        assert_eq!(cap_table.cheap_option_vested_shares(), dec!(10_000));
    }
}
