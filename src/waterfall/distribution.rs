//! Proceeds distribution: given a cap table and a concrete exit value,
//! pays liquidation preferences ahead of the residual pool, splits the
//! residual pro rata among common, participating preferred, converted
//! non-participating preferred, and exercised options, then clamps any
//! participating-with-cap class at its cap and redistributes the excess.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::analyzer::{self, BreakpointAnalysisResult};
use super::audit::{AnalysisContext, AuditEntry, PerformanceMetrics};
use super::model::{self, CapTable, PreferenceType};
use super::pool::{self, ConversionDecisions};
use crate::error::WaterfallError;

/// Tolerance on `|sum(payouts) - exitValue|` below which a distribution is
/// considered to conserve proceeds: `max(1e-8, 1e-10 * exitValue)`, scaling
/// with the size of the exit so a fixed-dollar floor doesn't swamp small
/// exits or a fixed-fraction floor doesn't trip on ordinary division
/// rounding at large ones.
fn conservation_tolerance(exit_value: Decimal) -> Decimal {
    dec!(0.00000001).max(dec!(0.0000000001) * exit_value)
}

pub type Distribution = BTreeMap<String, Decimal>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionResult {
    pub payouts: Distribution,
    pub conservation_delta: Decimal,
    pub audit_trail: Vec<AuditEntry>,
    pub metrics: PerformanceMetrics,
    pub verification_hash: String,
}

/// Distribute `exit_value` across a cap table. Re-runs breakpoint analysis
/// internally so the conversion and option-exercise schedules it uses are
/// always consistent with the cap table being distributed.
pub fn distribute(cap_table: &CapTable, exit_value: Decimal) -> Result<DistributionResult, WaterfallError> {
    model::validate(cap_table)?;
    let analysis = analyzer::analyze(cap_table)?;
    let mut ctx = AnalysisContext::new();

    let decisions = decisions_at(&analysis, exit_value);
    let mut payouts: Distribution = Distribution::new();
    for class in &cap_table.share_classes {
        payouts.insert(class.id.clone(), Decimal::ZERO);
    }
    for grant in &cap_table.option_grants {
        payouts.insert(grant.id.clone(), Decimal::ZERO);
    }

    // Step 1: pay liquidation preferences ascending seniority, pari passu
    // within a rank, capped at whatever proceeds remain. A participating-
    // with-cap class that has elected full post-cap conversion forfeits its
    // preference entirely — it takes nothing here and is pure common in the
    // residual pool below. A non-participating class that has elected to
    // convert still keeps the preference it was paid here; conversion only
    // adds a residual share on top of it.
    let mut remaining = exit_value;
    let mut lp_paid: BTreeMap<String, Decimal> = BTreeMap::new();
    for rank in cap_table.seniority_ranks() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let classes: Vec<&model::ShareClass> = cap_table
            .classes_at_rank(rank)
            .into_iter()
            .filter(|c| !(c.preference_type == Some(PreferenceType::ParticipatingWithCap) && pool::has_converted(&decisions, &c.id)))
            .collect();
        let rank_lp_total: Decimal = classes.iter().map(|c| c.liquidation_preference()).sum();
        if rank_lp_total.is_zero() {
            continue;
        }
        let pay = rank_lp_total.min(remaining);
        for class in classes {
            let share = class.liquidation_preference() / rank_lp_total * pay;
            *payouts.get_mut(&class.id).unwrap() += share;
            *lp_paid.entry(class.id.clone()).or_insert(Decimal::ZERO) += share;
        }
        remaining -= pay;
        ctx.log("liquidation_preference", format!("rank {rank}: paid {pay}, {remaining} remaining"));
    }
    let residual_base = remaining;

    // Step 2: build the residual participating pool — common, participating
    // (capped or not) preferred at ratio, converted non-participating
    // preferred, and exercised options (cheap + in the money by this exit
    // value).
    let (option_shares, option_proceeds) =
        pool::exercised_option_pool(cap_table, &option_schedule_triples(&analysis), exit_value);
    let residual_cash = residual_base + option_proceeds;
    ctx.log("pro_rata_distribution", format!("residual pool cash {residual_cash} at exit {exit_value}"));

    // Step 3/4: split the residual, iterating to clamp participating-with-cap
    // classes that breach their cap and redistribute the excess among the
    // remaining uncapped participants.
    let capped_eligible: Vec<&model::ShareClass> = cap_table
        .preferred_classes()
        .filter(|c| c.preference_type == Some(PreferenceType::ParticipatingWithCap))
        .filter(|c| !pool::has_converted(&decisions, &c.id))
        .collect();
    let max_iterations = capped_eligible.len() as u32 + 1;

    let mut capped: HashSet<String> = HashSet::new();
    let mut final_per_share = Decimal::ZERO;
    for i in 0..max_iterations.max(1) {
        let active_shares = participating_shares_excluding(cap_table, &decisions, &capped) + option_shares;
        let consumed_by_capped: Decimal = capped
            .iter()
            .filter_map(|id| cap_table.class_by_id(id))
            .map(|c| c.participation_cap_value().unwrap_or(Decimal::ZERO) - lp_paid.get(&c.id).copied().unwrap_or(Decimal::ZERO))
            .sum();
        let active_cash = (residual_cash - consumed_by_capped).max(Decimal::ZERO);
        let per_share = if active_shares.is_zero() { Decimal::ZERO } else { active_cash / active_shares };
        final_per_share = per_share;

        let mut breached = false;
        for class in &capped_eligible {
            if capped.contains(&class.id) {
                continue;
            }
            let total = lp_paid.get(&class.id).copied().unwrap_or(Decimal::ZERO) + per_share * class.as_converted_shares();
            if let Some(cap_value) = class.participation_cap_value() {
                if total > cap_value {
                    capped.insert(class.id.clone());
                    breached = true;
                    ctx.log("participation_cap", format!("{} breaches its cap at iteration {i}, clamped", class.name));
                }
            }
        }
        if !breached {
            break;
        }
    }

    for class in cap_table.preferred_classes() {
        let already = lp_paid.get(&class.id).copied().unwrap_or(Decimal::ZERO);
        let in_pool = match class.preference_type {
            Some(PreferenceType::Participating) => true,
            Some(PreferenceType::ParticipatingWithCap) => true,
            Some(PreferenceType::NonParticipating) => pool::has_converted(&decisions, &class.id),
            None => false,
        };
        if !in_pool {
            continue;
        }
        let payout = if capped.contains(&class.id) {
            class.participation_cap_value().unwrap_or(already)
        } else {
            already + final_per_share * class.as_converted_shares()
        };
        *payouts.get_mut(&class.id).unwrap() = payout;
    }

    for class in cap_table.common_classes() {
        *payouts.get_mut(&class.id).unwrap() = final_per_share * class.shares_decimal();
    }

    // Options receive their gross pro-rata share net of their own exercise
    // cost, so conservation holds against the raw exit value.
    for grant in &cap_table.option_grants {
        let gross = if grant.is_cheap() || is_exercised(&analysis, grant.strike_price, exit_value) {
            final_per_share * grant.vested_decimal()
        } else {
            Decimal::ZERO
        };
        let cost = if grant.is_cheap() || is_exercised(&analysis, grant.strike_price, exit_value) {
            grant.vested_decimal() * grant.strike_price
        } else {
            Decimal::ZERO
        };
        *payouts.get_mut(&grant.id).unwrap() = gross - cost;
    }

    let total_paid: Decimal = payouts.values().sum();
    let conservation_delta = (total_paid - exit_value).abs();
    if conservation_delta > conservation_tolerance(exit_value) {
        return Err(WaterfallError::DistributionNonConservation { delta: conservation_delta });
    }

    let outputs_canonical = super::audit::canonicalize_decimal_map("payouts", &payouts);
    let verification_hash = super::audit::verification_hash(cap_table, Some(exit_value), &outputs_canonical);
    let audit_trail = std::mem::take(&mut ctx.audit_trail);
    let metrics = ctx.finish();

    Ok(DistributionResult {
        payouts,
        conservation_delta,
        audit_trail,
        metrics,
        verification_hash,
    })
}

/// Concrete conversion decisions at a given exit value, derived from the
/// analysis's conversion schedule: a class has converted once the exit
/// value strictly exceeds its own threshold.
fn decisions_at(analysis: &BreakpointAnalysisResult, exit_value: Decimal) -> ConversionDecisions {
    analysis
        .conversion_schedule
        .iter()
        .map(|(id, threshold)| (id.clone(), exit_value > *threshold))
        .collect()
}

fn option_schedule_triples(analysis: &BreakpointAnalysisResult) -> Vec<(Decimal, Decimal, Decimal)> {
    analysis
        .option_exercise_schedule
        .iter()
        .map(|e| (e.strike, e.aggregate_vested, e.exit_value))
        .collect()
}

fn is_exercised(analysis: &BreakpointAnalysisResult, strike: Decimal, exit_value: Decimal) -> bool {
    analysis
        .option_exercise_schedule
        .iter()
        .find(|e| e.strike == strike)
        .map(|e| e.exit_value <= exit_value)
        .unwrap_or(false)
}

/// `participating_pool_shares` with a set of classes excluded entirely —
/// used while iterating the participation-cap clamp, where a newly capped
/// class drops out of the pool its excess residual is redistributed over.
fn participating_shares_excluding(cap_table: &CapTable, decisions: &ConversionDecisions, excluded: &HashSet<String>) -> Decimal {
    let preferred: Decimal = cap_table
        .preferred_classes()
        .filter(|c| !excluded.contains(&c.id))
        .filter(|c| match c.preference_type {
            Some(PreferenceType::Participating) | Some(PreferenceType::ParticipatingWithCap) => true,
            Some(PreferenceType::NonParticipating) => pool::has_converted(decisions, &c.id),
            None => false,
        })
        .map(|c| c.as_converted_shares())
        .sum();
    cap_table.common_shares() + preferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waterfall::model::{ShareClass, ShareClassKind};
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
    fn retains_lp_below_conversion_threshold() {
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a(1_000_000)],
            option_grants: vec![],
        };
        let result = distribute(&cap_table, dec!(2_000_000)).unwrap();
        assert_eq!(result.payouts["common"], dec!(1_000_000));
        assert_eq!(result.payouts["series_a"], dec!(1_000_000));
    }

    #[test]
    fn converts_and_keeps_lp_above_threshold() {
        // At $4,000,000, Series A has passed its conversion threshold and
        // joins the residual pool on top of the liquidation preference it
        // was already paid: 1,000,000 (LP) + 1,500,000 (half of the
        // 3,000,000 residual) = 2,500,000. Common takes the other half.
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a(1_000_000)],
            option_grants: vec![],
        };
        let result = distribute(&cap_table, dec!(4_000_000)).unwrap();
        assert_eq!(result.payouts["common"], dec!(1_500_000));
        assert_eq!(result.payouts["series_a"], dec!(2_500_000));
        assert!(result.conservation_delta <= conservation_tolerance(dec!(4_000_000)));
    }

    fn series_a_participating_with_cap(shares: u64, cap: Decimal) -> ShareClass {
        ShareClass {
            id: "series_a".into(),
            name: "Series A".into(),
            kind: ShareClassKind::Preferred,
            shares_outstanding: shares,
            price_per_share: dec!(1.00),
            conversion_ratio: Decimal::ONE,
            preference_type: Some(PreferenceType::ParticipatingWithCap),
            lp_multiple: Decimal::ONE,
            seniority_rank: Some(0),
            participation_cap: Some(cap),
        }
    }

    #[test]
    fn participating_with_cap_clamps_at_cap_before_conversion() {
        // At $5,500,000 Series A has reached its $3,000,000 cap (past the
        // $5,000,000 cap-reach point) but hasn't crossed the $6,000,000
        // post-cap conversion threshold: it keeps its $1,000,000 LP plus a
        // pro-rata share, clamped to the $3,000,000 cap. Common takes the rest.
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a_participating_with_cap(1_000_000, dec!(3))],
            option_grants: vec![],
        };
        let result = distribute(&cap_table, dec!(5_500_000)).unwrap();
        assert_eq!(result.payouts["series_a"], dec!(3_000_000));
        assert_eq!(result.payouts["common"], dec!(2_500_000));
    }

    #[test]
    fn participating_with_cap_forfeits_lp_once_converted() {
        // Past its $6,000,000 post-cap conversion threshold, Series A
        // forfeits its liquidation preference entirely and takes a pure
        // pro-rata share of the full residual: 0.5 x 8,000,000 = 4,000,000,
        // not the 4,500,000 an LP-plus-residual-share formula would give.
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a_participating_with_cap(1_000_000, dec!(3))],
            option_grants: vec![],
        };
        let result = distribute(&cap_table, dec!(8_000_000)).unwrap();
        assert_eq!(result.payouts["series_a"], dec!(4_000_000));
        assert_eq!(result.payouts["common"], dec!(4_000_000));
        assert!(result.conservation_delta <= conservation_tolerance(dec!(8_000_000)));
    }

    #[test]
    fn conserves_proceeds_at_low_exit_value() {
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a(1_000_000)],
            option_grants: vec![],
        };
        let result = distribute(&cap_table, dec!(500_000)).unwrap();
        let total: Decimal = result.payouts.values().sum();
        assert_eq!(total, dec!(500_000));
        assert_eq!(result.payouts["common"], Decimal::ZERO);
        assert_eq!(result.payouts["series_a"], dec!(500_000));
    }
}
