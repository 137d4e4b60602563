//! Iterative numeric routines the analyzer leans on: a damped
//! successive-substitution loop for sequential option-exercise
//! breakpoints, and bisection for voluntary-conversion breakpoints.
//! Both are tolerant — non-convergence is recorded as a warning and the
//! corresponding breakpoint is simply omitted, never fabricated.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use super::audit::AnalysisContext;
use super::model::{CapTable, ShareClass};
use super::pool::{self, ConversionDecisions};

const OPTION_EXERCISE_EPSILON: Decimal = dec!(0.001);
const CONVERSION_TOLERANCE: Decimal = dec!(0.01);
const MAX_SOLVER_ITERATIONS: u32 = 100;

/// Memoizes `convert_value_total`/`retain_value_total` within a single
/// class's bisection, keyed by a plain hashable tuple rather than a
/// JSON-stringified cache key: `(exit value, class id, is-convert-branch,
/// senior classes already decided to have converted)`. Owned locally by
/// each `solve_*` call, never shared across analyses.
type RvpsCache = HashMap<(Decimal, String, bool, Vec<String>), Decimal>;

fn converted_senior_ids(decisions: &ConversionDecisions) -> Vec<String> {
    let mut ids: Vec<String> = decisions.iter().filter(|(_, converted)| **converted).map(|(id, _)| id.clone()).collect();
    ids.sort();
    ids
}

/// One strike price's dilution event: the aggregate vested count at that
/// strike, and the exit value at which it becomes in the money.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionExerciseEvent {
    pub strike: Decimal,
    pub aggregate_vested: Decimal,
    pub exit_value: Decimal,
}

/// Sequential-dilution model: strikes are crossed ascending, each assuming
/// every lower strike has already exercised. Returns one event per strike
/// that converged; non-convergent strikes are dropped with an audit warning.
pub fn solve_sequential_option_exercise(cap_table: &CapTable, ctx: &mut AnalysisContext) -> Vec<OptionExerciseEvent> {
    let total_lp = cap_table.total_liquidation_preference();
    let base_shares = cap_table.base_common_equivalent_shares();

    let mut prior_exercised = Decimal::ZERO;
    let mut prior_proceeds = Decimal::ZERO;
    let mut events = Vec::new();

    for (strike, n) in cap_table.priced_strikes() {
        let denom = base_shares + prior_exercised + n;
        if denom.is_zero() {
            ctx.log(
                "option_exercise",
                format!("strike {strike}: zero share base, skipping"),
            );
            continue;
        }

        let lower = strike * (Decimal::ONE - OPTION_EXERCISE_EPSILON);
        let upper = strike * (Decimal::ONE + OPTION_EXERCISE_EPSILON);

        let mut x = (strike * (Decimal::ONE + OPTION_EXERCISE_EPSILON / dec!(2)) * denom) + total_lp
            - prior_proceeds
            - n * strike;
        if x.is_sign_negative() {
            x = Decimal::ZERO;
        }

        let mut converged = false;
        let mut iterations_used = 0u32;

        for i in 0..MAX_SOLVER_ITERATIONS {
            iterations_used = i + 1;
            let per_share = (x + prior_proceeds + n * strike - total_lp) / denom;

            if per_share > upper {
                x = (strike * (Decimal::ONE + OPTION_EXERCISE_EPSILON / dec!(2)) * denom) + total_lp
                    - prior_proceeds
                    - n * strike;
                if x.is_sign_negative() {
                    x = Decimal::ZERO;
                }
            } else if per_share < lower {
                x *= dec!(1.05);
            } else {
                converged = true;
                break;
            }
        }

        ctx.record_iterations(format!("option_exercise:{strike}"), iterations_used);

        if converged {
            events.push(OptionExerciseEvent {
                strike,
                aggregate_vested: n,
                exit_value: x,
            });
            prior_exercised += n;
            prior_proceeds += n * strike;
        } else {
            ctx.log(
                "option_exercise",
                format!("strike {strike} did not converge after {iterations_used} iterations; breakpoint omitted"),
            );
        }
    }

    events
}

/// Dollar value a preferred class receives if it elects to convert to
/// common at exit value `x`, given the conversion decisions made so far.
fn convert_value_total(
    cap_table: &CapTable,
    class: &ShareClass,
    decisions: &ConversionDecisions,
    x: Decimal,
    cache: &mut RvpsCache,
    ctx: &mut AnalysisContext,
) -> Decimal {
    let key = (x, class.id.clone(), true, converted_senior_ids(decisions));
    if let Some(v) = cache.get(&key) {
        ctx.record_cache_hit();
        return *v;
    }
    ctx.record_cache_miss();
    let senior_lp = pool::senior_retained_lp(cap_table, class, decisions);
    let residual = (x - senior_lp).max(Decimal::ZERO);
    let pool_shares = pool::participating_pool_shares_with(cap_table, decisions, &class.id);
    let value = if pool_shares.is_zero() {
        Decimal::ZERO
    } else {
        residual * class.as_converted_shares() / pool_shares
    };
    cache.insert(key, value);
    value
}

/// Dollar value a non-participating class receives if it retains its
/// liquidation preference at exit value `x`.
fn retain_value_total(
    cap_table: &CapTable,
    class: &ShareClass,
    decisions: &ConversionDecisions,
    x: Decimal,
    cache: &mut RvpsCache,
    ctx: &mut AnalysisContext,
) -> Decimal {
    let key = (x, class.id.clone(), false, converted_senior_ids(decisions));
    if let Some(v) = cache.get(&key) {
        ctx.record_cache_hit();
        return *v;
    }
    ctx.record_cache_miss();
    let senior_lp = pool::senior_retained_lp(cap_table, class, decisions);
    let residual = (x - senior_lp).max(Decimal::ZERO);
    let value = class.liquidation_preference().min(residual);
    cache.insert(key, value);
    value
}

/// Generic bisection on the sign of `f`. Assumes `f` is non-decreasing
/// over `[lo, hi]` and crosses zero somewhere in that range; returns
/// `None` (non-convergence) if `f(hi) < 0`, i.e. no crossing exists.
fn bisect<F: FnMut(Decimal) -> Decimal>(mut lo: Decimal, mut hi: Decimal, mut f: F) -> Option<(Decimal, u32)> {
    if f(hi) < Decimal::ZERO {
        return None;
    }
    if f(lo) >= Decimal::ZERO {
        return Some((lo, 0));
    }

    let mut iterations = 0u32;
    for i in 0..MAX_SOLVER_ITERATIONS {
        iterations = i + 1;
        let mid = (lo + hi) / dec!(2);
        if f(mid) < Decimal::ZERO {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < CONVERSION_TOLERANCE {
            break;
        }
    }
    Some(((lo + hi) / dec!(2), iterations))
}

/// Binary-search the exit value where a non-participating class's
/// as-converted value first exceeds its retained-LP value.
pub fn solve_non_participating_conversion(
    cap_table: &CapTable,
    class: &ShareClass,
    decisions: &ConversionDecisions,
    ctx: &mut AnalysisContext,
) -> Option<Decimal> {
    let lo = class.liquidation_preference();
    let hi = lo * dec!(100);
    let mut cache = RvpsCache::new();
    let f = |x: Decimal| {
        convert_value_total(cap_table, class, decisions, x, &mut cache, &mut *ctx)
            - retain_value_total(cap_table, class, decisions, x, &mut cache, &mut *ctx)
    };

    match bisect(lo, hi, f) {
        Some((x, iterations)) => {
            ctx.record_iterations(format!("conversion:{}", class.id), iterations);
            Some(x)
        }
        None => {
            ctx.log(
                "voluntary_conversion",
                format!("{} did not converge within [{lo}, {hi}]; breakpoint omitted", class.name),
            );
            None
        }
    }
}

/// Closed-form exit value at which a participating-with-cap class's total
/// payout (LP + pro-rata participation) reaches its cap:
/// `lp + proRataShare·(X − totalLP) = capValue`.
pub fn cap_reach_exit_value(cap_table: &CapTable, class: &ShareClass) -> Option<Decimal> {
    let lp = class.liquidation_preference();
    let cap_value = class.participation_cap_value()?;
    let total_lp = cap_table.total_liquidation_preference();
    let base_pool = pool::participating_pool_shares(cap_table, &ConversionDecisions::new());
    if base_pool.is_zero() {
        return None;
    }
    let pro_rata_share = class.as_converted_shares() / base_pool;
    if pro_rata_share.is_zero() {
        return None;
    }
    Some(total_lp + (cap_value - lp) / pro_rata_share)
}

/// Binary-search the exit value above a class's cap-reach point where
/// full conversion (forfeiting LP and cap, joining common) first exceeds
/// the capped participation value.
pub fn solve_capped_participating_conversion(
    cap_table: &CapTable,
    class: &ShareClass,
    decisions: &ConversionDecisions,
    cap_reach: Decimal,
    ctx: &mut AnalysisContext,
) -> Option<Decimal> {
    let cap_value = class.participation_cap_value()?;
    let lo = cap_reach;
    let hi = cap_reach * dec!(10);
    let mut cache = RvpsCache::new();
    let f = |x: Decimal| convert_value_total(cap_table, class, decisions, x, &mut cache, &mut *ctx) - cap_value;

    match bisect(lo, hi, f) {
        Some((x, iterations)) => {
            ctx.record_iterations(format!("conversion:{}", class.id), iterations);
            Some(x)
        }
        None => {
            ctx.log(
                "voluntary_conversion",
                format!("{} post-cap conversion did not converge within [{lo}, {hi}]; breakpoint omitted", class.name),
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waterfall::model::{OptionGrant, PreferenceType, ShareClassKind};
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

    fn series_a_non_participating(shares: u64) -> ShareClass {
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
    fn non_participating_conversion_near_expected_threshold() {
        // Common 1M, Series A 1M @ $1 1x non-participating. Converting pays
        // 0.5x (pro rata of a 2M-share pool); retaining pays min($1M, x).
        // These cross where 0.5x = $1M, i.e. x = $2,000,000.
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a_non_participating(1_000_000)],
            option_grants: vec![],
        };
        let class = cap_table.class_by_id("series_a").unwrap();
        let mut ctx = AnalysisContext::new();
        let decisions = ConversionDecisions::new();
        let x = solve_non_participating_conversion(&cap_table, class, &decisions, &mut ctx).unwrap();
        assert!((x - dec!(2_000_000)).abs() < dec!(1), "expected ~2,000,000, got {x}");
    }

    #[test]
    fn sequential_option_exercise_near_expected_threshold() {
        // Common 1M, Series A 1M @ $1 1x, options 500k @ $2 strike.
        // perShare(X) = (X + n*s - totalLP) / (baseShares + n) crosses $2
        // at X = s*baseShares + totalLP = 2*2,000,000 + 1,000,000 = $5,000,000.
        let cap_table = CapTable {
            share_classes: vec![common(1_000_000), series_a_non_participating(1_000_000)],
            option_grants: vec![OptionGrant {
                id: "opts".into(),
                num_options: 500_000,
                vested_count: Some(500_000),
                strike_price: dec!(2.00),
            }],
        };
        let mut ctx = AnalysisContext::new();
        let events = solve_sequential_option_exercise(&cap_table, &mut ctx);
        assert_eq!(events.len(), 1);
        assert!((events[0].exit_value - dec!(5_000_000)).abs() < dec!(10_000), "got {}", events[0].exit_value);
    }
}
