//! Shared pool/residual arithmetic used by both the breakpoint solvers and
//! the distribution engine, so the two never drift on what "who is in the
//! participating pool at exit value X" means.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::model::{CapTable, PreferenceType, ShareClass};

/// `true` once a preferred class has elected to forgo its liquidation
/// preference entirely and join the common pool as a pure as-converted
/// holder — either a non-participating class converting, or a
/// participating-with-cap class electing its post-cap full conversion.
/// Plain `Participating` classes never appear here: they always retain
/// their LP *and* participate, so they have no such decision to make.
pub type ConversionDecisions = BTreeMap<String, bool>;

pub fn has_converted(decisions: &ConversionDecisions, class_id: &str) -> bool {
    decisions.get(class_id).copied().unwrap_or(false)
}

/// Sum of liquidation preferences of classes *strictly* senior to `class`
/// that are still retaining (not converted). Same-rank (pari passu) peers
/// are not senior and are excluded.
pub fn senior_retained_lp(cap_table: &CapTable, class: &ShareClass, decisions: &ConversionDecisions) -> Decimal {
    let rank = match class.seniority_rank {
        Some(r) => r,
        None => return Decimal::ZERO,
    };
    cap_table
        .preferred_classes()
        .filter(|c| c.seniority_rank.map(|r| r < rank).unwrap_or(false))
        .filter(|c| !has_converted(decisions, &c.id))
        .map(|c| c.liquidation_preference())
        .sum()
}

/// Shares sharing in the residual pool at the given decisions: common,
/// every participating (capped or not) preferred class at its conversion
/// ratio — unconditionally, since "participating" means it always shares
/// pro rata — plus any non-participating class that has elected to convert.
pub fn participating_pool_shares(cap_table: &CapTable, decisions: &ConversionDecisions) -> Decimal {
    let preferred: Decimal = cap_table
        .preferred_classes()
        .filter(|c| match c.preference_type {
            Some(PreferenceType::Participating) | Some(PreferenceType::ParticipatingWithCap) => true,
            Some(PreferenceType::NonParticipating) => has_converted(decisions, &c.id),
            None => false,
        })
        .map(|c| c.as_converted_shares())
        .sum();
    cap_table.common_shares() + preferred
}

/// `participating_pool_shares` plus an additional hypothetical participant —
/// used while bisecting a single class's own conversion decision, before it
/// has been recorded into `decisions`.
pub fn participating_pool_shares_with(
    cap_table: &CapTable,
    decisions: &ConversionDecisions,
    extra_converted_class_id: &str,
) -> Decimal {
    let mut with_extra = decisions.clone();
    with_extra.insert(extra_converted_class_id.to_string(), true);
    participating_pool_shares(cap_table, &with_extra)
}

/// Exercised option shares and their aggregate exercise proceeds at a given
/// exit value, given the sequential-dilution schedule
/// `(strike, aggregate_vested, exit_value_at_which_it_becomes_exercised)`.
/// Cheap options are always in the money regardless of the schedule.
pub fn exercised_option_pool(
    cap_table: &CapTable,
    schedule: &[(Decimal, Decimal, Decimal)],
    at_exit_value: Decimal,
) -> (Decimal, Decimal) {
    let mut shares = cap_table.cheap_option_vested_shares();
    let mut proceeds = cap_table.cheap_option_proceeds();
    for (strike, aggregate_vested, exit_value) in schedule {
        if *exit_value <= at_exit_value {
            shares += aggregate_vested;
            proceeds += aggregate_vested * strike;
        }
    }
    (shares, proceeds)
}
