//! Breakpoint analysis: finds every exit value at which the economics of
//! the distribution change — a liquidation preference getting fully paid,
//! the residual pool opening up, an option strike going in the money, a
//! preferred class electing to convert, a capped class hitting its ceiling.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::audit::{AnalysisContext, AuditEntry, PerformanceMetrics};
use super::model::{self, CapTable, PreferenceType};
use super::pool::ConversionDecisions;
use super::solver::{self, OptionExerciseEvent};
use crate::error::WaterfallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BreakpointType {
    LiquidationPreference,
    ProRataDistribution,
    OptionExercise,
    VoluntaryConversion,
    ParticipationCap,
}

impl BreakpointType {
    /// Phase ordering (a)-(e): used as the first tie-break when two
    /// breakpoints land on the same exit value.
    fn priority_order(self) -> u32 {
        match self {
            BreakpointType::LiquidationPreference => 0,
            BreakpointType::ProRataDistribution => 1,
            BreakpointType::OptionExercise => 2,
            BreakpointType::VoluntaryConversion => 3,
            BreakpointType::ParticipationCap => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    pub exit_value: Decimal,
    pub breakpoint_type: BreakpointType,
    pub class_id: Option<String>,
    pub description: String,
    sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    pub expected: usize,
    pub actual: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rules: Vec<ValidationRule>,
    pub all_passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointAnalysisResult {
    pub breakpoints: Vec<Breakpoint>,
    pub option_exercise_schedule: Vec<OptionExerciseEvent>,
    /// class id -> exit value above which the class has elected to convert
    /// (join the residual pool as a non-participating class, or escape its
    /// cap as a participating-with-cap class).
    pub conversion_schedule: BTreeMap<String, Decimal>,
    /// class id -> exit value at which a participating-with-cap class's
    /// payout first reaches its cap.
    pub cap_reach_schedule: BTreeMap<String, Decimal>,
    pub validation: ValidationReport,
    pub audit_trail: Vec<AuditEntry>,
    pub metrics: PerformanceMetrics,
    pub verification_hash: String,
}

/// Run the full five-phase breakpoint analysis over a cap table.
pub fn analyze(cap_table: &CapTable) -> Result<BreakpointAnalysisResult, WaterfallError> {
    model::validate(cap_table)?;

    let mut ctx = AnalysisContext::new();
    let mut breakpoints: Vec<Breakpoint> = Vec::new();
    let mut sequence = 0u32;
    let mut push = |bps: &mut Vec<Breakpoint>, seq: &mut u32, exit_value: Decimal, bt: BreakpointType, class_id: Option<String>, description: String| {
        bps.push(Breakpoint {
            exit_value,
            breakpoint_type: bt,
            class_id,
            description,
            sequence: *seq,
        });
        *seq += 1;
    };

    // (a) Liquidation-preference breakpoints: one per seniority rank, at the
    // cumulative LP paid through that rank.
    ctx.log("liquidation_preference", "computing per-rank cumulative LP breakpoints");
    let mut cumulative = Decimal::ZERO;
    for rank in cap_table.seniority_ranks() {
        let classes_at_rank = cap_table.classes_at_rank(rank);
        let rank_lp: Decimal = classes_at_rank.iter().map(|c| c.liquidation_preference()).sum();
        cumulative += rank_lp;
        let names: Vec<&str> = classes_at_rank.iter().map(|c| c.name.as_str()).collect();
        push(
            &mut breakpoints,
            &mut sequence,
            cumulative,
            BreakpointType::LiquidationPreference,
            None,
            format!("seniority rank {rank} liquidation preference satisfied ({}, pari passu)", names.join(", ")),
        );
    }

    // (b) Pro-rata distribution breakpoint: exactly one, where the residual
    // pool begins receiving proceeds.
    let total_lp = cap_table.total_liquidation_preference();
    ctx.log("pro_rata_distribution", format!("residual pool opens at exit value {total_lp}"));
    push(
        &mut breakpoints,
        &mut sequence,
        total_lp,
        BreakpointType::ProRataDistribution,
        None,
        "residual proceeds begin flowing pro rata".to_string(),
    );

    // (c) Option-exercise breakpoints, sequential-dilution model.
    ctx.log("option_exercise", "solving sequential option-exercise breakpoints");
    let option_exercise_schedule = solver::solve_sequential_option_exercise(cap_table, &mut ctx);
    for event in &option_exercise_schedule {
        push(
            &mut breakpoints,
            &mut sequence,
            event.exit_value,
            BreakpointType::OptionExercise,
            None,
            format!("options at strike {} become in the money", event.strike),
        );
    }

    // (d)/(e) Voluntary conversion and participation cap breakpoints.
    // Processed senior-to-junior so each class's own threshold can assume
    // already-processed senior classes' decisions are settled.
    ctx.log("voluntary_conversion", "solving voluntary conversion and participation cap breakpoints");
    let mut decisions = ConversionDecisions::new();
    let mut conversion_schedule: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut cap_reach_schedule: BTreeMap<String, Decimal> = BTreeMap::new();

    let mut ordered: Vec<&model::ShareClass> = cap_table
        .preferred_classes()
        .filter(|c| {
            matches!(
                c.preference_type,
                Some(PreferenceType::NonParticipating) | Some(PreferenceType::ParticipatingWithCap)
            )
        })
        .collect();
    ordered.sort_by_key(|c| c.seniority_rank.unwrap_or(i64::MAX));

    for class in ordered {
        match class.preference_type {
            Some(PreferenceType::NonParticipating) => {
                if let Some(x) = solver::solve_non_participating_conversion(cap_table, class, &decisions, &mut ctx) {
                    push(
                        &mut breakpoints,
                        &mut sequence,
                        x,
                        BreakpointType::VoluntaryConversion,
                        Some(class.id.clone()),
                        format!("{} elects to convert rather than retain its preference", class.name),
                    );
                    conversion_schedule.insert(class.id.clone(), x);
                    decisions.insert(class.id.clone(), true);
                }
            }
            Some(PreferenceType::ParticipatingWithCap) => {
                if let Some(reach) = solver::cap_reach_exit_value(cap_table, class) {
                    push(
                        &mut breakpoints,
                        &mut sequence,
                        reach,
                        BreakpointType::ParticipationCap,
                        Some(class.id.clone()),
                        format!("{} participation reaches its cap", class.name),
                    );
                    cap_reach_schedule.insert(class.id.clone(), reach);

                    if let Some(x) =
                        solver::solve_capped_participating_conversion(cap_table, class, &decisions, reach, &mut ctx)
                    {
                        push(
                            &mut breakpoints,
                            &mut sequence,
                            x,
                            BreakpointType::VoluntaryConversion,
                            Some(class.id.clone()),
                            format!("{} elects full conversion, forfeiting its cap", class.name),
                        );
                        conversion_schedule.insert(class.id.clone(), x);
                        decisions.insert(class.id.clone(), true);
                    }
                }
            }
            _ => {}
        }
    }

    // Global sort: ascending exit value, then phase order, then insertion order.
    breakpoints.sort_by(|a, b| {
        a.exit_value
            .cmp(&b.exit_value)
            .then_with(|| a.breakpoint_type.priority_order().cmp(&b.breakpoint_type.priority_order()))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    let validation = validate_counts(cap_table, &breakpoints, &option_exercise_schedule);
    let outputs_canonical = canonicalize_outputs(&breakpoints, &conversion_schedule, &cap_reach_schedule, &option_exercise_schedule);
    let verification_hash = super::audit::verification_hash(cap_table, None, &outputs_canonical);
    let audit_trail = std::mem::take(&mut ctx.audit_trail);
    let metrics = ctx.finish();

    Ok(BreakpointAnalysisResult {
        breakpoints,
        option_exercise_schedule,
        conversion_schedule,
        cap_reach_schedule,
        validation,
        audit_trail,
        metrics,
        verification_hash,
    })
}

/// Deterministic textual form of the computed breakpoint schedule, folded
/// into the verification hash alongside the input cap table so that two
/// analyses agreeing on inputs but disagreeing on computed breakpoints
/// (a drifted or buggy build) do not hash identically.
fn canonicalize_outputs(
    breakpoints: &[Breakpoint],
    conversion_schedule: &BTreeMap<String, Decimal>,
    cap_reach_schedule: &BTreeMap<String, Decimal>,
    option_exercise_schedule: &[OptionExerciseEvent],
) -> String {
    let mut out = String::from("breakpoints:[");
    for bp in breakpoints {
        out.push_str(&format!(
            "{{exit={};type={:?};class={}}}",
            super::audit::fixed10(bp.exit_value),
            bp.breakpoint_type,
            bp.class_id.as_deref().unwrap_or("none"),
        ));
    }
    out.push(']');
    out.push(';');
    out.push_str(&super::audit::canonicalize_decimal_map("conversion_schedule", conversion_schedule));
    out.push(';');
    out.push_str(&super::audit::canonicalize_decimal_map("cap_reach_schedule", cap_reach_schedule));
    out.push_str(";option_exercise_schedule:[");
    for event in option_exercise_schedule {
        out.push_str(&format!(
            "{{strike={};exit={}}}",
            super::audit::fixed10(event.strike),
            super::audit::fixed10(event.exit_value),
        ));
    }
    out.push(']');
    out
}

fn validate_counts(
    cap_table: &CapTable,
    breakpoints: &[Breakpoint],
    option_exercise_schedule: &[OptionExerciseEvent],
) -> ValidationReport {
    let count_of = |bt: BreakpointType| breakpoints.iter().filter(|b| b.breakpoint_type == bt).count();

    let non_participating_count = cap_table
        .preferred_classes()
        .filter(|c| c.preference_type == Some(PreferenceType::NonParticipating))
        .count();
    let capped_participating_count = cap_table
        .preferred_classes()
        .filter(|c| c.preference_type == Some(PreferenceType::ParticipatingWithCap))
        .count();

    let rules = vec![
        ValidationRule {
            name: "liquidation_preference_breakpoints_per_seniority_rank".to_string(),
            expected: cap_table.seniority_ranks().len(),
            actual: count_of(BreakpointType::LiquidationPreference),
            passed: count_of(BreakpointType::LiquidationPreference) == cap_table.seniority_ranks().len(),
        },
        ValidationRule {
            name: "exactly_one_pro_rata_distribution_breakpoint".to_string(),
            expected: 1,
            actual: count_of(BreakpointType::ProRataDistribution),
            passed: count_of(BreakpointType::ProRataDistribution) == 1,
        },
        ValidationRule {
            name: "option_exercise_breakpoints_le_distinct_priced_strikes".to_string(),
            expected: cap_table.priced_strikes().len(),
            actual: option_exercise_schedule.len(),
            passed: option_exercise_schedule.len() <= cap_table.priced_strikes().len(),
        },
        ValidationRule {
            name: "participation_cap_breakpoints_eq_capped_participating_classes".to_string(),
            expected: capped_participating_count,
            actual: count_of(BreakpointType::ParticipationCap),
            passed: count_of(BreakpointType::ParticipationCap) == capped_participating_count,
        },
        ValidationRule {
            name: "voluntary_conversion_breakpoints_le_eligible_classes".to_string(),
            expected: non_participating_count + capped_participating_count,
            actual: count_of(BreakpointType::VoluntaryConversion),
            passed: count_of(BreakpointType::VoluntaryConversion) <= non_participating_count + capped_participating_count,
        },
    ];
    let all_passed = rules.iter().all(|r| r.passed);
    ValidationReport { rules, all_passed }
}
