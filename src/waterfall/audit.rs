use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::time::Instant;

use super::model::{round_half_up, CapTable};

/// One entry in the audit trail: one per analysis phase, plus one per
/// solver warning (option or conversion non-convergence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub phase: String,
    pub message: String,
    pub elapsed_us: u64,
}

/// Iteration counts and cache statistics for one analysis. Owned by the
/// call that produced it; never shared or reused across analyses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub analysis_wall_time_us: u64,
    pub iterations_by_key: HashMap<String, u32>,
    pub cache_hits: u32,
    pub cache_misses: u32,
}

/// Per-call audit/metrics accumulator. Never a global or static — a fresh
/// one is created per `analyze`/`distribute` call so concurrent analyses
/// never share mutable state.
pub struct AnalysisContext {
    start: Instant,
    pub audit_trail: Vec<AuditEntry>,
    pub metrics: PerformanceMetrics,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            audit_trail: Vec::new(),
            metrics: PerformanceMetrics::default(),
        }
    }

    pub fn log(&mut self, phase: &str, message: impl Into<String>) {
        self.audit_trail.push(AuditEntry {
            phase: phase.to_string(),
            message: message.into(),
            elapsed_us: self.start.elapsed().as_micros() as u64,
        });
    }

    pub fn record_iterations(&mut self, key: impl Into<String>, iterations: u32) {
        self.metrics.iterations_by_key.insert(key.into(), iterations);
    }

    pub fn record_cache_hit(&mut self) {
        self.metrics.cache_hits += 1;
    }

    pub fn record_cache_miss(&mut self) {
        self.metrics.cache_misses += 1;
    }

    pub fn finish(mut self) -> PerformanceMetrics {
        self.metrics.analysis_wall_time_us = self.start.elapsed().as_micros() as u64;
        self.metrics
    }
}

impl Default for AnalysisContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic textual form of a cap table (and, if given, an exit
/// value), with decimals fixed at 10 fractional digits and fields in
/// declared struct order. Used only to feed the verification hash — not a
/// public serialization format.
pub fn canonicalize(cap_table: &CapTable, exit_value: Option<Decimal>) -> String {
    let mut out = String::new();
    out.push_str("share_classes:[");
    for class in &cap_table.share_classes {
        out.push_str(&format!(
            "{{id={};name={};kind={:?};shares={};price={};ratio={};pref={:?};lp_mult={};seniority={};cap={}}}",
            class.id,
            class.name,
            class.kind,
            class.shares_outstanding,
            fixed10(class.price_per_share),
            fixed10(class.conversion_ratio),
            class.preference_type,
            fixed10(class.lp_multiple),
            class.seniority_rank.map(|r| r.to_string()).unwrap_or_else(|| "none".into()),
            class
                .participation_cap
                .map(fixed10)
                .unwrap_or_else(|| "none".into()),
        ));
    }
    out.push(']');

    out.push_str(";option_grants:[");
    for grant in &cap_table.option_grants {
        out.push_str(&format!(
            "{{id={};num={};vested={};strike={}}}",
            grant.id,
            grant.num_options,
            grant.effective_vested_count(),
            fixed10(grant.strike_price),
        ));
    }
    out.push(']');

    if let Some(x) = exit_value {
        out.push_str(&format!(";exit_value={}", fixed10(x)));
    }

    out
}

pub fn fixed10(d: Decimal) -> String {
    round_half_up(d, 10).to_string()
}

/// Deterministic textual form of a `String -> Decimal` map (e.g. a
/// conversion schedule, cap-reach schedule, or payouts table), labelled and
/// fixed at 10 fractional digits. `BTreeMap` iteration is already key-sorted,
/// so this is stable across construction order.
pub fn canonicalize_decimal_map(label: &str, map: &BTreeMap<String, Decimal>) -> String {
    let mut out = format!("{label}:[");
    for (key, value) in map {
        out.push_str(&format!("{{{key}={}}}", fixed10(*value)));
    }
    out.push(']');
    out
}

/// Stable 16-hex-digit digest over the canonical serialization of inputs
/// (and, for `distribute`, the concrete exit value too) and of the computed
/// outputs (`outputs_canonical`, built by the caller from its own result
/// types). Identical logical inputs *and* outputs hash identically,
/// regardless of construction order in memory; two analyses that agree on
/// the cap table but disagree on the computed breakpoints or payouts hash
/// differently, so the digest also catches computation drift, not just
/// input drift.
pub fn verification_hash(
    cap_table: &CapTable,
    exit_value: Option<Decimal>,
    outputs_canonical: &str,
) -> String {
    let mut canonical = canonicalize(cap_table, exit_value);
    canonical.push_str(";outputs:");
    canonical.push_str(outputs_canonical);
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
