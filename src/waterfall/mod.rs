//! Cap-table waterfall breakpoint analyzer and proceeds distribution engine.

pub mod analyzer;
pub mod audit;
pub mod distribution;
pub mod model;
pub mod pool;
pub mod solver;

pub use analyzer::{analyze, Breakpoint, BreakpointAnalysisResult, BreakpointType, ValidationReport, ValidationRule};
pub use audit::{AnalysisContext, AuditEntry, PerformanceMetrics};
pub use distribution::{distribute, Distribution, DistributionResult};
pub use model::{validate, CapTable, OptionGrant, PreferenceType, ShareClass, ShareClassKind, CHEAP_STRIKE_THRESHOLD};
pub use pool::ConversionDecisions;
pub use solver::OptionExerciseEvent;
