use rust_decimal::Decimal;
use thiserror::Error;

/// Error taxonomy for cap-table validation, breakpoint analysis, and
/// proceeds distribution. Validators are strict (abort); solvers degrade
/// and record a warning instead of raising; distribution is strict.
#[derive(Debug, Error)]
pub enum WaterfallError {
    #[error("Negative liquidation preference: {class_name} has pricePerShare or lpMultiple < 0")]
    NegativeLiquidationPreference { class_name: String },

    #[error("Negative strike price on option grant {grant_id}: {strike}")]
    NegativeStrike { grant_id: String, strike: Decimal },

    #[error("Non-positive option count on grant {grant_id}: {num_options}")]
    NonPositiveOptionCount { grant_id: String, num_options: i64 },

    #[error("Negative seniority rank on {class_name}: {seniority_rank}")]
    NegativeSeniority { class_name: String, seniority_rank: i64 },

    #[error("Missing or invalid participation cap on {class_name}: ParticipatingWithCap requires a cap >= 1")]
    MissingParticipationCap { class_name: String },

    #[error("Distribution did not conserve proceeds: |sum(payouts) - exitValue| = {delta} exceeds tolerance")]
    DistributionNonConservation { delta: Decimal },

    #[error("Solver did not converge: {detail}")]
    SolverDidNotConverge { detail: String },
}
