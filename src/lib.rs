//! Cap-table waterfall breakpoint analyzer and proceeds distribution engine.
//!
//! Given a snapshot of a company's capitalization (`waterfall::CapTable`),
//! `waterfall::analyze` finds every exit value at which the economics of a
//! distribution change, and `waterfall::distribute` computes the actual
//! per-security payout at a concrete exit value.

pub mod error;
pub mod types;
pub mod waterfall;

pub use error::WaterfallError;
