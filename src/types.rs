use rust_decimal::Decimal;

/// All monetary values. Wraps Decimal to prevent accidental f64 usage.
pub type Money = Decimal;

/// Ratios and multiples (e.g. a 2x liquidation preference, a 1.5 conversion ratio).
pub type Multiple = Decimal;
