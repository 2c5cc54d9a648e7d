//! Error types for domain type construction and parsing

use thiserror::Error;

/// Errors that can occur during typed ID validation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// ID value is null/zero when non-null required
    #[error("ID cannot be null/zero")]
    NullId,

    /// Custom validation failure with message
    #[error("Validation failed: {message}")]
    Custom { message: String },
}

/// Errors raised while parsing or building market data types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataTypeError {
    /// Interval string could not be parsed (expected e.g. `15m`, `1h`, `1d`)
    #[error("Invalid candle interval: '{input}'")]
    InvalidInterval { input: String },

    /// Price is not finite or not positive
    #[error("Invalid price {value} for {field}")]
    InvalidPrice { field: &'static str, value: f64 },

    /// High/low range does not contain the last price
    #[error("Inconsistent tick range: low {low} / price {price} / high {high}")]
    InconsistentRange { low: f64, price: f64, high: f64 },

    /// Tick routed to an instance trading another symbol
    #[error("Tick for {got} delivered to {expected} instance")]
    SymbolMismatch { expected: String, got: String },
}
