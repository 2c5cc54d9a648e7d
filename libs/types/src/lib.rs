//! # Hurst Channel Types Library
//!
//! Shared domain types for the Hurst channel trading supervisor.
//!
//! ## Design Philosophy
//!
//! - **Typed Identifiers**: Distinct id types keep instances, positions and signals apart
//! - **Stream Time**: Every timestamp is milliseconds since the epoch (`u64`)
//! - **Exact Money**: Capital, allocations and profit use `rust_decimal::Decimal`
//! - **Float Indicators**: Prices and indicator values stay `f64`
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{CandleInterval, Tick};
//!
//! let tick = Tick::new("BTCUSDT", 42_000.0, 1_700_000_000_000);
//! assert!(tick.validate().is_ok());
//!
//! let interval: CandleInterval = "15m".parse().unwrap();
//! assert_eq!(interval.period_end(0), 900_000);
//! ```
//!
//! ## Integration Points
//!
//! - **Config**: `CandleInterval` deserializes directly from instance configuration
//! - **Strategy Engine**: ticks, candles, positions and signals
//! - **Persistence**: every type here is serde-serializable for storage and snapshots

pub mod errors;
pub mod identifiers;
pub mod market;
pub mod signal;
pub mod time;
pub mod trading;

pub use errors::{MarketDataTypeError, ValidationError};
pub use identifiers::{InstanceId, PositionId, SignalId};
pub use market::{Candle, CandleInterval, Tick, TickFingerprint};
pub use signal::{EntryType, ExitReason, Signal, SignalCategory, SignalKind, SignalMetadata};
pub use time::{
    system_timestamp_ms, Clock, ManualClock, SystemClock, TimestampMs, DAY_MS, HOUR_MS,
    MINUTE_MS, SECOND_MS,
};
pub use trading::{
    price_to_decimal, Balance, Entry, ExitDetails, OrderFill, OrderSide, Position,
    PositionStatus, ProfitReport,
};
