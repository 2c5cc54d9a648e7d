//! Trading signal definitions
//!
//! Signal `type`/`subType` are a single tagged enum so that every consumer has
//! to handle each entry tranche and exit reason explicitly.

use crate::identifiers::{InstanceId, PositionId, SignalId};
use crate::time::TimestampMs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Staged entry tranche, ordered by rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    First,
    Second,
    Third,
}

impl EntryType {
    pub const ALL: [EntryType; 3] = [EntryType::First, EntryType::Second, EntryType::Third];

    /// Zero-based rank; also the number of entries that must precede this one
    pub fn rank(self) -> usize {
        match self {
            EntryType::First => 0,
            EntryType::Second => 1,
            EntryType::Third => 2,
        }
    }

    /// Tranche that follows `count` existing entries
    pub fn for_entry_count(count: usize) -> Option<EntryType> {
        Self::ALL.get(count).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::First => "first",
            EntryType::Second => "second",
            EntryType::Third => "third",
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    UpperBandReturn,
    TrailingStop,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::UpperBandReturn => "upperBandReturn",
            ExitReason::TrailingStop => "trailingStop",
            ExitReason::Manual => "manual",
        }
    }
}

/// Signal type and sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "subType", rename_all = "snake_case")]
pub enum SignalKind {
    Entry(EntryType),
    Exit(ExitReason),
}

impl SignalKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalKind::Entry(_))
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, SignalKind::Exit(_))
    }

    pub fn category(&self) -> SignalCategory {
        match self {
            SignalKind::Entry(_) => SignalCategory::Entry,
            SignalKind::Exit(_) => SignalCategory::Exit,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Entry(t) => write!(f, "entry/{}", t.as_str()),
            SignalKind::Exit(r) => write!(f, "exit/{}", r.as_str()),
        }
    }
}

/// Signal type without the sub-type, used for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Entry,
    Exit,
}

/// Indicator context captured when the signal fired
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetadata {
    pub upper_band: Option<f64>,
    pub lower_band: Option<f64>,
    pub mid_band: Option<f64>,
    pub hurst_exponent: Option<f64>,
    pub ema_value: Option<f64>,
    pub ema_slope: Option<String>,
    pub peak_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub entry_avg_price: Option<f64>,
    pub test_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub instance_id: InstanceId,
    pub symbol: String,
    pub kind: SignalKind,
    pub price: f64,
    pub timestamp: TimestampMs,
    pub allocation_fraction: Option<Decimal>,
    pub quote_amount: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub profit_percent: Option<Decimal>,
    pub metadata: SignalMetadata,
    pub position_id: PositionId,
}

impl Signal {
    /// Client order id sent to the broker; stable for the lifetime of the signal
    pub fn client_order_id(&self) -> String {
        format!("{}-{}", self.instance_id.inner(), self.id.inner())
    }
}
