//! Positions, staged entries and broker-facing order types

use crate::identifiers::PositionId;
use crate::signal::{EntryType, ExitReason};
use crate::time::TimestampMs;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Convert a market price into a `Decimal` for capital arithmetic
pub fn price_to_decimal(price: f64) -> Option<Decimal> {
    if !price.is_finite() {
        return None;
    }
    Decimal::from_f64(price)
}

/// One staged tranche of a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub time: TimestampMs,
    pub price: f64,
    pub entry_type: EntryType,
    pub allocation_fraction: Decimal,
    pub quote_amount: Decimal,
    pub base_amount: Decimal,
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    None,
    Active,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::None => "none",
            PositionStatus::Active => "active",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }
}

/// A long position built from up to three staged entries
///
/// `entry_avg_price` is derived and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: PositionId,
    pub symbol: String,
    pub status: PositionStatus,
    pub entries: Vec<Entry>,
    pub total_base: Decimal,
    pub total_quote: Decimal,
    pub first_entry_time: TimestampMs,
    pub last_entry_time: TimestampMs,
    pub peak_price_since_armed: Option<f64>,
    pub trailing_armed_at: Option<TimestampMs>,
    /// A tick traded fully above the mid band since the last entry
    #[serde(default)]
    pub mid_reclaimed: bool,
    /// Set when the position entered `closing`
    #[serde(default)]
    pub closing_since: Option<TimestampMs>,
    /// Why the position is closing
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// New active position seeded with its first entry
    pub fn open(position_id: PositionId, symbol: impl Into<String>, first: Entry) -> Self {
        let mut position = Self {
            position_id,
            symbol: symbol.into(),
            status: PositionStatus::Active,
            first_entry_time: first.time,
            last_entry_time: first.time,
            entries: vec![first],
            total_base: Decimal::ZERO,
            total_quote: Decimal::ZERO,
            peak_price_since_armed: None,
            trailing_armed_at: None,
            mid_reclaimed: false,
            closing_since: None,
            exit_reason: None,
        };
        position.recompute_totals();
        position
    }

    /// Recompute totals and entry times from `entries`
    pub fn recompute_totals(&mut self) {
        self.total_base = self.entries.iter().map(|e| e.base_amount).sum();
        self.total_quote = self.entries.iter().map(|e| e.quote_amount).sum();
        if let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) {
            self.first_entry_time = first.time;
            self.last_entry_time = last.time;
        }
    }

    /// Average entry price weighted by each entry's quote amount
    pub fn entry_avg_price(&self) -> Option<f64> {
        let mut weighted = 0.0;
        let mut weight = 0.0;
        for entry in &self.entries {
            let quote = entry.quote_amount.to_f64()?;
            weighted += entry.price * quote;
            weight += quote;
        }
        (weight > 0.0).then(|| weighted / weight)
    }

    pub fn allocation_total(&self) -> Decimal {
        self.entries.iter().map(|e| e.allocation_fraction).sum()
    }

    pub fn next_entry_type(&self) -> Option<EntryType> {
        EntryType::for_entry_count(self.entries.len())
    }

    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Mark-to-market value of the position at `price`
    pub fn market_value(&self, price: f64) -> Option<Decimal> {
        Some(self.total_base * price_to_decimal(price)?)
    }
}

/// Profit figures for a closed position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitReport {
    pub profit: Decimal,
    pub profit_percent: Decimal,
}

impl ProfitReport {
    /// `profit = exit_quote − invested`, `profit_percent = profit / invested · 100`
    pub fn compute(exit_quote: Decimal, invested: Decimal) -> Self {
        let profit = exit_quote - invested;
        let profit_percent = if invested.is_zero() {
            Decimal::ZERO
        } else {
            (profit / invested * Decimal::ONE_HUNDRED).round_dp(4)
        };
        Self {
            profit,
            profit_percent,
        }
    }
}

/// Details recorded when a position is archived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDetails {
    pub exit_time: TimestampMs,
    pub exit_price: f64,
    pub exit_quote: Decimal,
    pub exit_base: Decimal,
    pub reason: ExitReason,
    pub profit: Decimal,
    pub profit_percent: Decimal,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Broker execution report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_fill_price: f64,
    pub filled_base: Decimal,
    pub filled_quote: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
    pub locked: Decimal,
}
