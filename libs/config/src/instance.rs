//! Per-instance strategy configuration
//!
//! Every option has a default except `symbol` and `initial_capital`, so an
//! instance can be declared with two lines of TOML:
//!
//! ```toml
//! [[instances]]
//! symbol = "BTCUSDT"
//! initial_capital = 1000
//! ```

use crate::defaults;
use crate::error::{ConfigError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use types::{CandleInterval, EntryType};

/// Configuration for one strategy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Trading pair, e.g. `BTCUSDT`
    pub symbol: String,

    /// Currency the quote amounts are denominated in
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,

    #[serde(default)]
    pub hurst: HurstConfig,

    #[serde(default)]
    pub ema: EmaConfig,

    #[serde(default)]
    pub signals: SignalsConfig,

    #[serde(default)]
    pub capital_allocation: CapitalAllocation,

    /// Deployed capital the allocation fractions apply to
    pub initial_capital: Decimal,

    /// Generate signals but suppress broker calls
    #[serde(default)]
    pub test_mode: bool,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Time in `closing` before the position is flagged overdue
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_quote_currency() -> String {
    defaults::position::QUOTE_CURRENCY.to_string()
}

fn default_close_timeout_ms() -> u64 {
    defaults::position::CLOSE_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HurstConfig {
    pub interval: CandleInterval,
    pub periods: usize,
    pub upper_deviation_factor: f64,
    pub lower_deviation_factor: f64,
}

impl Default for HurstConfig {
    fn default() -> Self {
        Self {
            interval: CandleInterval::FIFTEEN_MINUTES,
            periods: defaults::hurst::PERIODS,
            upper_deviation_factor: defaults::hurst::UPPER_DEVIATION_FACTOR,
            lower_deviation_factor: defaults::hurst::LOWER_DEVIATION_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub interval: CandleInterval,
    pub periods: usize,
    /// `|Δ| / value` below this classifies the slope as flat
    pub slope_dead_band: f64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            interval: CandleInterval::ONE_HOUR,
            periods: defaults::ema::PERIODS,
            slope_dead_band: defaults::ema::SLOPE_DEAD_BAND,
        }
    }
}

/// Entry and exit rule parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Block first entries while the EMA trend slopes down
    pub check_ema_trend: bool,
    pub min_entry_time_gap_ms: u64,
    pub min_first_entry_duration_ms: u64,
    pub enable_trailing_stop: bool,
    /// Fractional drawdown from the peak, e.g. `0.02`
    pub trailing_stop: f64,
    pub trailing_stop_delay_ms: u64,
    pub exit_trigger_factor: f64,
    pub return_trigger_factor: f64,
    pub exit_confirm_ms: u64,
    pub return_confirm_ms: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            check_ema_trend: true,
            min_entry_time_gap_ms: defaults::signals::MIN_ENTRY_TIME_GAP_MS,
            min_first_entry_duration_ms: defaults::signals::MIN_FIRST_ENTRY_DURATION_MS,
            enable_trailing_stop: true,
            trailing_stop: defaults::signals::TRAILING_STOP,
            trailing_stop_delay_ms: defaults::signals::TRAILING_STOP_DELAY_MS,
            exit_trigger_factor: defaults::signals::EXIT_TRIGGER_FACTOR,
            return_trigger_factor: defaults::signals::RETURN_TRIGGER_FACTOR,
            exit_confirm_ms: defaults::signals::EXIT_CONFIRM_MS,
            return_confirm_ms: defaults::signals::RETURN_CONFIRM_MS,
        }
    }
}

/// Fraction of deployed capital per staged entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapitalAllocation {
    pub first_entry: Decimal,
    pub second_entry: Decimal,
    pub third_entry: Decimal,
}

impl Default for CapitalAllocation {
    fn default() -> Self {
        Self {
            first_entry: dec!(0.10),
            second_entry: dec!(0.25),
            third_entry: dec!(0.50),
        }
    }
}

impl CapitalAllocation {
    pub fn fraction(&self, entry_type: EntryType) -> Decimal {
        match entry_type {
            EntryType::First => self.first_entry,
            EntryType::Second => self.second_entry,
            EntryType::Third => self.third_entry,
        }
    }

    pub fn total(&self) -> Decimal {
        self.first_entry + self.second_entry + self.third_entry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Late ticks within this window still update the forming candle
    pub staleness_tolerance_ms: u64,
    pub tick_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            staleness_tolerance_ms: defaults::stream::STALENESS_TOLERANCE_MS,
            tick_buffer: defaults::stream::TICK_BUFFER,
        }
    }
}

impl InstanceConfig {
    /// Config with defaults for everything but the symbol and capital
    pub fn new(symbol: impl Into<String>, initial_capital: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quote_currency: default_quote_currency(),
            hurst: HurstConfig::default(),
            ema: EmaConfig::default(),
            signals: SignalsConfig::default(),
            capital_allocation: CapitalAllocation::default(),
            initial_capital,
            test_mode: false,
            stream: StreamConfig::default(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }

    /// Quote amount committed by the given tranche
    pub fn quote_for(&self, entry_type: EntryType) -> Decimal {
        self.initial_capital * self.capital_allocation.fraction(entry_type)
    }

    /// Check every field is within bounds; called before an instance starts
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::invalid("symbol", "must not be empty"));
        }
        if self.quote_currency.trim().is_empty() {
            return Err(ConfigError::invalid("quote_currency", "must not be empty"));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::invalid(
                "initial_capital",
                format!("must be positive, got {}", self.initial_capital),
            ));
        }

        // R/S analysis needs at least a handful of returns
        if self.hurst.periods < 4 {
            return Err(ConfigError::invalid(
                "hurst.periods",
                format!("must be at least 4, got {}", self.hurst.periods),
            ));
        }
        positive("hurst.upper_deviation_factor", self.hurst.upper_deviation_factor)?;
        positive("hurst.lower_deviation_factor", self.hurst.lower_deviation_factor)?;

        if self.ema.periods == 0 {
            return Err(ConfigError::invalid("ema.periods", "must be at least 1"));
        }
        if !self.ema.slope_dead_band.is_finite() || self.ema.slope_dead_band < 0.0 {
            return Err(ConfigError::invalid(
                "ema.slope_dead_band",
                format!("must be non-negative, got {}", self.ema.slope_dead_band),
            ));
        }

        let s = &self.signals;
        if !(s.trailing_stop > 0.0 && s.trailing_stop < 1.0) {
            return Err(ConfigError::invalid(
                "signals.trailing_stop",
                format!("must be in (0, 1), got {}", s.trailing_stop),
            ));
        }
        positive("signals.exit_trigger_factor", s.exit_trigger_factor)?;
        positive("signals.return_trigger_factor", s.return_trigger_factor)?;
        if s.return_trigger_factor > s.exit_trigger_factor {
            return Err(ConfigError::invalid(
                "signals.return_trigger_factor",
                format!(
                    "must not exceed exit_trigger_factor ({} > {})",
                    s.return_trigger_factor, s.exit_trigger_factor
                ),
            ));
        }

        let a = &self.capital_allocation;
        for (field, fraction) in [
            ("capital_allocation.first_entry", a.first_entry),
            ("capital_allocation.second_entry", a.second_entry),
            ("capital_allocation.third_entry", a.third_entry),
        ] {
            if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be in (0, 1], got {}", fraction),
                ));
            }
        }
        if a.total() > Decimal::ONE {
            return Err(ConfigError::invalid(
                "capital_allocation",
                format!("fractions sum to {}, must not exceed 1", a.total()),
            ));
        }

        if self.stream.tick_buffer == 0 {
            return Err(ConfigError::invalid("stream.tick_buffer", "must be at least 1"));
        }

        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {}", value)))
    }
}
