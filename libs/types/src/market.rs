//! Market data primitives: live ticks, candles and candle intervals

use crate::errors::MarketDataTypeError;
use crate::time::{TimestampMs, DAY_MS, HOUR_MS, MINUTE_MS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One push update from the live stream
///
/// `high`/`low` are the extremes reported by the feed for this update. Feeds that
/// only publish a last price produce ticks with `high == low == price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub high: f64,
    pub low: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: TimestampMs,
}

/// Identity of a tick for duplicate detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickFingerprint {
    pub timestamp: TimestampMs,
    price: u64,
    high: u64,
    low: u64,
}

impl Tick {
    /// Tick carrying a single last price
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: TimestampMs) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            high: price,
            low: price,
            volume: 0.0,
            timestamp,
        }
    }

    pub fn with_range(mut self, high: f64, low: f64) -> Self {
        self.high = high;
        self.low = low;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// Reject non-finite or non-positive prices and ranges that exclude the price
    pub fn validate(&self) -> Result<(), MarketDataTypeError> {
        for (field, value) in [("price", self.price), ("high", self.high), ("low", self.low)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MarketDataTypeError::InvalidPrice { field, value });
            }
        }
        if self.low > self.price || self.price > self.high {
            return Err(MarketDataTypeError::InconsistentRange {
                low: self.low,
                price: self.price,
                high: self.high,
            });
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> TickFingerprint {
        TickFingerprint {
            timestamp: self.timestamp,
            price: self.price.to_bits(),
            high: self.high.to_bits(),
            low: self.low.to_bits(),
        }
    }
}

/// Candle period, stored as a length in milliseconds
///
/// Serialized as the usual exchange shorthand (`15m`, `1h`, `4h`, `1d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandleInterval(u64);

impl CandleInterval {
    pub const FIFTEEN_MINUTES: CandleInterval = CandleInterval(15 * MINUTE_MS);
    pub const ONE_HOUR: CandleInterval = CandleInterval(HOUR_MS);
    pub const FOUR_HOURS: CandleInterval = CandleInterval(4 * HOUR_MS);
    pub const ONE_DAY: CandleInterval = CandleInterval(DAY_MS);

    pub fn from_ms(period_ms: u64) -> Option<Self> {
        (period_ms > 0).then_some(Self(period_ms))
    }

    #[inline]
    pub const fn as_ms(&self) -> u64 {
        self.0
    }

    /// Start of the period containing `ts`, aligned to the epoch
    #[inline]
    pub fn period_start(&self, ts: TimestampMs) -> TimestampMs {
        ts - ts % self.0
    }

    /// Exclusive end of the period containing `ts`
    #[inline]
    pub fn period_end(&self, ts: TimestampMs) -> TimestampMs {
        self.period_start(ts) + self.0
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms % DAY_MS == 0 {
            write!(f, "{}d", ms / DAY_MS)
        } else if ms % HOUR_MS == 0 {
            write!(f, "{}h", ms / HOUR_MS)
        } else if ms % MINUTE_MS == 0 {
            write!(f, "{}m", ms / MINUTE_MS)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl FromStr for CandleInterval {
    type Err = MarketDataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketDataTypeError::InvalidInterval { input: s.to_string() };
        let trimmed = s.trim();
        let (digits, unit_ms) = if let Some(n) = trimmed.strip_suffix("ms") {
            (n, 1)
        } else if let Some(n) = trimmed.strip_suffix('m') {
            (n, MINUTE_MS)
        } else if let Some(n) = trimmed.strip_suffix('h') {
            (n, HOUR_MS)
        } else if let Some(n) = trimmed.strip_suffix('d') {
            (n, DAY_MS)
        } else {
            return Err(invalid());
        };
        let count: u64 = digits.parse().map_err(|_| invalid())?;
        count
            .checked_mul(unit_ms)
            .and_then(CandleInterval::from_ms)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for CandleInterval {
    type Error = MarketDataTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CandleInterval> for String {
    fn from(interval: CandleInterval) -> Self {
        interval.to_string()
    }
}

/// OHLCV candle; immutable once `is_closed` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: TimestampMs,
    /// Exclusive end of the period (`open_time + interval`)
    pub close_time: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// Open a new forming candle for the period containing the tick
    pub fn open_from_tick(interval: CandleInterval, tick: &Tick) -> Self {
        let open_time = interval.period_start(tick.timestamp);
        Self {
            open_time,
            close_time: open_time + interval.as_ms(),
            open: tick.price,
            high: tick.high,
            low: tick.low,
            close: tick.price,
            volume: tick.volume,
            is_closed: false,
        }
    }

    /// Closed zero-volume candle used to fill periods without ticks
    pub fn flat(interval: CandleInterval, open_time: TimestampMs, price: f64) -> Self {
        Self {
            open_time,
            close_time: open_time + interval.as_ms(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            is_closed: true,
        }
    }

    /// Fold a tick belonging to this period into the forming candle
    pub fn absorb(&mut self, tick: &Tick) {
        debug_assert!(!self.is_closed, "closed candles are immutable");
        self.high = self.high.max(tick.high);
        self.low = self.low.min(tick.low);
        self.close = tick.price;
        self.volume += tick.volume;
    }

    /// Fold a late tick into extremes and volume without moving the close
    pub fn absorb_late(&mut self, tick: &Tick) {
        debug_assert!(!self.is_closed, "closed candles are immutable");
        self.high = self.high.max(tick.high);
        self.low = self.low.min(tick.low);
        self.volume += tick.volume;
    }

    /// Finalise the candle, returning the immutable closed copy
    pub fn finalize(&self) -> Candle {
        Candle {
            is_closed: true,
            ..self.clone()
        }
    }

    pub fn contains(&self, ts: TimestampMs) -> bool {
        ts >= self.open_time && ts < self.close_time
    }
}
