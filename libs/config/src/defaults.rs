//! Configuration defaults
//!
//! Default values shared by the `Default` impls and serde field defaults, so a
//! partially specified TOML file resolves to the same values as code.

/// Hurst channel defaults
pub mod hurst {
    /// Closed candles in the channel window
    pub const PERIODS: usize = 25;

    /// Sigma multiple for the upper band
    pub const UPPER_DEVIATION_FACTOR: f64 = 2.0;

    /// Sigma multiple for the lower band
    pub const LOWER_DEVIATION_FACTOR: f64 = 2.0;
}

/// EMA trend defaults
pub mod ema {
    /// Closed candles in the EMA window
    pub const PERIODS: usize = 30;

    /// Relative change below which the slope is flat
    pub const SLOPE_DEAD_BAND: f64 = 1e-4;
}

/// Signal rule defaults
pub mod signals {
    /// Minimum time between two entries (milliseconds)
    pub const MIN_ENTRY_TIME_GAP_MS: u64 = 2 * 60 * 60 * 1_000;

    /// Minimum age of the first entry before the second (milliseconds)
    pub const MIN_FIRST_ENTRY_DURATION_MS: u64 = 60 * 60 * 1_000;

    /// Drawdown from the peak that fires the trailing stop
    pub const TRAILING_STOP: f64 = 0.02;

    /// Delay after the first entry before the trailing stop arms (milliseconds)
    pub const TRAILING_STOP_DELAY_MS: u64 = 5 * 60 * 1_000;

    pub const EXIT_TRIGGER_FACTOR: f64 = 1.001;
    pub const RETURN_TRIGGER_FACTOR: f64 = 0.999;

    /// Upper-band confirmation windows (milliseconds)
    pub const EXIT_CONFIRM_MS: u64 = 900_000;
    pub const RETURN_CONFIRM_MS: u64 = 900_000;
}

/// Live stream defaults
pub mod stream {
    /// How far behind the newest tick a late tick may arrive (milliseconds)
    pub const STALENESS_TOLERANCE_MS: u64 = 1_000;

    /// Tick channel capacity per instance
    pub const TICK_BUFFER: usize = 1_024;
}

/// Position lifecycle defaults
pub mod position {
    /// Time in `closing` after which the position is flagged overdue (milliseconds)
    pub const CLOSE_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

    pub const QUOTE_CURRENCY: &str = "USDT";
}

/// Signal dispatcher defaults
pub mod dispatcher {
    /// Broker attempts for an exit before raising a human-intervention alert
    pub const MAX_EXIT_ATTEMPTS: u32 = 5;

    /// Backoff before the second attempt (milliseconds)
    pub const INITIAL_BACKOFF_MS: u64 = 500;

    /// Backoff ceiling (milliseconds)
    pub const MAX_BACKOFF_MS: u64 = 30_000;

    /// Attempts for a persistence write on transient errors
    pub const PERSISTENCE_ATTEMPTS: u32 = 3;

    /// Dispatch queue capacity per instance
    pub const QUEUE_SIZE: usize = 256;
}
