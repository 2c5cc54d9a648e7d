//! Trailing-stop controller
//!
//! Arms once `trailing_stop_delay_ms` has passed since the first entry, then
//! tracks the highest tick high and fires when a tick low falls to
//! `peak · (1 − trailing_stop)`. Armed state lives on the position
//! (`peak_price_since_armed`, `trailing_armed_at`) so it survives restarts.

use config::SignalsConfig;
use types::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStopParams {
    pub enabled: bool,
    /// Fractional drawdown, e.g. `0.02`
    pub trailing_stop: f64,
    pub delay_ms: u64,
}

impl From<&SignalsConfig> for TrailingStopParams {
    fn from(config: &SignalsConfig) -> Self {
        Self {
            enabled: config.enable_trailing_stop,
            trailing_stop: config.trailing_stop,
            delay_ms: config.trailing_stop_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrailingState {
    pub peak_price: Option<f64>,
    pub armed_at: Option<TimestampMs>,
}

impl TrailingState {
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStep {
    pub state: TrailingState,
    pub stop_price: Option<f64>,
    pub fired: bool,
    /// Armed on this tick
    pub armed_now: bool,
}

/// Feed one tick to the controller
pub fn step(
    params: &TrailingStopParams,
    first_entry_time: TimestampMs,
    state: &TrailingState,
    high: f64,
    low: f64,
    now: TimestampMs,
) -> TrailingStep {
    let mut next = *state;
    let mut armed_now = false;

    if !params.enabled {
        return TrailingStep {
            state: next,
            stop_price: None,
            fired: false,
            armed_now,
        };
    }

    if !next.is_armed() {
        if now < first_entry_time.saturating_add(params.delay_ms) {
            return TrailingStep {
                state: next,
                stop_price: None,
                fired: false,
                armed_now,
            };
        }
        next.armed_at = Some(now);
        armed_now = true;
    }

    let peak = next.peak_price.map_or(high, |p| p.max(high));
    next.peak_price = Some(peak);
    let stop_price = peak * (1.0 - params.trailing_stop);

    TrailingStep {
        state: next,
        stop_price: Some(stop_price),
        fired: low <= stop_price,
        armed_now,
    }
}
