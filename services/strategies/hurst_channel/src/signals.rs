//! Signal detection
//!
//! [`detect`] is a pure function of the latest tick, the indicator snapshots,
//! the position and the exit state machines. It never mutates anything; the
//! engine commits the returned [`Detection`].
//!
//! Precedence on a single tick:
//! 1. exits are evaluated before entries, and a tick that exits never enters
//! 2. when both exit paths fire, the trailing stop wins
//! 3. at most one entry, always the lowest applicable rank

use crate::indicators::{EmaSlope, EmaTrend, HurstChannel};
use crate::trailing_stop::{self, TrailingState, TrailingStopParams};
use crate::upper_band::{self, UpperBandParams, UpperBandState};
use config::SignalsConfig;
use types::{EntryType, ExitReason, Position, PositionStatus, Tick, TimestampMs};

/// Everything the detector reads for one tick
#[derive(Debug, Clone, Copy)]
pub struct DetectorInput<'a> {
    pub tick: &'a Tick,
    pub channel: Option<&'a HurstChannel>,
    pub ema: Option<&'a EmaTrend>,
    /// Open position, if any
    pub position: Option<&'a Position>,
    pub upper_band: &'a UpperBandState,
    /// Time of the most recent entry of any position on this instance
    pub last_entry_time: Option<TimestampMs>,
    pub config: &'a SignalsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitCandidate {
    pub reason: ExitReason,
    pub price: f64,
    pub peak_price: Option<f64>,
    pub stop_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryCandidate {
    pub entry_type: EntryType,
    pub price: f64,
}

/// Why a lower-band touch did not produce an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBlock {
    ChannelUnavailable,
    TrendUnavailable,
    TrendDown,
    EntryGap,
    FirstEntryTooRecent,
    NoMidReclaim,
    MaxEntries,
    PositionClosing,
}

impl EntryBlock {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryBlock::ChannelUnavailable => "hurst channel unavailable",
            EntryBlock::TrendUnavailable => "ema trend unavailable",
            EntryBlock::TrendDown => "ema trend slopes down",
            EntryBlock::EntryGap => "min entry time gap not elapsed",
            EntryBlock::FirstEntryTooRecent => "min first entry duration not elapsed",
            EntryBlock::NoMidReclaim => "no mid band reclaim since last entry",
            EntryBlock::MaxEntries => "all entries used",
            EntryBlock::PositionClosing => "position is closing",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub exit: Option<ExitCandidate>,
    pub entry: Option<EntryCandidate>,
    pub entry_block: Option<EntryBlock>,
    /// Next upper-band state
    pub upper_band: UpperBandState,
    /// Next trailing-stop state; `None` without an active position
    pub trailing: Option<TrailingState>,
    /// Trailing stop armed on this tick
    pub trailing_armed: bool,
    /// Mid reclaim flag of the active position after this tick
    pub mid_reclaimed: bool,
}

/// Evaluate one tick
pub fn detect(input: &DetectorInput<'_>) -> Detection {
    let tick = input.tick;
    let active = input.position.filter(|p| p.status == PositionStatus::Active);

    let mut detection = Detection {
        exit: None,
        entry: None,
        entry_block: None,
        upper_band: if active.is_some() {
            *input.upper_band
        } else {
            UpperBandState::idle()
        },
        trailing: None,
        trailing_armed: false,
        mid_reclaimed: active.map(|p| p.mid_reclaimed).unwrap_or(false),
    };

    if let Some(position) = active {
        if evaluate_exits(input, position, &mut detection) {
            return detection;
        }
        if let Some(channel) = input.channel {
            if tick.low > channel.mid_band {
                detection.mid_reclaimed = true;
            }
        }
    }

    evaluate_entry(input, active, &mut detection);
    detection
}

/// Run both exit paths; true when an exit fired
fn evaluate_exits(input: &DetectorInput<'_>, position: &Position, detection: &mut Detection) -> bool {
    let tick = input.tick;
    let now = tick.timestamp;

    let trailing = trailing_stop::step(
        &TrailingStopParams::from(input.config),
        position.first_entry_time,
        &TrailingState {
            peak_price: position.peak_price_since_armed,
            armed_at: position.trailing_armed_at,
        },
        tick.high,
        tick.low,
        now,
    );
    detection.trailing = Some(trailing.state);
    detection.trailing_armed = trailing.armed_now;

    let band_exit = match input.channel {
        Some(channel) => {
            let step = upper_band::step(
                input.upper_band,
                &UpperBandParams::from(input.config),
                channel.upper_band,
                tick.high,
                tick.low,
                now,
            );
            detection.upper_band = step.state;
            step.exit
        }
        None => false,
    };

    let reason = if trailing.fired {
        ExitReason::TrailingStop
    } else if band_exit {
        ExitReason::UpperBandReturn
    } else {
        return false;
    };

    detection.exit = Some(ExitCandidate {
        reason,
        price: tick.price,
        peak_price: trailing.state.peak_price,
        stop_price: trailing.stop_price,
    });
    detection.upper_band = UpperBandState::idle();
    true
}

fn evaluate_entry(input: &DetectorInput<'_>, active: Option<&Position>, detection: &mut Detection) {
    let tick = input.tick;
    let config = input.config;

    let Some(channel) = input.channel else {
        detection.entry_block = Some(EntryBlock::ChannelUnavailable);
        return;
    };
    if tick.low > channel.lower_band {
        return;
    }

    let block = |detection: &mut Detection, reason: EntryBlock| {
        detection.entry_block = Some(reason);
    };

    if input.position.is_some() && active.is_none() {
        return block(detection, EntryBlock::PositionClosing);
    }
    if config.check_ema_trend && input.ema.is_none() {
        return block(detection, EntryBlock::TrendUnavailable);
    }
    if let Some(last) = input.last_entry_time {
        if tick.timestamp < last.saturating_add(config.min_entry_time_gap_ms) {
            return block(detection, EntryBlock::EntryGap);
        }
    }

    let entry_type = match active {
        None => {
            let trend_down = input.ema.map(|e| e.slope == EmaSlope::Down).unwrap_or(false);
            if config.check_ema_trend && trend_down {
                return block(detection, EntryBlock::TrendDown);
            }
            EntryType::First
        }
        Some(position) => {
            let Some(next) = position.next_entry_type() else {
                return block(detection, EntryBlock::MaxEntries);
            };
            if next == EntryType::Second
                && tick.timestamp
                    < position
                        .first_entry_time
                        .saturating_add(config.min_first_entry_duration_ms)
            {
                return block(detection, EntryBlock::FirstEntryTooRecent);
            }
            if !position.mid_reclaimed {
                return block(detection, EntryBlock::NoMidReclaim);
            }
            next
        }
    };

    detection.entry = Some(EntryCandidate {
        entry_type,
        price: tick.price,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upper_band::UpperBandPhase;
    use rust_decimal_macros::dec;
    use types::{Entry, PositionId, HOUR_MS, MINUTE_MS};

    const T0: u64 = 1_700_000_000_000;

    fn channel() -> HurstChannel {
        HurstChannel::fixed(100.0, 110.0, 120.0)
    }

    fn flat_trend() -> EmaTrend {
        EmaTrend {
            value: 110.0,
            slope: EmaSlope::Flat,
            computed_at: T0,
        }
    }

    fn tick(price: f64, ts: u64) -> Tick {
        Tick::new("BTCUSDT", price, ts)
    }

    fn position_at(price: f64, ts: u64) -> Position {
        Position::open(
            PositionId::new(1),
            "BTCUSDT",
            Entry {
                time: ts,
                price,
                entry_type: EntryType::First,
                allocation_fraction: dec!(0.10),
                quote_amount: dec!(100),
                base_amount: dec!(1),
            },
        )
    }

    struct Fixture {
        channel: HurstChannel,
        ema: EmaTrend,
        upper_band: UpperBandState,
        config: SignalsConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                channel: channel(),
                ema: flat_trend(),
                upper_band: UpperBandState::idle(),
                config: SignalsConfig::default(),
            }
        }

        fn detect(&self, tick: &Tick, position: Option<&Position>, last_entry: Option<u64>) -> Detection {
            detect(&DetectorInput {
                tick,
                channel: Some(&self.channel),
                ema: Some(&self.ema),
                position,
                upper_band: &self.upper_band,
                last_entry_time: last_entry,
                config: &self.config,
            })
        }
    }

    #[test]
    fn test_first_entry_on_lower_band_touch() {
        let f = Fixture::new();
        for price in [112.0, 108.0] {
            let d = f.detect(&tick(price, T0), None, None);
            assert_eq!(d.entry, None);
        }
        let touch = tick(101.0, T0 + 3).with_range(101.0, 99.8);
        let d = f.detect(&touch, None, None);
        assert_eq!(
            d.entry,
            Some(EntryCandidate {
                entry_type: EntryType::First,
                price: 101.0
            })
        );
    }

    #[test]
    fn test_first_entry_blocked_by_down_trend() {
        let mut f = Fixture::new();
        f.ema.slope = EmaSlope::Down;
        let d = f.detect(&tick(99.0, T0), None, None);
        assert_eq!(d.entry, None);
        assert_eq!(d.entry_block, Some(EntryBlock::TrendDown));

        f.config.check_ema_trend = false;
        assert!(f.detect(&tick(99.0, T0), None, None).entry.is_some());
    }

    #[test]
    fn test_no_second_entry_without_mid_reclaim() {
        let f = Fixture::new();
        let position = position_at(101.0, T0);
        let later = T0 + 3 * HOUR_MS;
        for price in [101.0, 102.0] {
            let d = f.detect(&tick(price, later), Some(&position), Some(T0));
            assert!(!d.mid_reclaimed);
        }
        let d = f.detect(&tick(99.0, later + 1), Some(&position), Some(T0));
        assert_eq!(d.entry, None);
        assert_eq!(d.entry_block, Some(EntryBlock::NoMidReclaim));
    }

    #[test]
    fn test_second_entry_after_mid_reclaim_at_default_gaps() {
        let f = Fixture::new();
        let mut position = position_at(101.0, T0);
        let later = T0 + 2 * HOUR_MS;

        let reclaim = f.detect(&tick(111.0, later), Some(&position), Some(T0));
        assert!(reclaim.mid_reclaimed);
        assert_eq!(reclaim.entry, None);
        position.mid_reclaimed = reclaim.mid_reclaimed;

        let d = f.detect(&tick(99.0, later + MINUTE_MS), Some(&position), Some(T0));
        assert_eq!(
            d.entry,
            Some(EntryCandidate {
                entry_type: EntryType::Second,
                price: 99.0
            })
        );
    }

    #[test]
    fn test_first_entry_duration_only_gates_second_entry() {
        let mut f = Fixture::new();
        f.config.min_first_entry_duration_ms = 6 * HOUR_MS;
        let mut position = position_at(101.0, T0);
        position.mid_reclaimed = true;

        let d = f.detect(&tick(99.0, T0 + 2 * HOUR_MS), Some(&position), Some(T0));
        assert_eq!(d.entry_block, Some(EntryBlock::FirstEntryTooRecent));

        position.entries.push(Entry {
            time: T0 + 2 * HOUR_MS,
            price: 99.0,
            entry_type: EntryType::Second,
            allocation_fraction: dec!(0.25),
            quote_amount: dec!(250),
            base_amount: dec!(2.5),
        });
        position.recompute_totals();
        let second_at = position.last_entry_time;

        let d = f.detect(&tick(98.0, T0 + 4 * HOUR_MS), Some(&position), Some(second_at));
        assert_eq!(
            d.entry,
            Some(EntryCandidate {
                entry_type: EntryType::Third,
                price: 98.0
            })
        );
    }

    #[test]
    fn test_entry_gap_applies() {
        let f = Fixture::new();
        let mut position = position_at(101.0, T0);
        position.mid_reclaimed = true;
        let d = f.detect(&tick(99.0, T0 + HOUR_MS + 1), Some(&position), Some(T0));
        assert_eq!(d.entry_block, Some(EntryBlock::EntryGap));
    }

    #[test]
    fn test_trailing_stop_wins_over_band_return() {
        let mut f = Fixture::new();
        f.config.return_confirm_ms = 0;
        f.upper_band = UpperBandState {
            current_state: UpperBandPhase::ReturnCounting,
            state_start_time: Some(T0),
            associated_upper_band: Some(120.0),
        };
        let mut position = position_at(100.0, T0 - HOUR_MS);
        position.peak_price_since_armed = Some(125.0);
        position.trailing_armed_at = Some(T0 - 30 * MINUTE_MS);

        let d = f.detect(&tick(115.0, T0 + MINUTE_MS), Some(&position), None);
        let exit = d.exit.unwrap();
        assert_eq!(exit.reason, ExitReason::TrailingStop);
        assert_eq!(exit.price, 115.0);
        assert!(d.upper_band.is_idle());
        assert_eq!(d.entry, None);
    }

    #[test]
    fn test_exit_suppresses_entry() {
        let mut f = Fixture::new();
        f.config.min_entry_time_gap_ms = 0;
        f.config.min_first_entry_duration_ms = 0;
        let mut position = position_at(100.0, T0);
        position.mid_reclaimed = true;
        position.peak_price_since_armed = Some(110.0);
        position.trailing_armed_at = Some(T0);

        // Low touches the lower band and the trailing stop on the same tick
        let d = f.detect(&tick(99.0, T0 + HOUR_MS), Some(&position), Some(T0));
        assert!(d.exit.is_some());
        assert_eq!(d.entry, None);
    }

    #[test]
    fn test_closing_position_blocks_everything() {
        let f = Fixture::new();
        let mut position = position_at(100.0, T0);
        position.status = PositionStatus::Closing;
        let d = f.detect(&tick(99.0, T0 + 5 * HOUR_MS), Some(&position), Some(T0));
        assert_eq!(d.exit, None);
        assert_eq!(d.entry, None);
        assert_eq!(d.entry_block, Some(EntryBlock::PositionClosing));
        assert!(d.upper_band.is_idle());
    }
}
