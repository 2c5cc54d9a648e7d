//! Two-phase upper-band exit state machine
//!
//! ## Purpose
//!
//! Closes a position only after price has both stayed above
//! `upper_band · exit_trigger_factor` for `exit_confirm_ms` and then stayed
//! below `upper_band · return_trigger_factor` for `return_confirm_ms`. A single
//! spike through the band, or a brief dip back under it, never exits.
//!
//! ## Architecture Role
//!
//! ```text
//! idle ──high ≥ trigger──▶ exit_counting ──held ≥ exit_confirm──▶ waiting_for_return
//!  ▲                          │ high < trigger                        │ low ≤ return
//!  └──────────────────────────┘                                       ▼
//!  ◀──────── exit upperBandReturn ── held ≥ return_confirm ── return_counting
//!                                                 low > return ──▶ waiting_for_return
//! ```
//!
//! [`step`] is a pure function of the current state, the tick extremes and the
//! stream time, so replays and tests drive it without touching private state.
//! At most one transition happens per call.

use config::SignalsConfig;
use serde::{Deserialize, Serialize};
use types::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpperBandPhase {
    #[default]
    Idle,
    ExitCounting,
    WaitingForReturn,
    ReturnCounting,
}

impl UpperBandPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            UpperBandPhase::Idle => "idle",
            UpperBandPhase::ExitCounting => "exit_counting",
            UpperBandPhase::WaitingForReturn => "waiting_for_return",
            UpperBandPhase::ReturnCounting => "return_counting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UpperBandState {
    pub current_state: UpperBandPhase,
    pub state_start_time: Option<TimestampMs>,
    /// Band the thresholds are measured against; refreshed while non-idle
    pub associated_upper_band: Option<f64>,
}

impl UpperBandState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.current_state == UpperBandPhase::Idle
    }

    fn enter(phase: UpperBandPhase, now: TimestampMs, band: f64) -> Self {
        Self {
            current_state: phase,
            state_start_time: Some(now),
            associated_upper_band: Some(band),
        }
    }

    fn elapsed(&self, now: TimestampMs) -> u64 {
        now.saturating_sub(self.state_start_time.unwrap_or(now))
    }
}

/// Thresholds and confirmation windows
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpperBandParams {
    pub exit_trigger_factor: f64,
    pub return_trigger_factor: f64,
    pub exit_confirm_ms: u64,
    pub return_confirm_ms: u64,
}

impl From<&SignalsConfig> for UpperBandParams {
    fn from(config: &SignalsConfig) -> Self {
        Self {
            exit_trigger_factor: config.exit_trigger_factor,
            return_trigger_factor: config.return_trigger_factor,
            exit_confirm_ms: config.exit_confirm_ms,
            return_confirm_ms: config.return_confirm_ms,
        }
    }
}

/// Result of feeding one tick to the machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpperBandStep {
    pub state: UpperBandState,
    /// Return confirmed; emit `exit/upperBandReturn`
    pub exit: bool,
}

impl UpperBandStep {
    pub fn transitioned_from(&self, previous: &UpperBandState) -> bool {
        self.state.current_state != previous.current_state || self.exit
    }
}

/// Advance the machine by one tick
///
/// `upper_band` is the current channel band; it replaces the associated band
/// whenever the machine is not idle.
pub fn step(
    state: &UpperBandState,
    params: &UpperBandParams,
    upper_band: f64,
    high: f64,
    low: f64,
    now: TimestampMs,
) -> UpperBandStep {
    let exit_level = upper_band * params.exit_trigger_factor;
    let return_level = upper_band * params.return_trigger_factor;

    let mut current = *state;
    if !current.is_idle() {
        current.associated_upper_band = Some(upper_band);
    }

    let stay = UpperBandStep {
        state: current,
        exit: false,
    };
    let move_to = |phase: UpperBandPhase| UpperBandStep {
        state: UpperBandState::enter(phase, now, upper_band),
        exit: false,
    };

    match current.current_state {
        UpperBandPhase::Idle => {
            if high >= exit_level {
                move_to(UpperBandPhase::ExitCounting)
            } else {
                stay
            }
        }
        UpperBandPhase::ExitCounting => {
            if high < exit_level {
                UpperBandStep {
                    state: UpperBandState::idle(),
                    exit: false,
                }
            } else if current.elapsed(now) >= params.exit_confirm_ms {
                move_to(UpperBandPhase::WaitingForReturn)
            } else {
                stay
            }
        }
        UpperBandPhase::WaitingForReturn => {
            if low <= return_level {
                move_to(UpperBandPhase::ReturnCounting)
            } else {
                stay
            }
        }
        UpperBandPhase::ReturnCounting => {
            if low > return_level {
                move_to(UpperBandPhase::WaitingForReturn)
            } else if current.elapsed(now) >= params.return_confirm_ms {
                UpperBandStep {
                    state: UpperBandState::idle(),
                    exit: true,
                }
            } else {
                stay
            }
        }
    }
}
