//! Candle aggregation from live ticks
//!
//! One [`CandleAggregator`] per interval. Each keeps a single forming candle and
//! emits closed candles in strictly increasing `close_time` order. Periods
//! without ticks are filled with flat zero-volume candles at the previous
//! close, so downstream windows never see a gap.

use crate::error::{MarketDataError, Result};
use types::{Candle, CandleInterval, Tick, TimestampMs};

/// Where a tick landed relative to the aggregator state
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Folded into the forming candle, no period closed
    Updated,
    /// One or more periods closed, oldest first
    Closed(Vec<Candle>),
    /// Belongs to a period that is already closed
    Stale,
}

#[derive(Debug, Clone)]
pub struct CandleAggregator {
    interval: CandleInterval,
    forming: Option<Candle>,
    last_closed: Option<Candle>,
}

impl CandleAggregator {
    pub fn new(interval: CandleInterval) -> Self {
        Self {
            interval,
            forming: None,
            last_closed: None,
        }
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    pub fn forming(&self) -> Option<&Candle> {
        self.forming.as_ref()
    }

    pub fn last_closed(&self) -> Option<&Candle> {
        self.last_closed.as_ref()
    }

    /// Seed with historical closed candles, oldest first
    ///
    /// Only the newest candle is kept; it anchors gap filling for the first
    /// live tick. Candles must be closed, aligned and strictly increasing.
    pub fn bootstrap(&mut self, history: &[Candle]) -> Result<()> {
        let mut previous: Option<&Candle> = None;
        for candle in history {
            if !candle.is_closed {
                return Err(bad_history("history contains a forming candle"));
            }
            if candle.close_time != candle.open_time + self.interval.as_ms()
                || self.interval.period_start(candle.open_time) != candle.open_time
            {
                return Err(bad_history(&format!(
                    "candle at {} does not match interval {}",
                    candle.open_time, self.interval
                )));
            }
            if let Some(prev) = previous {
                if candle.open_time < prev.close_time {
                    return Err(bad_history("history is not strictly increasing"));
                }
            }
            previous = Some(candle);
        }
        self.last_closed = history.last().cloned();
        self.forming = None;
        Ok(())
    }

    /// Fold an in-order tick into the aggregator
    pub fn on_tick(&mut self, tick: &Tick) -> Aggregation {
        let period_start = self.interval.period_start(tick.timestamp);

        if let Some(last) = &self.last_closed {
            if period_start < last.close_time {
                return Aggregation::Stale;
            }
        }

        match self.forming.take() {
            Some(mut forming) if forming.contains(tick.timestamp) => {
                forming.absorb(tick);
                self.forming = Some(forming);
                Aggregation::Updated
            }
            Some(forming) if tick.timestamp < forming.open_time => {
                self.forming = Some(forming);
                Aggregation::Stale
            }
            Some(forming) => {
                let finalized = forming.finalize();
                let mut closed = self.gap_candles(&finalized, period_start);
                closed.insert(0, finalized);
                self.last_closed = closed.last().cloned();
                self.forming = Some(Candle::open_from_tick(self.interval, tick));
                Aggregation::Closed(closed)
            }
            None => {
                self.forming = Some(Candle::open_from_tick(self.interval, tick));
                let closed = match &self.last_closed {
                    Some(last) => self.gap_candles(last, period_start),
                    None => Vec::new(),
                };
                if closed.is_empty() {
                    Aggregation::Updated
                } else {
                    self.last_closed = closed.last().cloned();
                    Aggregation::Closed(closed)
                }
            }
        }
    }

    /// Fold a late tick into the forming candle's extremes and volume
    ///
    /// Returns false when the tick does not belong to the forming period.
    pub fn on_late_tick(&mut self, tick: &Tick) -> bool {
        match self.forming.as_mut() {
            Some(forming) if forming.contains(tick.timestamp) => {
                forming.absorb_late(tick);
                true
            }
            _ => false,
        }
    }

    /// Flat candles covering the periods between `after` and `until`
    fn gap_candles(&self, after: &Candle, until: TimestampMs) -> Vec<Candle> {
        let mut gap = Vec::new();
        let mut open_time = after.close_time;
        while open_time < until {
            gap.push(Candle::flat(self.interval, open_time, after.close));
            open_time += self.interval.as_ms();
        }
        gap
    }
}

fn bad_history(message: &str) -> crate::error::StrategyError {
    MarketDataError::Request {
        message: message.to_string(),
    }
    .into()
}
