//! Technical indicators for signal generation
//!
//! Both indicators consume closed candles only. Between closes their last
//! snapshot is held constant and read by the signal detector on every tick.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use types::{Candle, TimestampMs};

/// Smallest chunk used by the rescaled-range regression
const MIN_RS_CHUNK: usize = 8;

/// Hurst channel snapshot
///
/// Invariants: `lower_band ≤ mid_band ≤ upper_band`, `0 ≤ hurst_exponent ≤ 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HurstChannel {
    pub upper_band: f64,
    pub lower_band: f64,
    pub mid_band: f64,
    pub hurst_exponent: f64,
    pub computed_at: TimestampMs,
    pub source_candle_close_time: TimestampMs,
}

impl HurstChannel {
    /// Channel with explicit bands, used when replaying a known state
    pub fn fixed(lower_band: f64, mid_band: f64, upper_band: f64) -> Self {
        Self {
            upper_band,
            lower_band,
            mid_band,
            hurst_exponent: 0.5,
            computed_at: 0,
            source_candle_close_time: 0,
        }
    }
}

/// Rolling Hurst channel over the last `periods` closes
#[derive(Debug, Clone)]
pub struct HurstChannelIndicator {
    periods: usize,
    upper_deviation_factor: f64,
    lower_deviation_factor: f64,
    closes: VecDeque<f64>,
    current: Option<HurstChannel>,
}

impl HurstChannelIndicator {
    pub fn new(periods: usize, upper_deviation_factor: f64, lower_deviation_factor: f64) -> Self {
        Self {
            periods,
            upper_deviation_factor,
            lower_deviation_factor,
            closes: VecDeque::with_capacity(periods),
            current: None,
        }
    }

    /// Add a closed candle and recompute the channel once the window is full
    pub fn update(&mut self, candle: &Candle, now: TimestampMs) -> Option<HurstChannel> {
        self.closes.push_back(candle.close);
        if self.closes.len() > self.periods {
            self.closes.pop_front();
        }

        if self.closes.len() == self.periods {
            self.current = self.compute(candle.close_time, now);
        }
        self.current
    }

    pub fn current(&self) -> Option<HurstChannel> {
        self.current
    }

    /// Check if indicator is ready
    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    fn compute(&self, source_candle_close_time: TimestampMs, now: TimestampMs) -> Option<HurstChannel> {
        let closes: Vec<f64> = self.closes.iter().copied().collect();
        let (mid_band, sigma) = mean_and_std_dev(&closes)?;
        Some(HurstChannel {
            upper_band: mid_band + self.upper_deviation_factor * sigma,
            lower_band: mid_band - self.lower_deviation_factor * sigma,
            mid_band,
            hurst_exponent: hurst_exponent(&closes),
            computed_at: now,
            source_candle_close_time,
        })
    }
}

/// Mean and population standard deviation
fn mean_and_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    (mean.is_finite() && std_dev.is_finite()).then_some((mean, std_dev))
}

/// Hurst exponent of a close series via rescaled-range analysis
///
/// Works on close-to-close log returns. With enough data the exponent is the
/// slope of `ln(R/S)` against `ln(n)` over several chunk sizes; otherwise it
/// falls back to `ln(R/S) / ln(n)` on the whole series. Degenerate input
/// (flat prices, too few points) yields 0.5. Always clamped to `[0, 1]`.
pub fn hurst_exponent(closes: &[f64]) -> f64 {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 4 {
        return 0.5;
    }

    let mut points = Vec::new();
    let mut chunks = 1;
    while returns.len() / chunks >= MIN_RS_CHUNK {
        let size = returns.len() / chunks;
        if let Some(rs) = average_rescaled_range(&returns, size) {
            points.push(((size as f64).ln(), rs.ln()));
        }
        chunks += 1;
    }

    let estimate = if points.len() >= 2 {
        regression_slope(&points)
    } else {
        rescaled_range(&returns).map(|rs| rs.ln() / (returns.len() as f64).ln())
    };

    match estimate {
        Some(h) if h.is_finite() => h.clamp(0.0, 1.0),
        _ => 0.5,
    }
}

/// Mean R/S over non-overlapping chunks of `size`
fn average_rescaled_range(returns: &[f64], size: usize) -> Option<f64> {
    let values: Vec<f64> = returns
        .chunks_exact(size)
        .filter_map(rescaled_range)
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn rescaled_range(series: &[f64]) -> Option<f64> {
    let (mean, std_dev) = mean_and_std_dev(series)?;
    if std_dev < 1e-12 {
        return None;
    }

    let mut cumsum = 0.0;
    let mut min_val = 0.0_f64;
    let mut max_val = 0.0_f64;
    for r in series {
        cumsum += r - mean;
        min_val = min_val.min(cumsum);
        max_val = max_val.max(cumsum);
    }

    let rs = (max_val - min_val) / std_dev;
    (rs > 0.0).then_some(rs)
}

fn regression_slope(points: &[(f64, f64)]) -> Option<f64> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let cov: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let var: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    (var > 0.0).then(|| cov / var)
}

/// EMA slope classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaSlope {
    Up,
    Down,
    Flat,
}

impl EmaSlope {
    pub fn as_str(self) -> &'static str {
        match self {
            EmaSlope::Up => "up",
            EmaSlope::Down => "down",
            EmaSlope::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaTrend {
    pub value: f64,
    pub slope: EmaSlope,
    pub computed_at: TimestampMs,
}

/// Exponential moving average of closes, seeded with the SMA of the first window
#[derive(Debug, Clone)]
pub struct EmaTrendIndicator {
    periods: usize,
    alpha: f64,
    dead_band: f64,
    seed: Vec<f64>,
    current: Option<EmaTrend>,
}

impl EmaTrendIndicator {
    pub fn new(periods: usize, dead_band: f64) -> Self {
        Self {
            periods,
            alpha: 2.0 / (periods as f64 + 1.0),
            dead_band,
            seed: Vec::with_capacity(periods),
            current: None,
        }
    }

    /// Add a closed candle and return the updated trend once seeded
    pub fn update(&mut self, candle: &Candle, now: TimestampMs) -> Option<EmaTrend> {
        let close = candle.close;
        match self.current {
            None => {
                self.seed.push(close);
                if self.seed.len() == self.periods {
                    let sma = self.seed.iter().sum::<f64>() / self.periods as f64;
                    self.seed.clear();
                    self.current = Some(EmaTrend {
                        value: sma,
                        slope: EmaSlope::Flat,
                        computed_at: now,
                    });
                }
            }
            Some(previous) => {
                let value = self.alpha * close + (1.0 - self.alpha) * previous.value;
                self.current = Some(EmaTrend {
                    value,
                    slope: classify_slope(previous.value, value, self.dead_band),
                    computed_at: now,
                });
            }
        }
        self.current
    }

    pub fn current(&self) -> Option<EmaTrend> {
        self.current
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }
}

/// Direction of `current − previous`, flat inside the relative dead-band
pub fn classify_slope(previous: f64, current: f64, dead_band: f64) -> EmaSlope {
    let delta = current - previous;
    if current == 0.0 || (delta / current).abs() < dead_band {
        EmaSlope::Flat
    } else if delta > 0.0 {
        EmaSlope::Up
    } else {
        EmaSlope::Down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use types::CandleInterval;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let interval = CandleInterval::FIFTEEN_MINUTES;
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::flat(interval, i as u64 * interval.as_ms(), c))
            .collect()
    }

    #[test]
    fn test_channel_bands() {
        // Population std dev of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2
        let mut indicator = HurstChannelIndicator::new(8, 2.0, 2.0);
        let series = candles(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        for c in &series[..7] {
            assert!(indicator.update(c, 0).is_none());
        }
        let channel = indicator.update(&series[7], 42).unwrap();
        assert_eq!(channel.mid_band, 5.0);
        assert_eq!(channel.upper_band, 9.0);
        assert_eq!(channel.lower_band, 1.0);
        assert_eq!(channel.computed_at, 42);
        assert_eq!(channel.source_candle_close_time, series[7].close_time);
    }

    #[test]
    fn test_channel_rolls_window() {
        let mut indicator = HurstChannelIndicator::new(4, 1.0, 1.0);
        for c in candles(&[1.0, 1.0, 1.0, 1.0, 5.0]) {
            indicator.update(&c, 0);
        }
        let channel = indicator.current().unwrap();
        assert_eq!(channel.mid_band, 2.0);
    }

    #[test]
    fn test_hurst_degenerate_inputs() {
        assert_eq!(hurst_exponent(&[]), 0.5);
        assert_eq!(hurst_exponent(&[100.0; 30]), 0.5);
    }

    #[test]
    fn test_hurst_persistent_vs_alternating() {
        // Returns that keep growing are persistent
        let mut persistent = vec![100.0];
        for i in 0..60 {
            let last = *persistent.last().unwrap();
            persistent.push(last * (0.001 * i as f64).exp());
        }
        // Strict alternation mean-reverts
        let alternating: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        assert!(hurst_exponent(&persistent) > 0.7);
        assert!(hurst_exponent(&alternating) < 0.3);
    }

    #[test]
    fn test_ema_seed_and_slope() {
        let mut ema = EmaTrendIndicator::new(3, 1e-4);
        let series = candles(&[10.0, 11.0, 12.0, 14.0, 14.0, 10.0]);
        assert!(ema.update(&series[0], 0).is_none());
        assert!(ema.update(&series[1], 0).is_none());

        let seeded = ema.update(&series[2], 0).unwrap();
        assert_eq!(seeded.value, 11.0);
        assert_eq!(seeded.slope, EmaSlope::Flat);

        // alpha = 0.5
        let up = ema.update(&series[3], 0).unwrap();
        assert_eq!(up.value, 12.5);
        assert_eq!(up.slope, EmaSlope::Up);

        // 0.5·10 + 0.5·12.5
        let down = ema.update(&series[5], 0).unwrap();
        assert_eq!(down.value, 11.25);
        assert_eq!(down.slope, EmaSlope::Down);
    }

    #[test]
    fn test_slope_dead_band() {
        assert_eq!(classify_slope(100.0, 100.005, 1e-4), EmaSlope::Flat);
        assert_eq!(classify_slope(100.0, 100.02, 1e-4), EmaSlope::Up);
        assert_eq!(classify_slope(100.0, 99.98, 1e-4), EmaSlope::Down);
    }

    proptest! {
        #[test]
        fn prop_channel_invariants(closes in prop::collection::vec(1.0f64..10_000.0, 25)) {
            let mut indicator = HurstChannelIndicator::new(25, 2.0, 2.0);
            let mut last = None;
            for c in candles(&closes) {
                last = indicator.update(&c, 0);
            }
            let channel = last.unwrap();
            prop_assert!(channel.lower_band <= channel.mid_band);
            prop_assert!(channel.mid_band <= channel.upper_band);
            prop_assert!((0.0..=1.0).contains(&channel.hurst_exponent));
        }
    }
}
