//! End-to-end signal scenarios on a bootstrapped engine
//!
//! The channel is bootstrapped to lower=100, mid=110, upper=120 on a 4h
//! interval so no channel candle closes while a scenario runs. Broker fills
//! are synthesised at the signal price, as in test mode.

use config::InstanceConfig;
use hurst_channel::{
    DispatchOutcome, DispatchRequest, InstanceEngine, InstanceStatus, UpperBandPhase,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use types::{
    price_to_decimal, Candle, CandleInterval, EntryType, ExitReason, InstanceId, OrderFill,
    PositionStatus, SignalKind, Tick, HOUR_MS, MINUTE_MS, SECOND_MS,
};

/// Aligned to a 4h boundary
const T0: u64 = 1_699_992_000_000;

fn config(trailing_stop: bool) -> InstanceConfig {
    let mut config = InstanceConfig::new("BTCUSDT", dec!(1000));
    config.hurst.interval = CandleInterval::FOUR_HOURS;
    config.signals.enable_trailing_stop = trailing_stop;
    config.test_mode = true;
    config
}

/// 25 closes with mean 110 and σ 5
fn channel_history(interval: CandleInterval) -> Vec<Candle> {
    let a = (625.0f64 / 24.0).sqrt();
    let mut closes: Vec<f64> = (0..24)
        .map(|i| if i % 2 == 0 { 110.0 + a } else { 110.0 - a })
        .collect();
    closes.push(110.0);
    let step = interval.as_ms();
    let start = T0 - step * closes.len() as u64;
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| Candle::flat(interval, start + i as u64 * step, *close))
        .collect()
}

fn ema_history() -> Vec<Candle> {
    (0..30)
        .map(|i| Candle::flat(CandleInterval::ONE_HOUR, T0 - (30 - i) * HOUR_MS, 110.0))
        .collect()
}

fn engine(config: InstanceConfig) -> InstanceEngine {
    let mut engine = InstanceEngine::new(InstanceId::new(1), config.clone(), T0);
    engine
        .bootstrap(&channel_history(config.hurst.interval), &ema_history(), T0)
        .unwrap();
    engine
}

fn tick(price: f64, ts: u64) -> Tick {
    Tick::new("BTCUSDT", price, ts)
}

/// Fill every queued order at its reference price
fn settle(engine: &mut InstanceEngine, now: u64) {
    for request in engine.take_requests() {
        let outcome = match request {
            DispatchRequest::Entry {
                signal,
                position,
                entry_type,
                quote_amount,
            } => {
                let price = price_to_decimal(signal.price).unwrap();
                DispatchOutcome::EntryFilled {
                    signal_id: signal.id,
                    position_id: position.position_id,
                    entry_type,
                    fill: OrderFill {
                        order_id: format!("test-{}", signal.client_order_id()),
                        avg_fill_price: signal.price,
                        filled_base: quote_amount / price,
                        filled_quote: quote_amount,
                    },
                }
            }
            DispatchRequest::Close {
                signal,
                position,
                reference_price,
            } => {
                let exit_price = signal.map_or(reference_price, |s| s.price);
                DispatchOutcome::ExitFilled {
                    position_id: position.position_id,
                    fill: OrderFill {
                        order_id: "test-close".to_string(),
                        avg_fill_price: exit_price,
                        filled_base: position.total_base,
                        filled_quote: position.total_base * price_to_decimal(exit_price).unwrap(),
                    },
                }
            }
            _ => continue,
        };
        engine.on_dispatch_outcome(outcome, now).unwrap();
    }
}

/// Scenario 1 on a fresh engine; returns the engine with one settled entry
fn first_entry(config: InstanceConfig) -> InstanceEngine {
    let mut engine = engine(config);
    assert!(engine.on_tick(&tick(112.0, T0 + MINUTE_MS)).unwrap().is_empty());
    assert!(engine.on_tick(&tick(108.0, T0 + 2 * MINUTE_MS)).unwrap().is_empty());

    let touch = tick(101.0, T0 + 3 * MINUTE_MS).with_range(101.0, 99.8);
    let signals = engine.on_tick(&touch).unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].kind, SignalKind::Entry(EntryType::First));
    assert_eq!(signals[0].price, 101.0);
    assert_eq!(signals[0].allocation_fraction, Some(dec!(0.10)));
    settle(&mut engine, T0 + 3 * MINUTE_MS);
    assert_eq!(engine.position().unwrap().status, PositionStatus::Active);
    engine
}

#[test]
fn test_first_entry_on_lower_band_touch() {
    let engine = first_entry(config(false));
    let position = engine.position().unwrap();
    assert_eq!(position.entries.len(), 1);
    assert_eq!(position.total_quote, dec!(100));
    assert_eq!(engine.ledger().locked, dec!(100));
    assert_eq!(engine.ledger().available, dec!(900));
}

#[test]
fn test_no_second_entry_without_mid_reclaim() {
    let mut engine = first_entry(config(false));
    let later = T0 + 3 * HOUR_MS;
    for (i, price) in [101.0, 102.0, 99.0].into_iter().enumerate() {
        let signals = engine.on_tick(&tick(price, later + i as u64 * MINUTE_MS)).unwrap();
        assert!(signals.is_empty(), "unexpected signal at {price}");
    }
    assert_eq!(engine.position().unwrap().entries.len(), 1);
    assert!(!engine.position().unwrap().mid_reclaimed);
}

#[test]
fn test_second_entry_after_mid_reclaim() {
    let mut engine = first_entry(config(false));
    let after_gaps = T0 + 3 * MINUTE_MS + 2 * HOUR_MS;

    assert!(engine.on_tick(&tick(111.0, after_gaps)).unwrap().is_empty());
    assert!(engine.position().unwrap().mid_reclaimed);

    let signals = engine.on_tick(&tick(99.0, after_gaps + MINUTE_MS)).unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].kind, SignalKind::Entry(EntryType::Second));
    assert_eq!(signals[0].price, 99.0);
    assert_eq!(signals[0].allocation_fraction, Some(dec!(0.25)));
    settle(&mut engine, after_gaps + MINUTE_MS);

    let position = engine.position().unwrap();
    assert_eq!(position.entries.len(), 2);
    assert_eq!(position.total_quote, dec!(350));
    assert!(!position.mid_reclaimed);
    // (101·100 + 99·250) / 350
    let avg = position.entry_avg_price().unwrap();
    assert!((avg - 99.571_428_571).abs() < 1e-6);
}

/// Active position whose upper-band machine has reached waiting_for_return
fn waiting_for_return() -> (InstanceEngine, u64) {
    let mut engine = first_entry(config(false));
    let start = T0 + 10 * MINUTE_MS;

    assert!(engine.on_tick(&tick(120.2, start)).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::ExitCounting);

    assert!(engine.on_tick(&tick(120.2, start + 16 * MINUTE_MS)).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::WaitingForReturn);
    (engine, start)
}

#[test]
fn test_upper_band_two_phase_exit() {
    let (mut engine, start) = waiting_for_return();

    let dip = tick(119.6, start + 16 * MINUTE_MS).with_range(119.6, 119.5);
    assert!(engine.on_tick(&dip).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::ReturnCounting);

    let confirm = tick(119.6, start + 31 * MINUTE_MS).with_range(119.6, 119.5);
    let signals = engine.on_tick(&confirm).unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].kind, SignalKind::Exit(ExitReason::UpperBandReturn));
    assert_eq!(signals[0].price, 119.6);
    assert_eq!(engine.position().unwrap().status, PositionStatus::Closing);
    assert!(engine.upper_band().is_idle());

    settle(&mut engine, start + 31 * MINUTE_MS);
    assert!(engine.position().is_none());
    assert_eq!(engine.ledger().locked, Decimal::ZERO);
    assert!(engine.ledger().realized_profit > Decimal::ZERO);
}

#[test]
fn test_spike_does_not_exit() {
    let (mut engine, start) = waiting_for_return();
    let t = start + 20 * MINUTE_MS;

    let dip = tick(119.7, t).with_range(119.8, 119.7);
    assert!(engine.on_tick(&dip).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::ReturnCounting);

    let spike = tick(120.3, t + 10 * SECOND_MS);
    assert!(engine.on_tick(&spike).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::WaitingForReturn);
    assert_eq!(engine.position().unwrap().status, PositionStatus::Active);
}

#[test]
fn test_trailing_stop() {
    let mut engine = engine(config(true));
    let entry_time = T0 + MINUTE_MS;
    let signals = engine
        .on_tick(&tick(100.0, entry_time).with_range(100.0, 99.5))
        .unwrap();
    assert_eq!(signals[0].kind, SignalKind::Entry(EntryType::First));
    settle(&mut engine, entry_time);

    assert!(engine
        .on_tick(&tick(110.0, entry_time + 6 * MINUTE_MS))
        .unwrap()
        .is_empty());
    let position = engine.position().unwrap();
    assert_eq!(position.peak_price_since_armed, Some(110.0));
    assert!(position.trailing_armed_at.is_some());

    let drop = tick(108.0, entry_time + 7 * MINUTE_MS).with_range(108.0, 107.7);
    let signals = engine.on_tick(&drop).unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].kind, SignalKind::Exit(ExitReason::TrailingStop));
    assert_eq!(signals[0].price, 108.0);

    settle(&mut engine, entry_time + 7 * MINUTE_MS);
    assert!(engine.position().is_none());
    assert_eq!(engine.ledger().realized_profit, dec!(8));
    assert_eq!(engine.ledger().available, dec!(1008));

    let snapshot = engine.snapshot(InstanceStatus::Running, entry_time + 7 * MINUTE_MS);
    assert_eq!(snapshot.metrics.signals_generated, 2);
    assert_eq!(snapshot.position_status, PositionStatus::None);
}

#[test]
fn test_duplicate_tick_is_processed_once() {
    let mut engine = engine(config(false));
    let touch = tick(101.0, T0 + MINUTE_MS).with_range(101.0, 99.8);
    assert_eq!(engine.on_tick(&touch).unwrap().len(), 1);
    assert!(engine.on_tick(&touch).unwrap().is_empty());

    let snapshot = engine.snapshot(InstanceStatus::Running, T0 + MINUTE_MS);
    assert_eq!(snapshot.metrics.ticks_processed, 1);
    assert_eq!(snapshot.metrics.ticks_dropped, 1);
}

#[test]
fn test_third_entry_after_fresh_mid_reclaim() {
    let mut config = config(false);
    config.signals.min_entry_time_gap_ms = 30 * MINUTE_MS;
    let mut engine = first_entry(config);

    let second_at = T0 + HOUR_MS + 6 * MINUTE_MS;
    assert!(engine.on_tick(&tick(111.0, second_at - MINUTE_MS)).unwrap().is_empty());
    let second = engine.on_tick(&tick(99.0, second_at)).unwrap();
    assert_eq!(second[0].kind, SignalKind::Entry(EntryType::Second));
    settle(&mut engine, second_at);

    // The reclaim before the second entry does not carry over
    let early = engine.on_tick(&tick(98.5, second_at + 31 * MINUTE_MS)).unwrap();
    assert!(early.is_empty());

    assert!(engine.on_tick(&tick(112.0, second_at + 34 * MINUTE_MS)).unwrap().is_empty());
    let third_at = second_at + 39 * MINUTE_MS;
    let third = engine.on_tick(&tick(98.0, third_at)).unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].kind, SignalKind::Entry(EntryType::Third));
    assert_eq!(third[0].allocation_fraction, Some(dec!(0.50)));
    assert_eq!(third[0].quote_amount, Some(dec!(500)));
    settle(&mut engine, third_at);

    let position = engine.position().unwrap();
    assert_eq!(position.entries.len(), 3);
    assert_eq!(position.allocation_total(), dec!(0.85));
    assert_eq!(position.total_quote, dec!(850));
    assert_eq!(engine.ledger().locked, dec!(850));
    assert_eq!(engine.ledger().available, dec!(150));

    // All tranches used
    assert!(engine.on_tick(&tick(112.0, third_at + 40 * MINUTE_MS)).unwrap().is_empty());
    assert!(engine.on_tick(&tick(97.0, third_at + 45 * MINUTE_MS)).unwrap().is_empty());
    assert_eq!(engine.position().unwrap().entries.len(), 3);
}

#[test]
fn test_channel_close_refreshes_bands_mid_stream() {
    let mut config = config(false);
    config.hurst.interval = CandleInterval::FIFTEEN_MINUTES;
    let mut engine = engine(config);
    assert_eq!(engine.channel().unwrap().source_candle_close_time, T0);

    let touch = tick(101.0, T0 + MINUTE_MS).with_range(101.0, 99.8);
    assert_eq!(engine.on_tick(&touch).unwrap().len(), 1);
    settle(&mut engine, T0 + MINUTE_MS);

    assert!(engine.on_tick(&tick(120.2, T0 + 2 * MINUTE_MS)).unwrap().is_empty());
    assert_eq!(engine.upper_band().current_state, UpperBandPhase::ExitCounting);
    let before = engine.upper_band().associated_upper_band.unwrap();
    assert!((before - 120.0).abs() < 1e-9);

    // Crossing the 15m boundary closes a candle at 120.2
    assert!(engine.on_tick(&tick(121.5, T0 + 16 * MINUTE_MS)).unwrap().is_empty());
    let channel = engine.channel().unwrap();
    assert_eq!(channel.source_candle_close_time, T0 + 15 * MINUTE_MS);
    assert!(channel.upper_band - 120.0 > 0.5);
    assert!(channel.mid_band > 110.0);

    let state = engine.upper_band();
    assert_eq!(state.current_state, UpperBandPhase::ExitCounting);
    assert_eq!(state.associated_upper_band, Some(channel.upper_band));
    assert_eq!(state.state_start_time, Some(T0 + 2 * MINUTE_MS));
}
