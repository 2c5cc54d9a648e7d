//! Per-instance analysis and signal engine
//!
//! ## Purpose
//!
//! [`InstanceEngine`] owns one of every component for a single instance and
//! wires the per-tick data flow:
//!
//! ```text
//! tick ─▶ TickGuard ─▶ CandleAggregator (hurst) ─▶ HurstChannelIndicator ─┐
//!                   └▶ CandleAggregator (ema)   ─▶ EmaTrendIndicator     ─┤
//!                                                                         ▼
//!            PositionManager ◀── commit ── signals::detect ◀── UpperBandState
//!                   │
//!                   └──▶ outbox of DispatchRequest (drained by the worker)
//! ```
//!
//! The engine is synchronous and never awaits: it is driven by one worker
//! task, which forwards the queued requests to the signal dispatcher and feeds
//! the dispatch outcomes back through [`InstanceEngine::on_dispatch_outcome`].
//! All timing uses tick timestamps; callers pass `now` explicitly elsewhere.

use crate::candles::{Aggregation, CandleAggregator};
use crate::dispatcher::{DispatchOutcome, DispatchRequest};
use crate::error::{BrokerError, ErrorKind, MarketDataError, PositionError, Result, StrategyError};
use crate::indicators::{EmaTrend, EmaTrendIndicator, HurstChannel, HurstChannelIndicator};
use crate::persistence::InstanceRecord;
use crate::position::{CapitalLedger, PositionManager};
use crate::signals::{self, Detection, DetectorInput, EntryCandidate, ExitCandidate};
use crate::stream::{TickDisposition, TickGuard};
use crate::upper_band::UpperBandState;
use config::InstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strategy_shared::{log_profit, log_signal, MetricsCollector, StrategyMetrics};
use tracing::{debug, info, warn};
use types::{
    price_to_decimal, Candle, Entry, EntryType, ExitReason, InstanceId, MarketDataTypeError,
    Position, PositionId, PositionStatus, ProfitReport, Signal, SignalId, SignalKind,
    SignalMetadata, Tick, TimestampMs,
};

/// Lifecycle state of an instance as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
        }
    }
}

/// Read-only view of an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub symbol: String,
    pub status: InstanceStatus,
    pub test_mode: bool,
    pub position_status: PositionStatus,
    pub position: Option<Position>,
    pub entry_avg_price: Option<f64>,
    pub upper_band: UpperBandState,
    pub channel: Option<HurstChannel>,
    pub ema: Option<EmaTrend>,
    pub last_price: Option<f64>,
    pub last_tick_time: Option<TimestampMs>,
    pub last_entry_time: Option<TimestampMs>,
    pub ledger: CapitalLedger,
    pub last_error: Option<String>,
    /// Position has been `closing` longer than the close timeout
    pub close_overdue: bool,
    /// Entry orders sent but not yet filled or rejected
    pub entries_in_flight: usize,
    pub metrics: StrategyMetrics,
    pub updated_at: TimestampMs,
}

/// Entry appended optimistically and awaiting its broker fill
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    position_id: PositionId,
    entry_type: EntryType,
    previous_last_entry_time: Option<TimestampMs>,
}

pub struct InstanceEngine {
    instance_id: InstanceId,
    config: InstanceConfig,
    created_at: TimestampMs,
    hurst_candles: CandleAggregator,
    ema_candles: CandleAggregator,
    channel: HurstChannelIndicator,
    trend: EmaTrendIndicator,
    positions: PositionManager,
    upper_band: UpperBandState,
    guard: TickGuard,
    last_entry_time: Option<TimestampMs>,
    last_tick: Option<Tick>,
    last_error: Option<String>,
    bootstrapped: bool,
    pending_entries: HashMap<SignalId, PendingEntry>,
    outbox: Vec<DispatchRequest>,
    metrics: Arc<MetricsCollector>,
}

impl InstanceEngine {
    pub fn new(instance_id: InstanceId, config: InstanceConfig, created_at: TimestampMs) -> Self {
        Self::with_metrics(instance_id, config, created_at, Arc::new(MetricsCollector::new()))
    }

    pub fn with_metrics(
        instance_id: InstanceId,
        config: InstanceConfig,
        created_at: TimestampMs,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            instance_id,
            hurst_candles: CandleAggregator::new(config.hurst.interval),
            ema_candles: CandleAggregator::new(config.ema.interval),
            channel: HurstChannelIndicator::new(
                config.hurst.periods,
                config.hurst.upper_deviation_factor,
                config.hurst.lower_deviation_factor,
            ),
            trend: EmaTrendIndicator::new(config.ema.periods, config.ema.slope_dead_band),
            positions: PositionManager::new(config.symbol.clone(), config.initial_capital),
            upper_band: UpperBandState::idle(),
            guard: TickGuard::new(config.stream.staleness_tolerance_ms),
            last_entry_time: None,
            last_tick: None,
            last_error: None,
            bootstrapped: false,
            pending_entries: HashMap::new(),
            outbox: Vec::new(),
            metrics,
            config,
            created_at,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn position(&self) -> Option<&Position> {
        self.positions.position()
    }

    pub fn ledger(&self) -> &CapitalLedger {
        self.positions.ledger()
    }

    pub fn upper_band(&self) -> &UpperBandState {
        &self.upper_band
    }

    pub fn channel(&self) -> Option<HurstChannel> {
        self.channel.current()
    }

    pub fn trend(&self) -> Option<EmaTrend> {
        self.trend.current()
    }

    pub fn last_entry_time(&self) -> Option<TimestampMs> {
        self.last_entry_time
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Warm both indicators from closed history, oldest first
    pub fn bootstrap(
        &mut self,
        hurst_history: &[Candle],
        ema_history: &[Candle],
        now: TimestampMs,
    ) -> Result<()> {
        let needs = [
            (hurst_history, self.config.hurst.periods, self.config.hurst.interval),
            (ema_history, self.config.ema.periods, self.config.ema.interval),
        ];
        for (history, needed, interval) in needs {
            if history.len() < needed {
                return Err(MarketDataError::InsufficientHistory {
                    symbol: self.config.symbol.clone(),
                    interval: interval.to_string(),
                    needed,
                    got: history.len(),
                }
                .into());
            }
        }

        self.hurst_candles.bootstrap(hurst_history)?;
        self.ema_candles.bootstrap(ema_history)?;
        for candle in hurst_history {
            self.channel.update(candle, now);
        }
        for candle in ema_history {
            self.trend.update(candle, now);
        }

        let (Some(channel), Some(trend)) = (self.channel.current(), self.trend.current()) else {
            return Err(StrategyError::NotBootstrapped {
                message: "indicators did not produce a value from history".to_string(),
            });
        };
        self.bootstrapped = true;
        info!(
            instance_id = %self.instance_id,
            symbol = %self.config.symbol,
            upper = channel.upper_band,
            mid = channel.mid_band,
            lower = channel.lower_band,
            hurst = channel.hurst_exponent,
            ema = trend.value,
            slope = trend.slope.as_str(),
            "Indicators bootstrapped"
        );
        Ok(())
    }

    /// Rehydrate position, ledger and entry timing from persistence
    ///
    /// A `closing` position resumes its close through the dispatcher.
    pub fn restore(
        &mut self,
        position: Option<Position>,
        ledger: Option<CapitalLedger>,
        last_entry_time: Option<TimestampMs>,
        now: TimestampMs,
    ) {
        self.positions.restore(position, ledger);
        self.last_entry_time = last_entry_time
            .max(self.positions.position().map(|p| p.last_entry_time));

        if let Some(released) = self.positions.heal_ledger() {
            warn!(
                instance_id = %self.instance_id,
                %released,
                "Capital locked without an open position; released"
            );
            let error = StrategyError::Consistency {
                message: format!("released {released} locked without an open position"),
            };
            self.record_error(&error);
            let record = self.instance_record(true, now);
            self.outbox.push(DispatchRequest::SaveInstance(record));
        }

        if let Some(position) = self.positions.position() {
            info!(
                instance_id = %self.instance_id,
                position_id = %position.position_id,
                status = position.status.as_str(),
                entries = position.entries.len(),
                "Restored open position"
            );
            if position.status == PositionStatus::Closing {
                let reference_price = position.entry_avg_price().unwrap_or_default();
                self.outbox.push(DispatchRequest::Close {
                    signal: None,
                    position: position.clone(),
                    reference_price,
                });
            }
        }
    }

    /// Process one live tick and return the signals it produced
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Vec<Signal>> {
        tick.validate()?;
        if tick.symbol != self.config.symbol {
            return Err(MarketDataTypeError::SymbolMismatch {
                expected: self.config.symbol.clone(),
                got: tick.symbol.clone(),
            }
            .into());
        }
        if !self.bootstrapped {
            return Err(StrategyError::NotBootstrapped {
                message: "tick received before bootstrap".to_string(),
            });
        }

        match self.guard.admit(tick) {
            TickDisposition::Duplicate | TickDisposition::Stale => {
                self.metrics.increment_dropped();
                debug!(instance_id = %self.instance_id, ts = tick.timestamp, "Dropped tick");
                return Ok(Vec::new());
            }
            TickDisposition::Late => {
                self.hurst_candles.on_late_tick(tick);
                self.ema_candles.on_late_tick(tick);
                self.metrics.increment_ticks();
                return Ok(Vec::new());
            }
            TickDisposition::Fresh => {}
        }

        self.aggregate(tick);
        self.last_tick = Some(tick.clone());
        self.metrics.increment_ticks();

        let channel = self.channel.current();
        let ema = self.trend.current();
        let detection = signals::detect(&DetectorInput {
            tick,
            channel: channel.as_ref(),
            ema: ema.as_ref(),
            position: self.positions.position(),
            upper_band: &self.upper_band,
            last_entry_time: self.last_entry_time,
            config: &self.config.signals,
        });

        self.commit(tick, detection, channel, ema)
    }

    fn aggregate(&mut self, tick: &Tick) {
        if let Aggregation::Closed(closed) = self.hurst_candles.on_tick(tick) {
            for candle in &closed {
                if let Some(channel) = self.channel.update(candle, tick.timestamp) {
                    debug!(
                        instance_id = %self.instance_id,
                        close_time = candle.close_time,
                        upper = channel.upper_band,
                        mid = channel.mid_band,
                        lower = channel.lower_band,
                        hurst = channel.hurst_exponent,
                        "Hurst channel updated"
                    );
                }
            }
        }
        if let Aggregation::Closed(closed) = self.ema_candles.on_tick(tick) {
            for candle in &closed {
                if let Some(trend) = self.trend.update(candle, tick.timestamp) {
                    debug!(
                        instance_id = %self.instance_id,
                        close_time = candle.close_time,
                        ema = trend.value,
                        slope = trend.slope.as_str(),
                        "EMA trend updated"
                    );
                }
            }
        }
    }

    fn commit(
        &mut self,
        tick: &Tick,
        detection: Detection,
        channel: Option<HurstChannel>,
        ema: Option<EmaTrend>,
    ) -> Result<Vec<Signal>> {
        // A close is sized from confirmed entries only
        let exit_deferred = detection.exit.is_some() && !self.pending_entries.is_empty();
        let previous = self.upper_band;
        if !exit_deferred {
            self.upper_band = detection.upper_band;
        }
        if previous.current_state != self.upper_band.current_state {
            info!(
                instance_id = %self.instance_id,
                from = previous.current_state.as_str(),
                to = self.upper_band.current_state.as_str(),
                band = ?self.upper_band.associated_upper_band,
                "Upper-band state changed"
            );
        }

        if let Some(position) = self.positions.position_mut() {
            if position.is_active() {
                if let Some(trailing) = detection.trailing {
                    position.peak_price_since_armed = trailing.peak_price;
                    position.trailing_armed_at = trailing.armed_at;
                }
                position.mid_reclaimed = detection.mid_reclaimed;
            }
        }
        if detection.trailing_armed {
            info!(
                instance_id = %self.instance_id,
                peak = ?detection.trailing.and_then(|t| t.peak_price),
                "Trailing stop armed"
            );
        }

        let mut emitted = Vec::new();
        if let Some(exit) = detection.exit {
            if exit_deferred {
                info!(
                    instance_id = %self.instance_id,
                    reason = exit.reason.as_str(),
                    price = exit.price,
                    "Exit deferred until the pending entry settles"
                );
            } else {
                emitted.push(self.emit_exit(tick, exit, channel, ema)?);
            }
        } else if let Some(entry) = detection.entry {
            match self.emit_entry(tick, entry, channel, ema) {
                Ok(signal) => emitted.push(signal),
                Err(error) if error.kind() == ErrorKind::Precondition => {
                    warn!(instance_id = %self.instance_id, %error, "Entry rejected");
                    self.record_error(&error);
                }
                Err(error) => return Err(error),
            }
        } else if let Some(block) = detection.entry_block {
            debug!(
                instance_id = %self.instance_id,
                price = tick.price,
                reason = block.as_str(),
                "Lower-band touch without entry"
            );
        }
        Ok(emitted)
    }

    fn emit_entry(
        &mut self,
        tick: &Tick,
        candidate: EntryCandidate,
        channel: Option<HurstChannel>,
        ema: Option<EmaTrend>,
    ) -> Result<Signal> {
        let entry_type = candidate.entry_type;
        let fraction = self.config.capital_allocation.fraction(entry_type);
        let quote_amount = self.config.quote_for(entry_type);
        let price = price_to_decimal(candidate.price).ok_or(MarketDataTypeError::InvalidPrice {
            field: "price",
            value: candidate.price,
        })?;

        let position = self.positions.apply_entry(Entry {
            time: tick.timestamp,
            price: candidate.price,
            entry_type,
            allocation_fraction: fraction,
            quote_amount,
            base_amount: quote_amount / price,
        })?;
        let position = position.clone();

        let signal = Signal {
            id: SignalId::generate(),
            instance_id: self.instance_id,
            symbol: self.config.symbol.clone(),
            kind: SignalKind::Entry(entry_type),
            price: candidate.price,
            timestamp: tick.timestamp,
            allocation_fraction: Some(fraction),
            quote_amount: Some(quote_amount),
            profit: None,
            profit_percent: None,
            metadata: self.metadata(channel, ema, None, None, position.entry_avg_price()),
            position_id: position.position_id,
        };

        self.pending_entries.insert(
            signal.id,
            PendingEntry {
                position_id: position.position_id,
                entry_type,
                previous_last_entry_time: self.last_entry_time,
            },
        );
        self.last_entry_time = Some(tick.timestamp);
        self.metrics.increment_signals();
        log_signal!(
            "{} entry/{} at {} ({} of capital, {} quote)",
            self.config.symbol,
            entry_type.as_str(),
            candidate.price,
            fraction,
            quote_amount
        );

        self.outbox.push(DispatchRequest::Entry {
            signal: signal.clone(),
            position,
            entry_type,
            quote_amount,
        });
        Ok(signal)
    }

    fn emit_exit(
        &mut self,
        tick: &Tick,
        candidate: ExitCandidate,
        channel: Option<HurstChannel>,
        ema: Option<EmaTrend>,
    ) -> Result<Signal> {
        self.positions.begin_close(candidate.reason, tick.timestamp)?;
        self.upper_band = UpperBandState::idle();
        let signal = self.exit_signal(
            candidate.reason,
            candidate.price,
            tick.timestamp,
            channel,
            ema,
            candidate.peak_price,
            candidate.stop_price,
        )?;
        Ok(signal)
    }

    /// Request an immediate close at the last tick price
    pub fn manual_exit(&mut self, now: TimestampMs) -> Result<Signal> {
        let position = self
            .positions
            .position()
            .ok_or(PositionError::NoActivePosition)?;
        if !position.is_active() {
            return Err(PositionError::UnexpectedStatus {
                status: position.status,
                expected: PositionStatus::Active,
            }
            .into());
        }
        if let Some(pending) = self.pending_entries.values().next() {
            return Err(PositionError::EntryInFlight(pending.entry_type).into());
        }
        let price = self
            .last_tick
            .as_ref()
            .map(|t| t.price)
            .or_else(|| position.entry_avg_price())
            .ok_or(PositionError::NoActivePosition)?;
        let timestamp = self
            .last_tick
            .as_ref()
            .map_or(now, |t| t.timestamp.max(now));

        self.positions.begin_close(ExitReason::Manual, timestamp)?;
        self.upper_band = UpperBandState::idle();
        let (channel, ema) = (self.channel.current(), self.trend.current());
        self.exit_signal(ExitReason::Manual, price, timestamp, channel, ema, None, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn exit_signal(
        &mut self,
        reason: ExitReason,
        price: f64,
        timestamp: TimestampMs,
        channel: Option<HurstChannel>,
        ema: Option<EmaTrend>,
        peak_price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<Signal> {
        let position = self
            .positions
            .position()
            .ok_or(PositionError::NoActivePosition)?
            .clone();

        let estimate = position
            .market_value(price)
            .map(|value| ProfitReport::compute(value, position.total_quote));
        let signal = Signal {
            id: SignalId::generate(),
            instance_id: self.instance_id,
            symbol: self.config.symbol.clone(),
            kind: SignalKind::Exit(reason),
            price,
            timestamp,
            allocation_fraction: None,
            quote_amount: None,
            profit: estimate.map(|r| r.profit),
            profit_percent: estimate.map(|r| r.profit_percent),
            metadata: self.metadata(
                channel,
                ema,
                peak_price,
                stop_price,
                position.entry_avg_price(),
            ),
            position_id: position.position_id,
        };

        self.metrics.increment_signals();
        log_signal!(
            "{} exit/{} at {} (estimated profit {:?})",
            self.config.symbol,
            reason.as_str(),
            price,
            signal.profit
        );

        self.outbox.push(DispatchRequest::Close {
            signal: Some(signal.clone()),
            position,
            reference_price: price,
        });
        Ok(signal)
    }

    fn metadata(
        &self,
        channel: Option<HurstChannel>,
        ema: Option<EmaTrend>,
        peak_price: Option<f64>,
        stop_price: Option<f64>,
        entry_avg_price: Option<f64>,
    ) -> SignalMetadata {
        SignalMetadata {
            upper_band: channel.map(|c| c.upper_band),
            lower_band: channel.map(|c| c.lower_band),
            mid_band: channel.map(|c| c.mid_band),
            hurst_exponent: channel.map(|c| c.hurst_exponent),
            ema_value: ema.map(|e| e.value),
            ema_slope: ema.map(|e| e.slope.as_str().to_string()),
            peak_price,
            stop_price,
            entry_avg_price,
            test_mode: self.config.test_mode,
        }
    }

    /// Apply a dispatcher result
    ///
    /// Returns an error only when the instance must stop.
    pub fn on_dispatch_outcome(&mut self, outcome: DispatchOutcome, now: TimestampMs) -> Result<()> {
        match outcome {
            DispatchOutcome::EntryFilled {
                signal_id,
                position_id,
                entry_type,
                fill,
            } => {
                self.pending_entries.remove(&signal_id);
                match self.positions.confirm_entry(position_id, entry_type, &fill) {
                    Ok(position) => {
                        let position = position.clone();
                        let record = self.instance_record(true, now);
                        self.outbox.push(DispatchRequest::SavePosition(position));
                        self.outbox.push(DispatchRequest::SaveInstance(record));
                    }
                    Err(error) => {
                        let error = StrategyError::from(error);
                        warn!(instance_id = %self.instance_id, %error, "Fill for unknown entry");
                        self.record_error(&error);
                    }
                }
                Ok(())
            }
            DispatchOutcome::EntryRejected {
                signal_id,
                position_id,
                entry_type,
                error,
            } => {
                if let Some(pending) = self.pending_entries.remove(&signal_id) {
                    self.last_entry_time = pending.previous_last_entry_time;
                    debug_assert_eq!(pending.entry_type, entry_type);
                    debug_assert_eq!(pending.position_id, position_id);
                }
                match self.positions.rollback_entry(position_id, entry_type) {
                    Ok(rolled) => {
                        info!(
                            instance_id = %self.instance_id,
                            entry_type = entry_type.as_str(),
                            discarded = rolled.position_discarded,
                            "Entry rolled back"
                        );
                        if let Some(position) = self.positions.position() {
                            self.outbox
                                .push(DispatchRequest::SavePosition(position.clone()));
                        }
                        let record = self.instance_record(true, now);
                        self.outbox.push(DispatchRequest::SaveInstance(record));
                    }
                    Err(rollback) => {
                        warn!(instance_id = %self.instance_id, error = %rollback, "Rollback skipped");
                    }
                }
                self.broker_failure(error)
            }
            DispatchOutcome::ExitFilled { position_id, fill } => {
                let closed = match self.positions.complete_close(position_id, &fill, now) {
                    Ok(closed) => closed,
                    Err(error) => {
                        let error = StrategyError::from(error);
                        warn!(instance_id = %self.instance_id, %error, "Fill for unknown close");
                        self.record_error(&error);
                        return Ok(());
                    }
                };
                self.upper_band = UpperBandState::idle();
                log_profit!(
                    "{} position {} closed ({}): profit {} ({}%)",
                    self.config.symbol,
                    position_id,
                    closed.details.reason.as_str(),
                    closed.details.profit,
                    closed.details.profit_percent
                );
                let record = self.instance_record(true, now);
                self.outbox.push(DispatchRequest::Archive {
                    position_id,
                    details: closed.details,
                });
                self.outbox.push(DispatchRequest::SaveInstance(record));
                Ok(())
            }
            DispatchOutcome::ExitFailed {
                position_id,
                attempts,
                error,
            } => {
                warn!(
                    instance_id = %self.instance_id,
                    %position_id,
                    attempts,
                    "Position remains closing"
                );
                self.broker_failure(error)
            }
            DispatchOutcome::PersistenceFailed { operation, error } => {
                let error = StrategyError::from(error);
                warn!(instance_id = %self.instance_id, operation, %error, "Persistence write lost");
                self.record_error(&error);
                Ok(())
            }
        }
    }

    fn broker_failure(&mut self, error: BrokerError) -> Result<()> {
        let error = StrategyError::from(error);
        self.record_error(&error);
        if error.kind() == ErrorKind::Fatal {
            return Err(error);
        }
        Ok(())
    }

    /// Record a per-tick or dispatch failure for the snapshot
    pub fn record_error(&mut self, error: &StrategyError) {
        self.metrics.increment_errors();
        self.last_error = Some(error.to_string());
    }

    pub fn take_requests(&mut self) -> Vec<DispatchRequest> {
        std::mem::take(&mut self.outbox)
    }

    /// Reset transient exit state when the instance stops
    ///
    /// The open position is kept; armed trailing state is dropped. Entries
    /// still in flight stay tracked so late outcomes can settle them.
    pub fn stop_reset(&mut self) {
        self.upper_band = UpperBandState::idle();
        self.positions.disarm_trailing();
    }

    pub fn entries_in_flight(&self) -> usize {
        self.pending_entries.len()
    }

    /// Forget entries whose outcome will never arrive; returns how many
    pub fn discard_pending_entries(&mut self) -> usize {
        let discarded = self.pending_entries.len();
        self.pending_entries.clear();
        discarded
    }

    pub fn instance_record(&self, running: bool, now: TimestampMs) -> InstanceRecord {
        InstanceRecord {
            instance_id: self.instance_id,
            config: self.config.clone(),
            running,
            ledger: *self.positions.ledger(),
            last_entry_time: self.last_entry_time,
            created_at: self.created_at,
            updated_at: now,
        }
    }

    pub fn snapshot(&self, status: InstanceStatus, now: TimestampMs) -> InstanceSnapshot {
        let position = self.positions.position().cloned();
        let close_overdue = position
            .as_ref()
            .and_then(|p| p.closing_since)
            .map_or(false, |since| {
                now.saturating_sub(since) > self.config.close_timeout_ms
            });
        InstanceSnapshot {
            instance_id: self.instance_id,
            symbol: self.config.symbol.clone(),
            status,
            test_mode: self.config.test_mode,
            position_status: self.positions.status(),
            entry_avg_price: position.as_ref().and_then(|p| p.entry_avg_price()),
            position,
            upper_band: self.upper_band,
            channel: self.channel.current(),
            ema: self.trend.current(),
            last_price: self.last_tick.as_ref().map(|t| t.price),
            last_tick_time: self.last_tick.as_ref().map(|t| t.timestamp),
            last_entry_time: self.last_entry_time,
            ledger: *self.positions.ledger(),
            last_error: self.last_error.clone(),
            close_overdue,
            entries_in_flight: self.pending_entries.len(),
            metrics: self.metrics.get_metrics(),
            updated_at: now,
        }
    }
}
