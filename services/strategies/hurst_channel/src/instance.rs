//! Strategy instance lifecycle
//!
//! ## Purpose
//!
//! A [`StrategyInstance`] runs one [`InstanceEngine`] on its own worker task.
//! Starting an instance validates its configuration, restores the open
//! position from persistence, bootstraps the indicators from candle history,
//! subscribes to the live stream and spawns two tasks:
//!
//! ```text
//!                 ┌──────────── worker task ────────────┐
//! ticks ─────────▶│                                     │──requests──▶ dispatcher task
//! commands ──────▶│  InstanceEngine (single owner)      │◀─outcomes───
//! shutdown ──────▶│                                     │──▶ snapshot (RwLock)
//!                 └─────────────────────────────────────┘
//! ```
//!
//! The worker is the only writer of engine state, so ticks, commands and
//! dispatch outcomes are applied strictly one at a time. A snapshot is
//! published after every step so readers never wait on the worker.

use crate::broker::Broker;
use crate::dispatcher::{persist, DispatchOutcome, DispatchRequest, SignalDispatcher};
use crate::engine::{InstanceEngine, InstanceSnapshot, InstanceStatus};
use crate::error::{BrokerError, MarketDataError, Result, StrategyError};
use crate::market_data::MarketDataSource;
use crate::persistence::{InstanceRecord, Persistence};
use crate::position::CapitalLedger;
use async_trait::async_trait;
use config::{DispatcherConfig, InstanceConfig};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use strategy_shared::{log_success, LogEmoji, MetricsCollector, Strategy, StrategyMetrics};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::{Candle, CandleInterval, Clock, EntryType, InstanceId, Signal, Tick, TimestampMs};

/// Attempts at fetching candle history before a start fails
const HISTORY_ATTEMPTS: u32 = 3;

/// Commands accepted by a running worker
const COMMAND_BUFFER: usize = 16;

/// Collaborators shared by every instance of a supervisor
#[derive(Clone)]
pub struct InstanceDeps {
    pub market_data: Arc<dyn MarketDataSource>,
    pub broker: Arc<dyn Broker>,
    pub persistence: Arc<dyn Persistence>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug)]
enum Command {
    ManualExit {
        reply: oneshot::Sender<Result<Signal>>,
    },
}

/// What the worker hands back when it ends
struct WorkerExit {
    engine: InstanceEngine,
    failure: Option<StrategyError>,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    commands: mpsc::Sender<Command>,
    handle: JoinHandle<WorkerExit>,
}

pub struct StrategyInstance {
    id: InstanceId,
    name: String,
    config: InstanceConfig,
    deps: InstanceDeps,
    created_at: TimestampMs,
    metrics: Arc<MetricsCollector>,
    broker_lock: Arc<Mutex<()>>,
    snapshot: Arc<RwLock<InstanceSnapshot>>,
    ledger: Option<CapitalLedger>,
    last_entry_time: Option<TimestampMs>,
    worker: Option<Worker>,
}

impl StrategyInstance {
    pub fn new(id: InstanceId, config: InstanceConfig, deps: InstanceDeps) -> Self {
        let created_at = deps.clock.now_ms();
        Self::build(id, config, deps, created_at, None, None)
    }

    /// Rebuild an instance from its persisted record
    pub fn from_record(record: InstanceRecord, deps: InstanceDeps) -> Self {
        Self::build(
            record.instance_id,
            record.config,
            deps,
            record.created_at,
            Some(record.ledger),
            record.last_entry_time,
        )
    }

    fn build(
        id: InstanceId,
        config: InstanceConfig,
        deps: InstanceDeps,
        created_at: TimestampMs,
        ledger: Option<CapitalLedger>,
        last_entry_time: Option<TimestampMs>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let idle = InstanceEngine::with_metrics(id, config.clone(), created_at, metrics.clone());
        let mut snapshot = idle.snapshot(InstanceStatus::Created, deps.clock.now_ms());
        if let Some(ledger) = ledger {
            snapshot.ledger = ledger;
        }
        snapshot.last_entry_time = last_entry_time;

        Self {
            id,
            name: format!("hurst_channel:{}:{}", config.symbol, id),
            config,
            deps,
            created_at,
            metrics,
            broker_lock: Arc::new(Mutex::new(())),
            snapshot: Arc::new(RwLock::new(snapshot)),
            ledger,
            last_entry_time,
            worker: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn status(&self) -> InstanceStatus {
        self.snapshot.read().status
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.snapshot.read().clone()
    }

    /// Shared handle to the published snapshot
    pub fn snapshot_handle(&self) -> Arc<RwLock<InstanceSnapshot>> {
        self.snapshot.clone()
    }

    pub fn has_open_position(&self) -> bool {
        self.snapshot.read().position.is_some()
    }

    pub fn record(&self, running: bool) -> InstanceRecord {
        let snapshot = self.snapshot.read();
        InstanceRecord {
            instance_id: self.id,
            config: self.config.clone(),
            running,
            ledger: snapshot.ledger,
            last_entry_time: snapshot.last_entry_time,
            created_at: self.created_at,
            updated_at: self.deps.clock.now_ms(),
        }
    }

    /// Validate, restore, bootstrap and spawn the worker
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_finished() {
            // Reap a worker that failed on its own before restarting
            self.shutdown(false).await?;
        }
        if self.worker.is_some() {
            return Err(StrategyError::InvalidInstanceState {
                id: self.id,
                state: "running",
            });
        }

        info!("{} Starting instance {} ({})", LogEmoji::START, self.id, self.config.symbol);
        match self.launch().await {
            Ok(worker) => {
                self.worker = Some(worker);
                log_success!("Instance {} running on {}", self.id, self.config.symbol);
                Ok(())
            }
            Err(error) => {
                error!(instance_id = %self.id, %error, kind = ?error.kind(), "Instance failed to start");
                self.metrics.increment_errors();
                let mut snapshot = self.snapshot.write();
                snapshot.status = InstanceStatus::Failed;
                snapshot.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    async fn launch(&mut self) -> Result<Worker> {
        self.config.validate()?;
        self.deps.dispatcher.validate()?;
        let now = self.deps.clock.now_ms();

        let position = self.deps.persistence.load_open_position(self.id).await?;

        let hurst_history = self
            .fetch_history(self.config.hurst.interval, self.config.hurst.periods)
            .await?;
        let ema_history = self
            .fetch_history(self.config.ema.interval, self.config.ema.periods)
            .await?;

        let mut engine =
            InstanceEngine::with_metrics(self.id, self.config.clone(), self.created_at, self.metrics.clone());
        engine.bootstrap(&hurst_history, &ema_history, now)?;
        engine.restore(position, self.ledger, self.last_entry_time, now);

        if !self.config.test_mode {
            self.check_balance().await?;
        }

        let ticks = self
            .deps
            .market_data
            .subscribe(&self.config.symbol, self.config.stream.tick_buffer)
            .await?;

        let queue = self.deps.dispatcher.queue_size;
        let (request_tx, request_rx) = mpsc::channel(queue);
        let (outcome_tx, outcome_rx) = mpsc::channel(queue);
        let (dispatcher_stop_tx, dispatcher_stop_rx) = watch::channel(false);
        let dispatcher = SignalDispatcher::new(
            self.id,
            self.config.symbol.clone(),
            self.config.test_mode,
            self.deps.dispatcher.clone(),
            self.deps.broker.clone(),
            self.broker_lock.clone(),
            self.deps.persistence.clone(),
            request_rx,
            outcome_tx,
            dispatcher_stop_rx,
            self.metrics.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        let record = engine.instance_record(true, now);
        if let Err(error) = persist(
            self.deps.persistence.as_ref(),
            self.id,
            &self.deps.dispatcher,
            &DispatchRequest::SaveInstance(record),
        )
        .await
        {
            warn!(instance_id = %self.id, %error, "Could not persist running flag");
        }

        *self.snapshot.write() = engine.snapshot(InstanceStatus::Running, now);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let worker = WorkerLoop {
            engine,
            ticks,
            commands: command_rx,
            outcomes: outcome_rx,
            requests: request_tx,
            shutdown: shutdown_rx,
            dispatcher_stop: dispatcher_stop_tx,
            dispatcher_handle,
            snapshot: self.snapshot.clone(),
            clock: self.deps.clock.clone(),
            persistence: self.deps.persistence.clone(),
            dispatcher_config: self.deps.dispatcher.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Ok(Worker {
            shutdown: shutdown_tx,
            commands: command_tx,
            handle,
        })
    }

    async fn fetch_history(&self, interval: CandleInterval, limit: usize) -> Result<Vec<Candle>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .deps
                .market_data
                .fetch_candles(&self.config.symbol, interval, limit)
                .await
            {
                Ok(candles) => {
                    debug!(instance_id = %self.id, %interval, count = candles.len(), "Fetched history");
                    return Ok(candles);
                }
                Err(error) if attempt < HISTORY_ATTEMPTS => {
                    let delay = self.deps.dispatcher.backoff_ms(attempt);
                    warn!(
                        instance_id = %self.id,
                        %interval,
                        attempt,
                        delay_ms = delay,
                        %error,
                        "History fetch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn check_balance(&self) -> Result<()> {
        let currency = &self.config.quote_currency;
        let first_tranche = self.config.quote_for(EntryType::First);
        match self.deps.broker.get_balance(currency).await {
            Ok(balance) if balance.available < first_tranche => {
                warn!(
                    "{} Instance {}: {} balance {} is below the first tranche {}",
                    LogEmoji::WARNING,
                    self.id,
                    currency,
                    balance.available,
                    first_tranche
                );
                Ok(())
            }
            Ok(balance) => {
                debug!(instance_id = %self.id, available = %balance.available, "Balance check passed");
                Ok(())
            }
            Err(error @ BrokerError::Authentication { .. }) => Err(error.into()),
            Err(error) => {
                warn!(instance_id = %self.id, %error, "Balance check skipped");
                Ok(())
            }
        }
    }

    /// Stop and clear the running flag
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown(false).await
    }

    /// Stop but keep the running flag so the instance is restored at boot
    pub async fn halt(&mut self) -> Result<()> {
        self.shutdown(true).await
    }

    async fn shutdown(&mut self, keep_running_flag: bool) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Err(StrategyError::InvalidInstanceState {
                id: self.id,
                state: "not running",
            });
        };

        info!("{} Stopping instance {}", LogEmoji::STOP, self.id);
        // A worker that already ended has dropped its receiver
        let _ = worker.shutdown.send(true);
        let exit = worker.handle.await.map_err(|e| StrategyError::Consistency {
            message: format!("worker task ended abnormally: {e}"),
        })?;

        let now = self.deps.clock.now_ms();
        let failed = exit.failure.is_some();
        let status = if failed {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Stopped
        };
        let mut snapshot = exit.engine.snapshot(status, now);
        if let Some(failure) = &exit.failure {
            snapshot.last_error = Some(failure.to_string());
        }
        self.ledger = Some(snapshot.ledger);
        self.last_entry_time = snapshot.last_entry_time;
        *self.snapshot.write() = snapshot;

        let running = keep_running_flag && !failed;
        let record = exit.engine.instance_record(running, now);
        persist(
            self.deps.persistence.as_ref(),
            self.id,
            &self.deps.dispatcher,
            &DispatchRequest::SaveInstance(record),
        )
        .await?;

        info!(instance_id = %self.id, status = status.as_str(), running, "Instance stopped");
        Ok(())
    }

    /// Close the open position at the last tick price
    pub async fn manual_exit(&self) -> Result<Signal> {
        let Some(worker) = &self.worker else {
            return Err(StrategyError::InvalidInstanceState {
                id: self.id,
                state: "not running",
            });
        };
        let (reply, response) = oneshot::channel();
        worker
            .commands
            .send(Command::ManualExit { reply })
            .await
            .map_err(|_| StrategyError::ChannelClosed)?;
        response.await.map_err(|_| StrategyError::ChannelClosed)?
    }

    /// Worker ended on its own, e.g. after a fatal error
    pub fn worker_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| worker.handle.is_finished())
    }
}

#[async_trait]
impl Strategy for StrategyInstance {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        StrategyInstance::start(self).await?;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        StrategyInstance::stop(self).await?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.is_some() && !self.worker_finished()
    }

    fn metrics(&self) -> StrategyMetrics {
        self.metrics.get_metrics()
    }
}

struct WorkerLoop {
    engine: InstanceEngine,
    ticks: mpsc::Receiver<Tick>,
    commands: mpsc::Receiver<Command>,
    outcomes: mpsc::Receiver<DispatchOutcome>,
    requests: mpsc::Sender<DispatchRequest>,
    shutdown: watch::Receiver<bool>,
    dispatcher_stop: watch::Sender<bool>,
    dispatcher_handle: JoinHandle<()>,
    snapshot: Arc<RwLock<InstanceSnapshot>>,
    clock: Arc<dyn Clock>,
    persistence: Arc<dyn Persistence>,
    dispatcher_config: DispatcherConfig,
}

impl WorkerLoop {
    async fn run(mut self) -> WorkerExit {
        let instance_id = self.engine.instance_id();
        let failure = loop {
            if let Err(error) = self.forward_requests().await {
                break Some(error);
            }
            self.publish(InstanceStatus::Running);

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break None;
                    }
                }
                Some(outcome) = self.outcomes.recv() => {
                    let now = self.clock.now_ms();
                    if let Err(error) = self.engine.on_dispatch_outcome(outcome, now) {
                        error!(%instance_id, %error, "Fatal dispatch failure, stopping instance");
                        break Some(error);
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }
                tick = self.ticks.recv() => match tick {
                    Some(tick) => self.handle_tick(&tick),
                    None => {
                        let error = StrategyError::from(MarketDataError::StreamClosed {
                            symbol: self.engine.config().symbol.clone(),
                        });
                        warn!(%instance_id, %error, "Live stream ended");
                        break Some(error);
                    }
                },
            }
        };

        if let Some(error) = &failure {
            self.engine.record_error(error);
        }
        self.drain().await;

        let status = if failure.is_some() {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Stopped
        };
        if failure.is_some() {
            let record = self.engine.instance_record(false, self.clock.now_ms());
            if let Err(error) = persist(
                self.persistence.as_ref(),
                instance_id,
                &self.dispatcher_config,
                &DispatchRequest::SaveInstance(record),
            )
            .await
            {
                warn!(%instance_id, %error, "Could not persist failed state");
            }
        }
        self.publish(status);

        WorkerExit {
            engine: self.engine,
            failure,
        }
    }

    fn handle_tick(&mut self, tick: &Tick) {
        match self.engine.on_tick(tick) {
            Ok(signals) => {
                for signal in signals {
                    debug!(signal_id = %signal.id, kind = %signal.kind, "Signal queued");
                }
            }
            Err(error) => {
                warn!(
                    instance_id = %self.engine.instance_id(),
                    ts = tick.timestamp,
                    %error,
                    "Tick rejected"
                );
                self.engine.record_error(&error);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ManualExit { reply } => {
                let result = self.engine.manual_exit(self.clock.now_ms());
                if let Err(error) = &result {
                    debug!(instance_id = %self.engine.instance_id(), %error, "Manual exit refused");
                }
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    async fn forward_requests(&mut self) -> Result<()> {
        for request in self.engine.take_requests() {
            self.requests
                .send(request)
                .await
                .map_err(|_| StrategyError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Reset exit state, let the dispatcher finish and flush what is left
    async fn drain(&mut self) {
        let instance_id = self.engine.instance_id();
        self.engine.stop_reset();
        if let Err(error) = self.forward_requests().await {
            debug!(%instance_id, %error, "Dispatcher already gone");
        }
        let _ = self.dispatcher_stop.send(true);

        // Closing the request channel lets the dispatcher run dry
        let (closed_tx, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.requests, closed_tx));
        while let Some(outcome) = self.outcomes.recv().await {
            let now = self.clock.now_ms();
            if let Err(error) = self.engine.on_dispatch_outcome(outcome, now) {
                debug!(%instance_id, %error, "Outcome during shutdown");
            }
        }
        if let Err(error) = (&mut self.dispatcher_handle).await {
            warn!(%instance_id, %error, "Dispatcher task ended abnormally");
        }
        let unsettled = self.engine.discard_pending_entries();
        if unsettled > 0 {
            warn!(%instance_id, unsettled, "Entries without a broker outcome at shutdown");
        }

        let mut leftovers = self.engine.take_requests();
        if let Some(position) = self.engine.position() {
            leftovers.push(DispatchRequest::SavePosition(position.clone()));
        }
        for request in leftovers {
            if request.is_order() {
                debug!(%instance_id, request = request.as_str(), "Order request dropped at shutdown");
                continue;
            }
            if let Err(error) = persist(
                self.persistence.as_ref(),
                instance_id,
                &self.dispatcher_config,
                &request,
            )
            .await
            {
                warn!(%instance_id, %error, "Final persistence write failed");
            }
        }
    }

    fn publish(&self, status: InstanceStatus) {
        *self.snapshot.write() = self.engine.snapshot(status, self.clock.now_ms());
    }
}
