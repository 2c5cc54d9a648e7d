//! Asynchronous signal dispatcher
//!
//! ## Purpose
//!
//! Takes the side effects off the tick pipeline. The engine updates its
//! in-memory state first and queues [`DispatchRequest`]s; one dispatcher task
//! per instance persists signals and positions, executes broker orders and
//! reports each result back as a [`DispatchOutcome`].
//!
//! ## Architecture Role
//!
//! ```text
//! InstanceEngine ──requests──▶ SignalDispatcher ──▶ Persistence
//!       ▲                            │
//!       └────────outcomes────────────┴──────▶ Broker (per-instance lock)
//! ```
//!
//! ## Retry policy
//!
//! - Entries get one broker attempt; a failure rolls the entry back.
//! - Exits retry transient failures with exponential backoff up to
//!   `max_exit_attempts`. When attempts run out the position stays `closing`
//!   and a human-intervention alert is logged.
//! - Persistence writes retry transient failures `persistence_attempts` times.
//! - Shutdown cancels pending backoff sleeps; queued requests are still drained.

use crate::broker::Broker;
use crate::error::{BrokerError, PersistenceError};
use crate::persistence::{InstanceRecord, Persistence};
use config::DispatcherConfig;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use strategy_shared::{log_execution, MetricsCollector};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use types::{
    price_to_decimal, EntryType, ExitDetails, InstanceId, OrderFill, OrderSide, Position,
    PositionId, Signal, SignalId,
};

/// Side effect queued by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRequest {
    /// Persist an entry signal and buy its quote amount
    Entry {
        signal: Signal,
        position: Position,
        entry_type: EntryType,
        quote_amount: Decimal,
    },
    /// Persist the closing position and sell its base amount
    ///
    /// `signal` is absent when a close is resumed after a restart.
    Close {
        signal: Option<Signal>,
        position: Position,
        reference_price: f64,
    },
    SavePosition(Position),
    Archive {
        position_id: PositionId,
        details: ExitDetails,
    },
    SaveInstance(InstanceRecord),
}

impl DispatchRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchRequest::Entry { .. } => "entry",
            DispatchRequest::Close { .. } => "close",
            DispatchRequest::SavePosition(_) => "save_position",
            DispatchRequest::Archive { .. } => "archive",
            DispatchRequest::SaveInstance(_) => "save_instance",
        }
    }

    /// Needs the broker, as opposed to a plain persistence write
    pub fn is_order(&self) -> bool {
        matches!(
            self,
            DispatchRequest::Entry { .. } | DispatchRequest::Close { .. }
        )
    }
}

/// Result reported back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    EntryFilled {
        signal_id: SignalId,
        position_id: PositionId,
        entry_type: EntryType,
        fill: OrderFill,
    },
    EntryRejected {
        signal_id: SignalId,
        position_id: PositionId,
        entry_type: EntryType,
        error: BrokerError,
    },
    ExitFilled {
        position_id: PositionId,
        fill: OrderFill,
    },
    ExitFailed {
        position_id: PositionId,
        attempts: u32,
        error: BrokerError,
    },
    PersistenceFailed {
        operation: &'static str,
        error: PersistenceError,
    },
}

/// Client order id of the close order; stable across retries and restarts
pub fn close_order_id(instance_id: InstanceId, position_id: PositionId) -> String {
    format!("{}-{}-close", instance_id.inner(), position_id.inner())
}

pub struct SignalDispatcher {
    instance_id: InstanceId,
    symbol: String,
    test_mode: bool,
    config: DispatcherConfig,
    broker: Arc<dyn Broker>,
    broker_lock: Arc<Mutex<()>>,
    persistence: Arc<dyn Persistence>,
    requests: mpsc::Receiver<DispatchRequest>,
    outcomes: mpsc::Sender<DispatchOutcome>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<MetricsCollector>,
}

impl SignalDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        symbol: String,
        test_mode: bool,
        config: DispatcherConfig,
        broker: Arc<dyn Broker>,
        broker_lock: Arc<Mutex<()>>,
        persistence: Arc<dyn Persistence>,
        requests: mpsc::Receiver<DispatchRequest>,
        outcomes: mpsc::Sender<DispatchOutcome>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            instance_id,
            symbol,
            test_mode,
            config,
            broker,
            broker_lock,
            persistence,
            requests,
            outcomes,
            shutdown,
            metrics,
        }
    }

    /// Process requests until every sender is dropped
    pub async fn run(mut self) {
        debug!(instance_id = %self.instance_id, "Signal dispatcher started");
        while let Some(request) = self.requests.recv().await {
            self.handle(request).await;
        }
        debug!(instance_id = %self.instance_id, "Signal dispatcher drained");
    }

    async fn handle(&mut self, request: DispatchRequest) {
        match request {
            DispatchRequest::Entry {
                signal,
                position,
                entry_type,
                quote_amount,
            } => {
                self.persist_signal(&signal).await;
                self.persist_position(&position).await;
                let outcome = self
                    .execute_entry(&signal, position.position_id, entry_type, quote_amount)
                    .await;
                self.report(outcome).await;
            }
            DispatchRequest::Close {
                signal,
                position,
                reference_price,
            } => {
                if let Some(signal) = &signal {
                    self.persist_signal(signal).await;
                }
                self.persist_position(&position).await;
                let outcome = self.execute_close(&position, reference_price).await;
                self.report(outcome).await;
            }
            other => {
                if let Err(error) = persist(
                    self.persistence.as_ref(),
                    self.instance_id,
                    &self.config,
                    &other,
                )
                .await
                {
                    self.report(DispatchOutcome::PersistenceFailed {
                        operation: other.as_str(),
                        error,
                    })
                    .await;
                }
            }
        }
    }

    async fn execute_entry(
        &self,
        signal: &Signal,
        position_id: PositionId,
        entry_type: EntryType,
        quote_amount: Decimal,
    ) -> DispatchOutcome {
        let result = if self.test_mode {
            synthetic_fill(&signal.client_order_id(), signal.price, |price| {
                (quote_amount / price, quote_amount)
            })
        } else {
            let _guard = self.broker_lock.lock().await;
            self.broker
                .place_market_order(
                    &self.symbol,
                    OrderSide::Buy,
                    quote_amount,
                    &signal.client_order_id(),
                )
                .await
        };

        match result {
            Ok(fill) => {
                self.metrics.increment_orders();
                log_execution!(
                    "{} entry/{} filled: {} base for {} quote at {:.4}",
                    self.symbol,
                    entry_type.as_str(),
                    fill.filled_base,
                    fill.filled_quote,
                    fill.avg_fill_price
                );
                DispatchOutcome::EntryFilled {
                    signal_id: signal.id,
                    position_id,
                    entry_type,
                    fill,
                }
            }
            Err(error) => {
                warn!(
                    instance_id = %self.instance_id,
                    entry_type = entry_type.as_str(),
                    %error,
                    "Entry order failed, rolling back"
                );
                DispatchOutcome::EntryRejected {
                    signal_id: signal.id,
                    position_id,
                    entry_type,
                    error,
                }
            }
        }
    }

    async fn execute_close(&mut self, position: &Position, reference_price: f64) -> DispatchOutcome {
        let client_order_id = close_order_id(self.instance_id, position.position_id);
        let max_attempts = self.config.max_exit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = if self.test_mode {
                let base = position.total_base;
                synthetic_fill(&client_order_id, reference_price, |price| (base, base * price))
            } else {
                let _guard = self.broker_lock.lock().await;
                self.broker
                    .close_position(
                        &self.symbol,
                        OrderSide::Sell,
                        position.total_base,
                        &client_order_id,
                    )
                    .await
            };

            let error = match result {
                Ok(fill) => {
                    self.metrics.increment_orders();
                    log_execution!(
                        "{} close filled: {} base for {} quote at {:.4} (attempt {})",
                        self.symbol,
                        fill.filled_base,
                        fill.filled_quote,
                        fill.avg_fill_price,
                        attempt
                    );
                    return DispatchOutcome::ExitFilled {
                        position_id: position.position_id,
                        fill,
                    };
                }
                Err(error) => error,
            };

            let exhausted = attempt >= max_attempts;
            if !error.is_retryable() || exhausted {
                error!(
                    alert = "human_intervention",
                    instance_id = %self.instance_id,
                    position_id = %position.position_id,
                    attempts = attempt,
                    %error,
                    "Close order failed; position left closing"
                );
                return DispatchOutcome::ExitFailed {
                    position_id: position.position_id,
                    attempts: attempt,
                    error,
                };
            }

            let delay = self.config.backoff_ms(attempt);
            warn!(
                instance_id = %self.instance_id,
                attempt,
                delay_ms = delay,
                %error,
                "Close order failed, retrying"
            );
            if !self.sleep_unless_shutdown(delay).await {
                info!(instance_id = %self.instance_id, "Close retry cancelled by shutdown");
                return DispatchOutcome::ExitFailed {
                    position_id: position.position_id,
                    attempts: attempt,
                    error,
                };
            }
        }
    }

    /// Sleep for `delay_ms`; false when shutdown fires first
    async fn sleep_unless_shutdown(&mut self, delay_ms: u64) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => !*self.shutdown.borrow(),
                // Sender gone: nobody can signal shutdown any more
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    true
                }
            },
        }
    }

    async fn persist_signal(&self, signal: &Signal) {
        let result = retry_persistence(&self.config, "append_signal", || {
            self.persistence.append_signal(signal)
        })
        .await;
        if let Err(error) = result {
            self.report(DispatchOutcome::PersistenceFailed {
                operation: "append_signal",
                error,
            })
            .await;
        }
    }

    async fn persist_position(&self, position: &Position) {
        let request = DispatchRequest::SavePosition(position.clone());
        if let Err(error) = persist(
            self.persistence.as_ref(),
            self.instance_id,
            &self.config,
            &request,
        )
        .await
        {
            self.report(DispatchOutcome::PersistenceFailed {
                operation: request.as_str(),
                error,
            })
            .await;
        }
    }

    async fn report(&self, outcome: DispatchOutcome) {
        if self.outcomes.send(outcome).await.is_err() {
            debug!(instance_id = %self.instance_id, "Outcome dropped, worker gone");
        }
    }
}

/// Execute a persistence-only request with retries
///
/// Order requests are skipped; they need a running dispatcher.
pub async fn persist(
    persistence: &dyn Persistence,
    instance_id: InstanceId,
    config: &DispatcherConfig,
    request: &DispatchRequest,
) -> Result<(), PersistenceError> {
    let operation = request.as_str();
    match request {
        DispatchRequest::SavePosition(position) => {
            retry_persistence(config, operation, || {
                persistence.save_open_position(instance_id, position)
            })
            .await
        }
        DispatchRequest::Archive {
            position_id,
            details,
        } => {
            retry_persistence(config, operation, || {
                persistence.close_position(*position_id, details)
            })
            .await
        }
        DispatchRequest::SaveInstance(record) => {
            retry_persistence(config, operation, || persistence.save_instance(record)).await
        }
        DispatchRequest::Entry { .. } | DispatchRequest::Close { .. } => {
            debug!(%instance_id, operation, "Order request skipped outside the dispatcher");
            Ok(())
        }
    }
}

async fn retry_persistence<F, Fut>(
    config: &DispatcherConfig,
    operation: &'static str,
    mut call: F,
) -> Result<(), PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), PersistenceError>>,
{
    let attempts = config.persistence_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(()) => return Ok(()),
            Err(error) if error.is_retryable() && attempt < attempts => {
                let delay = config.backoff_ms(attempt);
                warn!(operation, attempt, delay_ms = delay, %error, "Persistence write failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(error) => {
                error!(operation, attempts = attempt, %error, "Persistence write failed");
                return Err(error);
            }
        }
    }
}

/// Fill synthesised from a reference price when broker calls are suppressed
fn synthetic_fill(
    client_order_id: &str,
    price: f64,
    size: impl FnOnce(Decimal) -> (Decimal, Decimal),
) -> Result<OrderFill, BrokerError> {
    let price_dec = price_to_decimal(price)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| BrokerError::Rejected {
            reason: format!("unusable reference price {price}"),
        })?;
    let (filled_base, filled_quote) = size(price_dec);
    Ok(OrderFill {
        order_id: format!("test-{client_order_id}"),
        avg_fill_price: price,
        filled_base,
        filled_quote,
    })
}
