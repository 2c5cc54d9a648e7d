//! Broker seam and the paper broker
//!
//! Every call carries a client order id; a broker must return the original
//! fill when the same id is submitted twice, so the dispatcher can retry a
//! close without doubling it.

use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use types::{price_to_decimal, Balance, OrderFill, OrderSide};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Market order sized in quote currency
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quote_amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, BrokerError>;

    /// Market order sized in base currency
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        base_amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, BrokerError>;

    async fn get_balance(&self, currency: &str) -> Result<Balance, BrokerError>;
}

/// Fills market orders at the last price set for the symbol
///
/// Failures can be queued with [`PaperBroker::fail_next`]; each queued error
/// is returned by exactly one subsequent order call.
#[derive(Debug, Default)]
pub struct PaperBroker {
    prices: RwLock<HashMap<String, f64>>,
    balances: RwLock<HashMap<String, Balance>>,
    fills: Mutex<HashMap<String, OrderFill>>,
    failures: Mutex<VecDeque<BrokerError>>,
    next_order: AtomicU64,
    calls: AtomicU64,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, currency: &str, available: Decimal) -> Self {
        self.balances.write().insert(
            currency.to_string(),
            Balance {
                currency: currency.to_string(),
                available,
                locked: Decimal::ZERO,
            },
        );
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    pub fn fail_next(&self, error: BrokerError) {
        self.failures.lock().push_back(error);
    }

    /// Order calls received, including failed and replayed ones
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct orders filled
    pub fn fill_count(&self) -> usize {
        self.fills.lock().len()
    }

    pub fn fill(&self, client_order_id: &str) -> Option<OrderFill> {
        self.fills.lock().get(client_order_id).cloned()
    }

    fn execute(
        &self,
        symbol: &str,
        client_order_id: &str,
        size: impl FnOnce(Decimal) -> (Decimal, Decimal),
    ) -> Result<OrderFill, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(existing) = self.fills.lock().get(client_order_id) {
            debug!(client_order_id, "Replayed paper fill");
            return Ok(existing.clone());
        }

        let price = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected {
                reason: format!("no price for {symbol}"),
            })?;
        let price_dec = price_to_decimal(price).ok_or_else(|| BrokerError::Rejected {
            reason: format!("unusable price {price} for {symbol}"),
        })?;
        if price_dec <= Decimal::ZERO {
            return Err(BrokerError::Rejected {
                reason: format!("non-positive price for {symbol}"),
            });
        }

        let (filled_base, filled_quote) = size(price_dec);
        let order_id = format!("paper-{}", self.next_order.fetch_add(1, Ordering::SeqCst) + 1);
        let fill = OrderFill {
            order_id,
            avg_fill_price: price,
            filled_base,
            filled_quote,
        };
        self.fills
            .lock()
            .insert(client_order_id.to_string(), fill.clone());
        Ok(fill)
    }

    fn adjust_balance(&self, quote_currency: &str, delta: Decimal) {
        if let Some(balance) = self.balances.write().get_mut(quote_currency) {
            balance.available += delta;
        }
    }
}

/// Quote currency of a concatenated pair such as `BTCUSDT`
fn quote_currency_of(symbol: &str) -> &str {
    ["USDT", "USDC", "USD", "EUR", "BTC"]
        .into_iter()
        .find(|q| symbol.len() > q.len() && symbol.ends_with(q))
        .unwrap_or("USDT")
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quote_amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, BrokerError> {
        if quote_amount <= Decimal::ZERO {
            return Err(BrokerError::Rejected {
                reason: format!("quote amount must be positive, got {quote_amount}"),
            });
        }
        let replay = self.fills.lock().contains_key(client_order_id);
        let fill = self.execute(symbol, client_order_id, |price| {
            (quote_amount / price, quote_amount)
        })?;
        if !replay {
            let delta = match side {
                OrderSide::Buy => -fill.filled_quote,
                OrderSide::Sell => fill.filled_quote,
            };
            self.adjust_balance(quote_currency_of(symbol), delta);
        }
        Ok(fill)
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        base_amount: Decimal,
        client_order_id: &str,
    ) -> Result<OrderFill, BrokerError> {
        if base_amount <= Decimal::ZERO {
            return Err(BrokerError::Rejected {
                reason: format!("base amount must be positive, got {base_amount}"),
            });
        }
        let replay = self.fills.lock().contains_key(client_order_id);
        let fill = self.execute(symbol, client_order_id, |price| {
            (base_amount, base_amount * price)
        })?;
        if !replay {
            let delta = match side {
                OrderSide::Sell => fill.filled_quote,
                OrderSide::Buy => -fill.filled_quote,
            };
            self.adjust_balance(quote_currency_of(symbol), delta);
        }
        Ok(fill)
    }

    async fn get_balance(&self, currency: &str) -> Result<Balance, BrokerError> {
        Ok(self
            .balances
            .read()
            .get(currency)
            .cloned()
            .unwrap_or_else(|| Balance {
                currency: currency.to_string(),
                available: Decimal::ZERO,
                locked: Decimal::ZERO,
            }))
    }
}
