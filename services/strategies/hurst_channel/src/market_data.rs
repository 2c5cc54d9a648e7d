//! Market-data source seam
//!
//! Instances pull closed candles once for bootstrap and then consume a live
//! tick stream. [`InMemoryMarketData`] is the reference source used by the
//! binary and the tests: candles are inserted up front and ticks are pushed
//! with [`InMemoryMarketData::publish`].

use crate::error::MarketDataError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use types::{Candle, CandleInterval, Tick};

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `limit` closed candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError>;

    /// Live tick stream for one symbol
    async fn subscribe(
        &self,
        symbol: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<Tick>, MarketDataError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMarketData {
    candles: RwLock<HashMap<(String, CandleInterval), Vec<Candle>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Tick>>>>,
    failing_fetches: AtomicU32,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store closed candles for a symbol and interval, replacing earlier ones
    pub fn insert_candles(&self, symbol: &str, interval: CandleInterval, candles: Vec<Candle>) {
        self.candles
            .write()
            .insert((symbol.to_string(), interval), candles);
    }

    /// Make the next `count` fetches fail with a request error
    pub fn fail_next_fetches(&self, count: u32) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Deliver a tick to every live subscriber of its symbol
    ///
    /// Returns the number of subscribers reached.
    pub async fn publish(&self, tick: Tick) -> usize {
        let senders: Vec<mpsc::Sender<Tick>> = self
            .subscribers
            .lock()
            .get(&tick.symbol)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for sender in senders {
            if sender.send(tick.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if let Some(list) = self.subscribers.lock().get_mut(&tick.symbol) {
            list.retain(|s| !s.is_closed());
        }
        delivered
    }

    /// End every stream for a symbol
    pub fn close_streams(&self, symbol: &str) {
        self.subscribers.lock().remove(symbol);
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers
            .lock()
            .get(symbol)
            .map(|list| list.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarketDataSource for InMemoryMarketData {
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let pending = self.failing_fetches.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_fetches.store(pending - 1, Ordering::SeqCst);
            return Err(MarketDataError::Request {
                message: format!("injected failure fetching {symbol} {interval}"),
            });
        }

        let candles = self.candles.read();
        let history = candles
            .get(&(symbol.to_string(), interval))
            .map(|all| {
                let start = all.len().saturating_sub(limit);
                all[start..].to_vec()
            })
            .unwrap_or_default();
        debug!(symbol, %interval, limit, returned = history.len(), "Served candle history");
        Ok(history)
    }

    async fn subscribe(
        &self,
        symbol: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<Tick>, MarketDataError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
