//! Strategy metrics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Thread-safe metrics collector for strategies
#[derive(Debug)]
pub struct MetricsCollector {
    start_time: Instant,
    ticks_processed: AtomicU64,
    ticks_dropped: AtomicU64,
    signals_generated: AtomicU64,
    orders_executed: AtomicU64,
    errors: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ticks_processed: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
            signals_generated: AtomicU64::new(0),
            orders_executed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn increment_ticks(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Duplicate or stale tick discarded before processing
    pub fn increment_dropped(&self) {
        self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_signals(&self) {
        self.signals_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_orders(&self) {
        self.orders_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> super::StrategyMetrics {
        super::StrategyMetrics {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            signals_generated: self.signals_generated.load(Ordering::Relaxed),
            orders_executed: self.orders_executed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
