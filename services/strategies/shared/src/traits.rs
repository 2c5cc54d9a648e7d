//! Strategy traits and interfaces

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Core strategy trait that all trading strategies must implement
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Strategy name for identification
    fn name(&self) -> &str;

    /// Start the strategy
    async fn start(&mut self) -> Result<()>;

    /// Stop the strategy
    async fn stop(&mut self) -> Result<()>;

    /// Whether the strategy is currently processing market data
    fn is_running(&self) -> bool;

    /// Get current strategy metrics
    fn metrics(&self) -> StrategyMetrics;
}

/// Basic strategy metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub signals_generated: u64,
    pub orders_executed: u64,
    pub errors: u64,
}
