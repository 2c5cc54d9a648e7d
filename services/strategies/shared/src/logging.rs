//! Standardized logging for strategy services
//!
//! Subscriber initialisation plus a small emoji vocabulary so that lifecycle
//! events read the same across services.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Standard emoji set for strategy logging
pub struct LogEmoji;

impl LogEmoji {
    // Status indicators
    pub const SUCCESS: &'static str = "✅"; // Operation succeeded
    pub const ERROR: &'static str = "❌"; // Operation failed
    pub const WARNING: &'static str = "⚠️"; // Warning or caution

    // Strategy events
    pub const START: &'static str = "🚀"; // Instance or service start
    pub const STOP: &'static str = "🛑"; // Instance or service stop
    pub const SIGNAL: &'static str = "🎯"; // Signal emitted
    pub const CHART: &'static str = "📊"; // Indicators/statistics/metrics
    pub const EXECUTE: &'static str = "⚡"; // Broker execution
    pub const MONEY: &'static str = "💰"; // Profit/financial
    pub const ALERT: &'static str = "🚨"; // Needs a human
}

// Convenience macros for standardized logging
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        tracing::info!("{} {}", $crate::logging::LogEmoji::SUCCESS, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_signal {
    ($($arg:tt)*) => {
        tracing::info!("{} {}", $crate::logging::LogEmoji::SIGNAL, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_execution {
    ($($arg:tt)*) => {
        tracing::info!("{} {}", $crate::logging::LogEmoji::EXECUTE, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_profit {
    ($($arg:tt)*) => {
        tracing::info!("{} {}", $crate::logging::LogEmoji::MONEY, format!($($arg)*))
    };
}

/// Output format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Pretty,
    Json,
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_strategy_logging(default_level: &str, output: LogOutput) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))?;

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = match output {
        LogOutput::Pretty => builder.try_init(),
        LogOutput::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
