//! # Hurst Channel Configuration
//!
//! Configuration for the Hurst channel supervisor and its strategy instances.
//!
//! ## Features
//!
//! - **Instance Configuration**: indicator windows, entry/exit rules, capital allocation
//! - **Supervisor Configuration**: logging, dispatcher retry policy, boot instances
//! - **Defaults**: one place for every default value
//!
//! ## Usage
//!
//! ```rust,no_run
//! use config::{InstanceConfig, SupervisorConfig};
//! use rust_decimal_macros::dec;
//!
//! let supervisor = SupervisorConfig::load(None).unwrap();
//!
//! let instance = InstanceConfig::new("BTCUSDT", dec!(1000));
//! instance.validate().unwrap();
//! ```

pub mod defaults;
pub mod error;
pub mod instance;
pub mod supervisor;

// Re-export commonly used types
pub use error::ConfigError;
pub use instance::{
    CapitalAllocation, EmaConfig, HurstConfig, InstanceConfig, SignalsConfig, StreamConfig,
};
pub use supervisor::{
    load_config, DispatcherConfig, LogFormat, LoggingConfig, SupervisorConfig,
    DEFAULT_CONFIG_PATH,
};
