//! Shared Strategy Framework
//!
//! Common traits, metrics and logging setup for trading strategy services.

pub mod logging;
pub mod metrics;
pub mod traits;

pub use logging::*;
pub use metrics::*;
pub use traits::*;
