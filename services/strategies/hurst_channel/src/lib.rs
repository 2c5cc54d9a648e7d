//! # Hurst Channel Strategy
//!
//! Mean-reversion strategy supervisor: buys in up to three tranches when price
//! touches the lower band of a Hurst channel and exits on a trailing stop or a
//! confirmed return from the upper band.
//!
//! ## Architecture
//!
//! ```text
//! Tick → TickGuard → CandleAggregator ─┬→ HurstChannelIndicator ─┐
//!                                      └→ EmaTrendIndicator ─────┤
//!                                                                ▼
//!                        PositionManager ◀── InstanceEngine ◀── detect()
//!                                                │
//!                                                ▼ DispatchRequest
//!                                         SignalDispatcher → Broker / Persistence
//! ```
//!
//! - [`engine::InstanceEngine`] is synchronous and owns every per-instance
//!   component; it never awaits and never reads the wall clock.
//! - [`instance::StrategyInstance`] runs an engine and its dispatcher on tokio
//!   tasks.
//! - [`supervisor::Supervisor`] owns the instances.
//!
//! ## Collaborators
//!
//! Market data, broker and persistence are traits. The crate ships in-memory
//! implementations used by the binary and the tests.

pub mod broker;
pub mod candles;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod instance;
pub mod market_data;
pub mod persistence;
pub mod position;
pub mod signals;
pub mod stream;
pub mod supervisor;
pub mod trailing_stop;
pub mod upper_band;

pub use broker::{Broker, PaperBroker};
pub use dispatcher::{DispatchOutcome, DispatchRequest, SignalDispatcher};
pub use engine::{InstanceEngine, InstanceSnapshot, InstanceStatus};
pub use error::{
    BrokerError, ErrorKind, MarketDataError, PersistenceError, PositionError, Result,
    StrategyError,
};
pub use indicators::{EmaSlope, EmaTrend, HurstChannel};
pub use instance::{InstanceDeps, StrategyInstance};
pub use market_data::{InMemoryMarketData, MarketDataSource};
pub use persistence::{ArchivedPosition, InMemoryPersistence, InstanceRecord, Persistence, SignalQuery};
pub use position::{CapitalLedger, PositionManager};
pub use supervisor::Supervisor;
pub use upper_band::{UpperBandPhase, UpperBandState};
