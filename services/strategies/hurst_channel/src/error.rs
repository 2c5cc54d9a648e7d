//! Error types for the Hurst channel strategy
//!
//! Component errors fold into [`StrategyError`], whose [`StrategyError::kind`]
//! decides how the caller reacts: retry, fail the start, reject the signal,
//! self-heal, or stop the instance.

use thiserror::Error;
use types::{EntryType, InstanceId, MarketDataTypeError, PositionId, PositionStatus};

/// How an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network or broker 5xx; retried with backoff
    TransientIo,
    /// Configuration or input out of bounds; fails instance start
    Validation,
    /// Signal rejected with no state change
    Precondition,
    /// Ledger and position disagree; self-healed with a warning
    Consistency,
    /// Instance must stop
    Fatal,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PositionError {
    #[error("No active position")]
    NoActivePosition,

    #[error("Position is {status:?}, expected {expected:?}")]
    UnexpectedStatus {
        status: PositionStatus,
        expected: PositionStatus,
    },

    #[error("A position is already open ({0})")]
    AlreadyOpen(PositionId),

    #[error("Entry out of order: expected {expected:?}, got {got:?}")]
    EntryOutOfOrder {
        expected: Option<EntryType>,
        got: EntryType,
    },

    #[error("Entry time {time} is not after the last entry at {last}")]
    NonMonotonicEntry { time: u64, last: u64 },

    #[error("Allocation would reach {total}, above 1.0")]
    AllocationExceeded { total: rust_decimal::Decimal },

    #[error("Position {0} does not match the open position")]
    UnknownPosition(PositionId),

    #[error("Entry {0:?} is still awaiting its fill")]
    EntryInFlight(EntryType),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    /// Network failure or exchange 5xx
    #[error("Transient broker failure: {message}")]
    Transient { message: String },

    /// The exchange refused the order
    #[error("Order rejected: {reason}")]
    Rejected { reason: String },

    #[error("Broker authentication failed: {message}")]
    Authentication { message: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Persistence unavailable: {message}")]
    Unavailable { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("Market data request failed: {message}")]
    Request { message: String },

    #[error("Not enough history for {symbol} {interval}: need {needed}, got {got}")]
    InsufficientHistory {
        symbol: String,
        interval: String,
        needed: usize,
        got: usize,
    },

    #[error("Live stream for {symbol} closed")]
    StreamClosed { symbol: String },
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid tick: {0}")]
    InvalidTick(#[from] MarketDataTypeError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Market data error: {0}")]
    MarketData(#[from] MarketDataError),

    #[error("Indicators not ready: {message}")]
    NotBootstrapped { message: String },

    #[error("Consistency violation: {message}")]
    Consistency { message: String },

    #[error("Instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("Instance {id} is {state}")]
    InvalidInstanceState { id: InstanceId, state: &'static str },

    #[error("Instance channel closed")]
    ChannelClosed,
}

impl StrategyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrategyError::Config(_) | StrategyError::InvalidTick(_) => ErrorKind::Validation,
            StrategyError::Position(_)
            | StrategyError::NotBootstrapped { .. }
            | StrategyError::InstanceNotFound(_)
            | StrategyError::InvalidInstanceState { .. } => ErrorKind::Precondition,
            StrategyError::Broker(e) => match e {
                BrokerError::Transient { .. } => ErrorKind::TransientIo,
                BrokerError::Rejected { .. } => ErrorKind::Precondition,
                BrokerError::Authentication { .. } => ErrorKind::Fatal,
            },
            StrategyError::Persistence(e) => match e {
                PersistenceError::Unavailable { .. } => ErrorKind::TransientIo,
                PersistenceError::NotFound { .. } => ErrorKind::Precondition,
                PersistenceError::Serialization { .. } => ErrorKind::Fatal,
            },
            StrategyError::MarketData(_) => ErrorKind::TransientIo,
            StrategyError::Consistency { .. } => ErrorKind::Consistency,
            StrategyError::ChannelClosed => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transient { .. })
    }
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, StrategyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient: StrategyError = BrokerError::Transient {
            message: "502".into(),
        }
        .into();
        assert_eq!(transient.kind(), ErrorKind::TransientIo);
        assert!(transient.is_retryable());

        let auth: StrategyError = BrokerError::Authentication {
            message: "bad key".into(),
        }
        .into();
        assert_eq!(auth.kind(), ErrorKind::Fatal);

        let no_position: StrategyError = PositionError::NoActivePosition.into();
        assert_eq!(no_position.kind(), ErrorKind::Precondition);

        let heal = StrategyError::Consistency {
            message: "locked without position".into(),
        };
        assert_eq!(heal.kind(), ErrorKind::Consistency);
    }
}
