//! Configuration errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is outside its allowed range
    #[error("Invalid config field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The configuration sources could not be read or merged
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config_crate::ConfigError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
