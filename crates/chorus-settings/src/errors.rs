//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A layer could not be read or did not match the settings schema.
    #[error("failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value `{key}`: {reason}")]
    InvalidValue {
        /// Dotted settings key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for SettingsError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
