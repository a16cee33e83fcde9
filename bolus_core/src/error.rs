//! Error types for the bolus_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for bolus_core operations
///
/// Gate outcomes (hypoglycemia block, missing acknowledgment or confirmation)
/// are not errors; see [`crate::GateState`] and [`crate::RejectReason`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration or policy validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dose request input outside its accepted range
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Dosing profile cannot be resolved into a usable shape
    #[error("Profile error: {0}")]
    Profile(String),

    /// No dosing profile stored for the user
    #[error("No dosing profile found for user '{0}'")]
    ProfileNotFound(String),

    /// Entry store could not be read or written
    #[error("Entry store error: {0}")]
    Store(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a validation error for the named input field
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a recoverable input problem rather than a failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}
