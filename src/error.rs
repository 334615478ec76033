//! Error types for hotswap-store.

use crate::value::Value;
use std::fmt;

/// Result type alias for hotswap-store operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when working with the store.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The key is empty or not a well-formed dot path.
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey {
        /// The offending key
        key: String,
        /// Why the key was rejected
        reason: &'static str,
    },

    /// A validator rejected the value.
    #[error("Validation failed in '{validator}' for field '{field}': {message}")]
    Validation {
        /// Name of the validator that rejected the change
        validator: String,
        /// Dot path of the rejected field
        field: String,
        /// Rule failure message
        message: String,
        /// The value being set, when the failure came from a mutation
        value: Option<Value>,
    },

    /// Writing to durable storage failed.
    #[error("Failed to persist configuration to {location}: {source}")]
    Persistence {
        /// Durable location that could not be written
        location: String,
        /// Underlying I/O cause
        #[source]
        source: std::io::Error,
    },

    /// Ciphertext could not be opened, or encryption was required but absent.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Sealing the payload failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Serializing or deserializing the configuration tree failed.
    #[error("{format} format error: {message}")]
    Format {
        /// Wire format name
        format: &'static str,
        /// What went wrong
        message: String,
    },

    /// Failed to load configuration from durable storage.
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    /// File watching is not supported or failed to initialize.
    #[error("File watching error: {0}")]
    WatchError(String),

    /// Attempted to use a feature that is not enabled.
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(&'static str),

    /// IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error for other cases.
    #[error("Configuration error: {0}")]
    Other(String),
}

/// Coarse classification of a [`ConfigError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Empty or malformed key
    InvalidKey,
    /// A rule rejected a value
    ValidationFailure,
    /// Durable write failed
    PersistenceFailure,
    /// AEAD open failed or the encryption marker was missing
    DecryptionFailure,
    /// Serialize/deserialize error
    FormatFailure,
    /// Anything else (load, watch, feature gates, I/O on read)
    Other,
}

impl ConfigError {
    /// Classify this error without inspecting its message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey { .. } => ErrorKind::InvalidKey,
            Self::Validation { .. } => ErrorKind::ValidationFailure,
            Self::Persistence { .. } => ErrorKind::PersistenceFailure,
            Self::Decryption(_) => ErrorKind::DecryptionFailure,
            Self::Format { .. } => ErrorKind::FormatFailure,
            Self::Encryption(_)
            | Self::LoadError(_)
            | Self::WatchError(_)
            | Self::FeatureNotEnabled(_)
            | Self::IoError(_)
            | Self::Other(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn format(format: &'static str, err: impl fmt::Display) -> Self {
        Self::Format {
            format,
            message: err.to_string(),
        }
    }
}

/// Validation error reported by a [`Validator`](crate::core::Validator).
#[derive(Debug)]
pub enum ValidationError {
    /// Custom validation error with a message.
    Custom(String),

    /// A specific field has an invalid value.
    InvalidField {
        /// The field name/path
        field: String,
        /// The reason why it's invalid
        reason: String,
    },

    /// Multiple validation errors occurred.
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Create a custom validation error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The first field this error names, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Custom(_) => None,
            Self::InvalidField { field, .. } => Some(field),
            Self::Multiple(errors) => errors.iter().find_map(|e| e.field()),
        }
    }

    /// Attach the validator name and fallback field to build a [`ConfigError`].
    pub(crate) fn into_config_error(
        self,
        validator: &str,
        fallback_field: &str,
        value: Option<&Value>,
    ) -> ConfigError {
        let field = self.field().unwrap_or(fallback_field).to_string();
        let message = match &self {
            Self::InvalidField { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        ConfigError::Validation {
            validator: validator.to_string(),
            field,
            message,
            value: value.cloned(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(msg) => write!(f, "{}", msg),
            Self::InvalidField { field, reason } => {
                write!(f, "Field '{}' is invalid: {}", field, reason)
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple validation errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}
