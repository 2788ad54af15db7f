//! Catalog error types
//!
//! Per-call failures are typed; bulk operations collect per-record
//! failures as [`ItemError`] values instead of aborting the batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category for structured logging and RPC mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Id absent on read/update/remove
    NotFound,
    /// Input fails the governance field rules
    ValidationFailed,
    /// Duplicate add without overwrite
    Conflict,
    /// Stored `sourceHash` disagrees with the body
    IntegrityMismatch,
    /// Record file unreadable or unparseable
    CorruptedRecord,
    /// Write attempted while mutation is switched off
    MutationDisabled,
    /// Disk write/rename/delete failure
    IoFailure,
    /// `catalog.toml` or env misconfigured
    ConfigError,
    /// Unexpected logic bugs
    InternalError,
}

impl ErrorCategory {
    /// Machine-readable code for logging and RPC error payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Conflict => "CONFLICT",
            Self::IntegrityMismatch => "INTEGRITY_MISMATCH",
            Self::CorruptedRecord => "CORRUPTED_RECORD",
            Self::MutationDisabled => "MUTATION_DISABLED",
            Self::IoFailure => "IO_FAILURE",
            Self::ConfigError => "CONFIG_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether a bulk operation may continue with the next record
    pub fn item_recoverable(&self) -> bool {
        !matches!(self, Self::MutationDisabled | Self::ConfigError)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("instruction not found: {id}")]
    NotFound { id: String },

    #[error("validation failed for {id}: {}", reasons.join("; "))]
    ValidationFailed { id: String, reasons: Vec<String> },

    #[error("instruction already exists: {id}")]
    Conflict { id: String },

    #[error("integrity mismatch for {id}: stored {expected}, body hashes to {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("corrupted record at {path}: {reason}")]
    CorruptedRecord { path: String, reason: String },

    #[error("mutation is disabled (set INSTRUX_MUTATION=1 to enable)")]
    MutationDisabled,

    #[error("I/O failure: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CatalogError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::ValidationFailed { .. } => ErrorCategory::ValidationFailed,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::IntegrityMismatch { .. } => ErrorCategory::IntegrityMismatch,
            Self::CorruptedRecord { .. } => ErrorCategory::CorruptedRecord,
            Self::MutationDisabled => ErrorCategory::MutationDisabled,
            Self::Io { .. } | Self::Serialization(_) => ErrorCategory::IoFailure,
            Self::Config { .. } => ErrorCategory::ConfigError,
            Self::Internal { .. } => ErrorCategory::InternalError,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn validation(id: impl Into<String>, reasons: Vec<String>) -> Self {
        Self::ValidationFailed {
            id: id.into(),
            reasons,
        }
    }

    /// Create an I/O error with source
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Field-level reasons for validation failures, empty otherwise
    pub fn reasons(&self) -> &[String] {
        match self {
            Self::ValidationFailed { reasons, .. } => reasons,
            _ => &[],
        }
    }
}

/// A per-record failure collected during a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub id: String,
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn from_error(id: impl Into<String>, err: &CatalogError) -> Self {
        Self {
            id: id.into(),
            code: err.category().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;
