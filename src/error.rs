//! Error types for the S3 volume agent
//!
//! Provides structured error types for the lifecycle coordinator, the
//! mount supervisors, the object-storage adapter and the eradication
//! engine.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Volume {volume_id} is already mounted at {current}, requested {requested}")]
    Conflict {
        volume_id: String,
        requested: String,
        current: String,
    },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Object Storage Errors
    // =========================================================================
    #[error("Object storage error: {operation} on bucket {bucket}: {reason}")]
    ObjectStore {
        bucket: String,
        operation: String,
        reason: String,
    },

    #[error("Bucket does not exist: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("Failed to remove {failed} objects out of total {total} of bucket {bucket}")]
    EradicationIncomplete { bucket: String, failed: u64, total: u64 },

    // =========================================================================
    // Host Errors
    // =========================================================================
    #[error("Service manager unavailable: {0}")]
    ServiceManagerUnavailable(String),

    #[error("Service unit {unit} operation {operation} failed: {reason}")]
    ServiceUnit {
        unit: String,
        operation: String,
        reason: String,
    },

    #[error("Mount command {command} failed: {output}")]
    MountCommandFailed { command: String, output: String },

    #[error("Mount operation on {path} failed: {reason}")]
    MountFailed { path: String, reason: String },

    #[error("Timeout waiting for {operation} after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure class, used to pick status codes and retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or contradictory request fields, nothing was attempted
    InvalidInput,
    /// The request conflicts with existing state, nothing was mutated
    PreconditionConflict,
    /// Infrastructure hiccup, the caller may retry
    Transient,
    /// A bounded wait ran out
    Timeout,
    /// Unrecoverable for this call
    Fatal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Configuration(_) | Error::JsonParse(_) => {
                ErrorKind::InvalidInput
            }

            Error::Conflict { .. } | Error::NotFound(_) | Error::BucketNotFound { .. } => {
                ErrorKind::PreconditionConflict
            }

            Error::Kube(_)
            | Error::ObjectStore { .. }
            | Error::ServiceManagerUnavailable(_)
            | Error::EradicationIncomplete { .. } => ErrorKind::Transient,

            Error::Timeout { .. } => ErrorKind::Timeout,

            _ => ErrorKind::Fatal,
        }
    }

    /// Check if the external caller should retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }

    /// Shorthand for a timeout on `operation`
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Shorthand for an object-storage failure
    pub fn object_store(
        bucket: impl Into<String>,
        operation: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::ObjectStore {
            bucket: bucket.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
