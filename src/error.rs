//! Error types for the service manager.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for service manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the service manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup / Argument Errors
    // =========================================================================
    /// Requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Item already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Artifact Errors
    // =========================================================================
    /// Hash, signature, or manifest mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Space reservation could not be satisfied.
    #[error("out of space: requested {requested} bytes, available {available}")]
    OutOfSpace { requested: u64, available: u64 },

    /// Archive entry attempts to escape the extraction directory.
    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    /// Artifact exceeds a configured size limit.
    #[error("artifact too large: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// Download failed.
    #[error("download failed for '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Blocking call exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation was aborted by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Caller lacks permission for the operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Unclassified runtime failure.
    #[error("{0}")]
    Failed(String),

    /// Configuration or invariant violation at init; the process must not
    /// continue.
    #[error("fatal: {0}")]
    Fatal(String),

    // =========================================================================
    // Carriers
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage access failed.
    #[error("storage error at {path}: {reason}")]
    Storage { path: PathBuf, reason: String },
}

impl Error {
    /// Returns the OS exit code carried by this error, if any.
    ///
    /// Run failures surfaced by the host supervisor carry the unit's exit
    /// code in a `Failed` message of the form `exit code <n>`; everything
    /// else maps to the underlying errno or 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// True when the error should be reported as a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::PathTraversal { .. } | Error::TooLarge { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_defaults_to_zero() {
        assert_eq!(Error::Failed("boom".to_string()).exit_code(), 0);
        assert_eq!(Error::Cancelled.exit_code(), 0);
    }

    #[test]
    fn validation_classification() {
        assert!(Error::Validation("sha mismatch".to_string()).is_validation());
        assert!(
            Error::PathTraversal {
                path: "../etc".to_string()
            }
            .is_validation()
        );
        assert!(!Error::Cancelled.is_validation());
    }
}
