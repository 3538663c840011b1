//! Error types for the backup engine.
//!
//! `EngineError` represents operation-level errors: conditions that stop a
//! backup, restore or supervised job. Per-file problems during a copy are
//! recorded as `FileFailure` values in the copy outcome, not as EngineError.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that terminate an operation.
///
/// The `Display` text is the human-readable explanation; `kind()` gives the
/// machine-checkable classification.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required parameter was empty or out of range
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Source path does not exist
    #[error("Source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but is neither a regular file nor a directory
    #[error("Source is not a file or directory: {}", .path.display())]
    InvalidSource { path: PathBuf },

    /// Destination directory could not be created or written
    #[error("Destination unusable: {}", .path.display())]
    DestinationUnusable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another operation holds the destination root
    #[error("Destination is in use by another operation: {}", .path.display())]
    DestinationBusy { path: PathBuf },

    /// Access to a path was refused
    #[error("Permission denied: {}", .path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No metadata index exists at the given location
    #[error("No metadata index at {}", .path.display())]
    IndexNotFound { path: PathBuf },

    /// Persisted engine data could not be interpreted
    #[error("Corrupt data in {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Raw block I/O failed; the imaging operation was aborted
    #[error("Block device I/O failed on {}: {reason}", .path.display())]
    Device {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A supervised external job ended in the Failed state
    #[error("{operation} failed (code {code}): {message}")]
    ExternalJobFailed {
        operation: String,
        code: i64,
        message: String,
    },

    /// The supervision deadline elapsed before the job finished
    #[error("{operation} did not finish within {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u128 },

    /// The caller cancelled the operation
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// Catch-all for unexpected conditions
    #[error("Engine error: {message}")]
    Unknown {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
}

/// Machine-checkable classification of an `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    SourceNotFound,
    InvalidSource,
    DestinationUnusable,
    DestinationBusy,
    PermissionDenied,
    NotFound,
    Corrupt,
    Device,
    ExternalJobFailed,
    Timeout,
    Cancelled,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::SourceNotFound { .. } => ErrorKind::SourceNotFound,
            Self::InvalidSource { .. } => ErrorKind::InvalidSource,
            Self::DestinationUnusable { .. } => ErrorKind::DestinationUnusable,
            Self::DestinationBusy { .. } => ErrorKind::DestinationBusy,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::IndexNotFound { .. } => ErrorKind::NotFound,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Device { .. } => ErrorKind::Device,
            Self::ExternalJobFailed { .. } => ErrorKind::ExternalJobFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::DestinationUnusable { source, .. } | Self::PermissionDenied { source, .. } => {
                source.raw_os_error()
            }
            Self::Device { source, .. } | Self::Unknown { source, .. } => {
                source.as_ref().and_then(|e| e.raw_os_error())
            }
            _ => None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Wrap an I/O error on `path`, keeping permission problems distinct.
    pub(crate) fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source: err },
            io::ErrorKind::NotFound => Self::SourceNotFound { path },
            _ => Self::Unknown {
                message: format!("{}: {}", path.display(), err),
                source: Some(err),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let denied = EngineError::io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let missing = EngineError::io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(missing.kind(), ErrorKind::SourceNotFound);

        let other = EngineError::io("/x", io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(other.kind(), ErrorKind::Unknown);
        assert!(other.to_string().contains("boom"));
    }

    #[test]
    fn test_external_failure_message_is_verbatim() {
        let err = EngineError::ExternalJobFailed {
            operation: "VM export".to_string(),
            code: 32779,
            message: "Access denied on export directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "VM export failed (code 32779): Access denied on export directory"
        );
    }
}
