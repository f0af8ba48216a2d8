//! Error types for partfetch.
//!
//! Every failure is a variant of [`Error`]. Variants are grouped into a small
//! set of [`ErrorKind`]s which is what callers of the orchestrator see in an
//! [`ExtractionResult`](crate::ExtractionResult).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for partfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for partfetch
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level HTTP failure (connect, timeout, reset, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a status we did not ask for
    #[error("unexpected HTTP status {status} from {url}")]
    Status {
        /// The status code returned by the server
        status: u16,
        /// The URL that was requested
        url: String,
    },

    /// A response body ended before the requested number of bytes arrived
    #[error("truncated response: expected {expected} bytes, received {received}")]
    Truncated {
        /// Number of bytes requested
        expected: u64,
        /// Number of bytes actually received
        received: u64,
    },

    /// A transient failure persisted through every retry attempt
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Short name of the guarded operation (e.g. "range fetch")
        operation: &'static str,
        /// Number of attempts made
        attempts: u32,
        /// The error from the final attempt
        #[source]
        last: Box<Error>,
    },

    /// Malformed archive or payload structure
    #[error("format error: {0}")]
    Format(String),

    /// No End of Central Directory record could be located
    #[error("not a ZIP archive: {0}")]
    NotAnArchive(String),

    /// Compression method other than stored or deflate
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    /// Extracted data does not match the central directory metadata
    #[error("integrity check failed for {name}: {reason}")]
    Integrity {
        /// Member or object that failed verification
        name: String,
        /// What did not match
        reason: String,
    },

    /// Invalid configuration value (header, URL, cache location)
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation that is recognized but cannot be performed
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Requested member is absent from the archive index
    #[error("not found: {0}")]
    NotFound(String),

    /// Out-of-bounds offsets, or a server that ignores range requests
    #[error("range error: {0}")]
    Range(String),

    /// A read was attempted before the metadata probe succeeded
    #[error("remote file handle is not initialized")]
    NotInitialized,

    /// Destination filesystem failure
    #[error("failed to write {path}: {source}")]
    Write {
        /// The path that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O error reading a local source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap an I/O error raised while writing `path`
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Write {
            path: path.into(),
            source,
        }
    }

    /// Coarse classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Http(_)
            | Error::Status { .. }
            | Error::Truncated { .. }
            | Error::RetriesExhausted { .. } => ErrorKind::Network,
            Error::Format(_)
            | Error::NotAnArchive(_)
            | Error::UnsupportedCompression(_)
            | Error::Integrity { .. }
            | Error::Config(_)
            | Error::Unsupported(_) => ErrorKind::Format,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Range(_) | Error::NotInitialized => ErrorKind::Range,
            Error::Write { .. } => ErrorKind::Write,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Classification reported to callers of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient network failure that survived all retries
    Network,
    /// Bad signature, inconsistent directory, unsupported method, failed verification
    Format,
    /// Requested member or local source does not exist
    NotFound,
    /// Out-of-bounds read or read before initialization
    Range,
    /// Destination filesystem failure
    Write,
    /// Local source could not be read
    Io,
    /// Cancelled by the caller
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "NetworkError",
            ErrorKind::Format => "FormatError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Range => "RangeError",
            ErrorKind::Write => "WriteError",
            ErrorKind::Io => "IoError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, unexpected status codes)
/// return `true`. Everything that would fail identically on a second attempt
/// returns `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Builder and redirect-policy errors repeat on every attempt
            Error::Http(e) => !(e.is_builder() || e.is_redirect()),
            Error::Status { .. } | Error::Truncated { .. } => true,
            _ => false,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_truncation_are_retryable() {
        let status = Error::Status {
            status: 503,
            url: "http://example.invalid/a.zip".into(),
        };
        assert!(status.is_retryable());
        assert_eq!(status.kind(), ErrorKind::Network);

        let short = Error::Truncated {
            expected: 10,
            received: 4,
        };
        assert!(short.is_retryable());
    }

    #[test]
    fn parse_failures_are_not_retryable() {
        for err in [
            Error::Format("bad signature".into()),
            Error::UnsupportedCompression(14),
            Error::NotFound("recovery.img".into()),
            Error::Range("end past size".into()),
            Error::NotInitialized,
            Error::Cancelled,
        ] {
            assert!(!err.is_retryable(), "{err} should not be retried");
        }
    }

    #[test]
    fn exhausted_retries_report_as_network() {
        let err = Error::RetriesExhausted {
            operation: "metadata probe",
            attempts: 3,
            last: Box::new(Error::Status {
                status: 502,
                url: "http://example.invalid".into(),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn missing_local_file_is_not_found() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn kind_display_matches_taxonomy() {
        assert_eq!(ErrorKind::Format.to_string(), "FormatError");
        assert_eq!(ErrorKind::NotFound.to_string(), "NotFound");
        assert_eq!(ErrorKind::Write.to_string(), "WriteError");
    }
}
