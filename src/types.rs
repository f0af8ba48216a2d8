//! Request and result types exchanged with callers of the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// Progress callback receiving `(bytes done, total bytes)`; total is 0 when unknown
///
/// `'a` lets callers pass closures that borrow local state, such as a progress bar.
pub type ProgressCallback<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// Where the source object lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// An `http://` or `https://` URL
    Remote(String),
    /// A path on the local filesystem
    Local(PathBuf),
}

impl SourceLocator {
    /// Classify a locator string: a network scheme means remote, anything else
    /// is a local path.
    pub fn parse(locator: &str) -> Self {
        let lower = locator.get(..8).unwrap_or(locator).to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceLocator::Remote(locator.to_string())
        } else {
            SourceLocator::Local(PathBuf::from(locator))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocator::Remote(_))
    }

    /// Final path component of the locator, without query or fragment
    pub fn basename(&self) -> Option<String> {
        match self {
            SourceLocator::Remote(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let name = path.rsplit('/').next()?;
                (!name.is_empty() && !name.contains(':')).then(|| name.to_string())
            }
            SourceLocator::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }
}

/// Per-request options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Overrides the configured per-request timeout
    pub timeout: Option<Duration>,

    /// Check the output against the archive's CRC-32 and size (or the probed
    /// length for raw images)
    pub verify: bool,
}

/// One extraction: which member of which source goes where
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub source: String,
    pub member: String,
    pub destination: PathBuf,
    pub options: ExtractionOptions,
}

impl ExtractionRequest {
    pub fn new(
        source: impl Into<String>,
        member: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            member: member.into(),
            destination: destination.into(),
            options: ExtractionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExtractionOptions) -> Self {
        self.options = options;
        self
    }
}

/// Classified failure reported to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of an orchestrator entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub success: bool,
    pub error: Option<ExtractionFailure>,
}

impl ExtractionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(err: &Error) -> Self {
        Self {
            success: false,
            error: Some(ExtractionFailure {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    /// Kind of the failure, if any
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl From<crate::error::Result<()>> for ExtractionResult {
    fn from(result: crate::error::Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(&e),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_locators() {
        assert!(SourceLocator::parse("https://example.com/fw.zip").is_remote());
        assert!(SourceLocator::parse("HTTP://example.com/fw.zip").is_remote());
        assert_eq!(
            SourceLocator::parse("/tmp/fw.zip"),
            SourceLocator::Local(PathBuf::from("/tmp/fw.zip"))
        );
        assert!(!SourceLocator::parse("ftp.zip").is_remote());
    }

    #[test]
    fn basename_strips_query_and_fragment() {
        let remote = SourceLocator::parse("https://cdn.example.com/a/b/fw-1.2.zip?token=x#frag");
        assert_eq!(remote.basename().as_deref(), Some("fw-1.2.zip"));

        let bare = SourceLocator::parse("https://cdn.example.com/");
        assert_eq!(bare.basename(), None);

        let local = SourceLocator::parse("images/payload.bin");
        assert_eq!(local.basename().as_deref(), Some("payload.bin"));
    }

    #[test]
    fn result_from_error_carries_kind_and_message() {
        let result = ExtractionResult::from(Err(Error::NotFound("recovery.img".into())));
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));
        assert!(result.error.unwrap().message.contains("recovery.img"));

        assert_eq!(ExtractionResult::from(Ok(())), ExtractionResult::ok());
    }
}
