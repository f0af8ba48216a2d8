//! # partfetch
//!
//! Extract a single partition image from a firmware archive without
//! downloading the archive.
//!
//! For remote sources the object is probed with a HEAD request, then only the
//! ZIP end records, the central directory, one local header and the member's
//! own bytes are fetched with HTTP Range requests. Local archives go through
//! the same parser over positioned file reads.
//!
//! ## Features
//!
//! - ZIP and ZIP64 archives, with trailing comments of any legal length
//! - STORED and DEFLATE members, inflated while streaming to disk
//! - Retries with capped exponential backoff around each HTTP operation
//! - Optional CRC-32 verification and an on-disk archive cache
//! - Raw images and update payloads (`payload.bin`) as sources
//!
//! ## Example
//!
//! ```no_run
//! use partfetch::{ExtractionOrchestrator, ExtractionRequest, ExtractorConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = ExtractionOrchestrator::new(ExtractorConfig::default());
//!     let request = ExtractionRequest::new(
//!         "https://example.com/firmware.zip",
//!         "boot.img",
//!         "out/boot.img",
//!     );
//!
//!     let result = orchestrator.extract_partition(&request, None).await;
//!     if let Some(failure) = result.error {
//!         eprintln!("{}: {}", failure.kind, failure.message);
//!     }
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod payload;
pub mod retry;
pub mod types;
pub mod zip;

pub use cache::ArchiveCache;
pub use cli::Cli;
pub use config::{ExtractorConfig, FetchConfig, RetryPolicy};
pub use error::{Error, ErrorKind, IsRetryable, Result};
pub use io::{LocalFileReader, MemoryReader, RangeSink, ReadAt, RemoteFileHandle, RemoteStream, Whence};
pub use orchestrator::ExtractionOrchestrator;
pub use payload::{PayloadHeader, PayloadResolver, PayloadSource};
pub use types::{
    ExtractionFailure, ExtractionOptions, ExtractionRequest, ExtractionResult, ProgressCallback,
    SourceLocator,
};
pub use zip::{ArchiveIndex, CentralDirectoryEntry, CompressionMethod, ResolvedRange};
