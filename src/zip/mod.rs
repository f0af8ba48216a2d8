//! ZIP archive indexing and member extraction.
//!
//! This module reads just enough of a ZIP archive to pull out one member,
//! supporting both the standard format and the ZIP64 extensions used by
//! multi-gigabyte firmware packages.
//!
//! ## Architecture
//!
//! - [`structures`]: Fixed-layout records (EOCD, ZIP64 records, local and
//!   central headers) and the [`ResolvedRange`] of a member's data
//! - [`index`]: [`ArchiveIndex`], built from the central directory
//! - [`extractor`]: Streaming materialization of a resolved member
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 End of Central Directory and extended information extra fields
//! - Archive comments of any legal length
//! - STORED (no compression) and DEFLATE compression methods
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods (they fail fast)

mod extractor;
mod index;
mod structures;

pub use extractor::extract_member;
pub use index::ArchiveIndex;
pub use structures::*;
