//! Update payload containers (`payload.bin`).
//!
//! A payload starts with a fixed big-endian header: the magic `CrAU`, a format
//! version, the manifest length and, from version 2 on, the length of the
//! metadata signature. Rebuilding a partition from the manifest's operations
//! is delegated to a [`PayloadResolver`] supplied by the caller; this crate
//! only locates the payload and hands it over.

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::types::{ProgressCallback, SourceLocator};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Conventional name of the payload inside an OTA zip
pub const PAYLOAD_MEMBER_NAME: &str = "payload.bin";

/// Largest manifest we are willing to load into memory
const MAX_MANIFEST_SIZE: u64 = 64 * 1024 * 1024;

/// Fixed header at the start of an update payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

impl PayloadHeader {
    /// Header size for version 1
    pub const V1_SIZE: usize = 20;
    /// Header size for version 2 and later
    pub const V2_SIZE: usize = 24;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::V1_SIZE || &data[..4] != PAYLOAD_MAGIC {
            return Err(Error::Format("missing update payload magic".into()));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let version = cursor.read_u64::<BigEndian>()?;
        let manifest_size = cursor.read_u64::<BigEndian>()?;
        let metadata_signature_size = if version >= 2 {
            if data.len() < Self::V2_SIZE {
                return Err(Error::Format("truncated update payload header".into()));
            }
            cursor.read_u32::<BigEndian>()?
        } else {
            0
        };

        Ok(Self {
            version,
            manifest_size,
            metadata_signature_size,
        })
    }

    pub fn header_size(&self) -> u64 {
        if self.version >= 2 {
            Self::V2_SIZE as u64
        } else {
            Self::V1_SIZE as u64
        }
    }

    /// Offset of the manifest, relative to the payload start
    pub fn manifest_offset(&self) -> u64 {
        self.header_size()
    }

    /// Offset of the first data blob, relative to the payload start
    pub fn data_offset(&self) -> u64 {
        self.header_size() + self.manifest_size + self.metadata_signature_size as u64
    }
}

/// Read the payload header at `base_offset`, or `None` if the magic is absent.
pub async fn read_header<R: ReadAt + ?Sized>(
    reader: &R,
    base_offset: u64,
) -> Result<Option<PayloadHeader>> {
    let mut buf = [0u8; PayloadHeader::V2_SIZE];
    let n = reader.read_at(base_offset, &mut buf).await?;
    if n < 4 || &buf[..4] != PAYLOAD_MAGIC {
        return Ok(None);
    }
    PayloadHeader::from_bytes(&buf[..n]).map(Some)
}

/// Does the locator name suggest an update payload?
pub fn looks_like_payload(locator: &SourceLocator) -> bool {
    locator.basename().is_some_and(|name| {
        let name = name.to_ascii_lowercase();
        name == PAYLOAD_MEMBER_NAME || (name.contains("payload") && name.ends_with(".bin"))
    })
}

/// A located payload, ready to be handed to a [`PayloadResolver`]
#[derive(Clone)]
pub struct PayloadSource {
    /// Source holding the payload, either on its own or inside an archive
    pub reader: Arc<dyn ReadAt>,
    /// Absolute offset of the `CrAU` magic within `reader`
    pub base_offset: u64,
    /// Length of the payload in bytes
    pub length: u64,
    pub header: PayloadHeader,
}

impl PayloadSource {
    /// Raw manifest bytes
    pub async fn read_manifest(&self) -> Result<Vec<u8>> {
        let size = self.header.manifest_size;
        if size > MAX_MANIFEST_SIZE || self.header.data_offset() > self.length {
            return Err(Error::Format(format!(
                "update payload manifest of {size} bytes does not fit the payload"
            )));
        }

        let mut buf = vec![0u8; size as usize];
        let offset = self.base_offset + self.header.manifest_offset();
        let n = self.reader.read_at(offset, &mut buf).await?;
        if n != buf.len() {
            return Err(Error::Format(format!(
                "truncated update payload manifest: {n} of {size} bytes"
            )));
        }
        Ok(buf)
    }
}

/// Rebuilds a partition image from an update payload
#[async_trait]
pub trait PayloadResolver: Send + Sync {
    async fn extract_partition(
        &self,
        payload: &PayloadSource,
        partition: &str,
        destination: &Path,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()>;
}
