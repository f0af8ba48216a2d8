//! Random-access data sources.
//!
//! Everything the ZIP index needs is expressed through [`ReadAt`], so the same
//! parsing code runs over a remote object ([`RemoteFileHandle`]), a local file
//! ([`LocalFileReader`]) or a buffer ([`MemoryReader`]). [`RemoteStream`] adds
//! a seekable cursor on top of any of them.

mod http;
mod local;
mod memory;
mod stream;

pub use http::RemoteFileHandle;
pub use local::LocalFileReader;
pub use memory::MemoryReader;
pub use stream::{RemoteStream, Whence};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Chunk size used when copying a range through [`ReadAt::read_at`]
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer.
    ///
    /// Returns the number of bytes read, which is short only at end of data.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Stream `len` bytes starting at `offset` into `sink`.
    ///
    /// Implementations call [`RangeSink::restart`] once an attempt has data to
    /// deliver (or, for an empty range, once before returning), so a sink
    /// always observes one complete, uninterrupted pass over the range and is
    /// never reset by an attempt that failed before reading anything.
    async fn copy_range(&self, offset: u64, len: u64, sink: &mut dyn RangeSink) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::Range(format!("range at {offset} of {len} bytes overflows")))?;
        let mut buf = vec![0u8; (len.min(COPY_CHUNK_SIZE as u64)) as usize];
        let mut pos = offset;
        let mut started = false;

        while pos < end {
            let want = (end - pos).min(buf.len() as u64) as usize;
            let n = self.read_at(pos, &mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::Range(format!(
                    "unexpected end of data at offset {pos} (wanted {} more bytes)",
                    end - pos
                )));
            }
            if !started {
                sink.restart().await?;
                started = true;
            }
            sink.write_chunk(&buf[..n]).await?;
            pos += n as u64;
        }

        if !started {
            sink.restart().await?;
        }
        Ok(())
    }
}

/// Receiver for the bytes of one range copy
#[async_trait]
pub trait RangeSink: Send {
    /// Discard anything received so far and prepare for a fresh pass
    async fn restart(&mut self) -> Result<()>;

    /// Consume the next chunk of the range
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

/// A [`RangeSink`] collecting the range into memory
#[derive(Debug, Default)]
pub struct VecSink {
    pub data: Vec<u8>,
}

#[async_trait]
impl RangeSink for VecSink {
    async fn restart(&mut self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}
