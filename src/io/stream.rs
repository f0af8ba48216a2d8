use std::sync::Arc;

use super::ReadAt;
use crate::error::{Error, Result};

/// Reference point for [`RemoteStream::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the object
    Set,
    /// Relative to the current position
    Cur,
    /// Relative to the end of the object
    End,
}

/// A seekable cursor over any [`ReadAt`] source
///
/// Positions are validated on seek: the cursor may sit anywhere in
/// `[0, size]`. Reads at or past the end return short (possibly empty)
/// results instead of failing.
pub struct RemoteStream<R: ReadAt + ?Sized> {
    inner: Arc<R>,
    pos: u64,
}

impl<R: ReadAt + ?Sized> RemoteStream<R> {
    pub fn new(inner: Arc<R>) -> Self {
        Self { inner, pos: 0 }
    }

    /// The underlying source
    pub fn get_ref(&self) -> &Arc<R> {
        &self.inner
    }

    /// Total size of the underlying source
    pub fn len(&self) -> u64 {
        self.inner.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current position
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Move the cursor and return the new absolute position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let size = self.len();
        let base = match whence {
            Whence::Set => 0i128,
            Whence::Cur => self.pos as i128,
            Whence::End => size as i128,
        };
        let target = base + offset as i128;
        if target < 0 || target > size as i128 {
            return Err(Error::Range(format!(
                "seek to {target} outside [0, {size}]"
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Read up to `size` bytes from the current position.
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let remaining = self.len().saturating_sub(self.pos);
        let want = (size as u64).min(remaining) as usize;
        let mut buf = vec![0u8; want];

        let mut filled = 0;
        while filled < want {
            let n = self
                .inner
                .read_at(self.pos + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        self.pos += filled as u64;
        Ok(buf)
    }

    /// Read everything from the current position to the end.
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let remaining = self.len().saturating_sub(self.pos);
        let remaining = usize::try_from(remaining)
            .map_err(|_| Error::Range(format!("{remaining} bytes do not fit in memory")))?;
        self.read(remaining).await
    }

    /// Read exactly `size` bytes; a short read means the structure being
    /// parsed is truncated.
    pub async fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        let start = self.pos;
        let data = self.read(size).await?;
        if data.len() != size {
            return Err(Error::Format(format!(
                "truncated read at offset {start}: wanted {size} bytes, got {}",
                data.len()
            )));
        }
        Ok(data)
    }

    /// Seek to `offset` and read exactly `size` bytes.
    pub async fn read_exact_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let offset = i64::try_from(offset)
            .map_err(|_| Error::Range(format!("offset {offset} out of range")))?;
        self.seek(offset, Whence::Set)?;
        self.read_exact(size).await
    }
}
