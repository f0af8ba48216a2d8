use async_trait::async_trait;
use flate2::Crc;
use flate2::write::DeflateDecoder;
use std::io::Write;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::io::{RangeSink, ReadAt};
use crate::types::ProgressCallback;

use super::structures::{CentralDirectoryEntry, CompressionMethod, ResolvedRange};

/// Streams a member's compressed bytes to its destination file, inflating on
/// the fly and keeping a running CRC-32 of the output.
///
/// The destination is only created once there is output to write (or the
/// member turns out to be empty), so a fetch that fails up front leaves an
/// existing file alone.
struct MemberSink<'a> {
    destination: &'a Path,
    method: CompressionMethod,
    file: Option<fs::File>,
    created: bool,
    inflater: Option<DeflateDecoder<Vec<u8>>>,
    crc: Crc,
    received: u64,
    written: u64,
    total: u64,
    expected_size: u64,
    on_progress: Option<&'a ProgressCallback<'a>>,
}

impl<'a> MemberSink<'a> {
    fn new(
        destination: &'a Path,
        entry: &CentralDirectoryEntry,
        total: u64,
        on_progress: Option<&'a ProgressCallback<'a>>,
    ) -> Self {
        Self {
            destination,
            method: entry.compression_method,
            file: None,
            created: false,
            inflater: None,
            crc: Crc::new(),
            received: 0,
            written: 0,
            total,
            expected_size: entry.uncompressed_size,
            on_progress,
        }
    }

    /// Create (or truncate) the destination on first use in this pass.
    async fn open(&mut self) -> Result<&mut fs::File> {
        if self.file.is_none() {
            let file = fs::File::create(self.destination)
                .await
                .map_err(|e| Error::write(self.destination, e))?;
            self.created = true;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::write(self.destination, std::io::ErrorKind::NotConnected.into()))
    }

    async fn emit(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let destination = self.destination;
        self.open()
            .await?
            .write_all(data)
            .await
            .map_err(|e| Error::write(destination, e))?;
        self.crc.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush the inflater and the file.
    ///
    /// A deflate stream must produce exactly the size recorded in the central
    /// directory; the decoder alone does not notice a stream cut short.
    async fn finish(&mut self) -> Result<()> {
        if let Some(inflater) = self.inflater.as_mut() {
            if self.received > 0 {
                inflater.try_finish().map_err(corrupt_stream)?;
                let tail = std::mem::take(inflater.get_mut());
                self.emit(&tail).await?;
            }
            if self.written != self.expected_size {
                return Err(Error::Format(format!(
                    "deflate stream ended after {} of {} bytes",
                    self.written, self.expected_size
                )));
            }
        }

        let destination = self.destination;
        self.open()
            .await?
            .flush()
            .await
            .map_err(|e| Error::write(destination, e))?;
        Ok(())
    }

    /// Compare the output against the central directory's size and CRC-32.
    fn verify(&self, entry: &CentralDirectoryEntry) -> Result<()> {
        let written = self.written;
        if written != entry.uncompressed_size {
            return Err(Error::Integrity {
                name: entry.file_name.clone(),
                reason: format!(
                    "size {written} does not match expected {}",
                    entry.uncompressed_size
                ),
            });
        }
        if self.crc.sum() != entry.crc32 {
            return Err(Error::Integrity {
                name: entry.file_name.clone(),
                reason: format!(
                    "CRC-32 {:08x} does not match expected {:08x}",
                    self.crc.sum(),
                    entry.crc32
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RangeSink for MemberSink<'_> {
    async fn restart(&mut self) -> Result<()> {
        // Reopened with truncation on the next write
        self.file = None;
        self.inflater = match self.method {
            CompressionMethod::Deflate => Some(DeflateDecoder::new(Vec::new())),
            _ => None,
        };
        self.crc.reset();
        self.received = 0;
        self.written = 0;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.received += chunk.len() as u64;

        match self.inflater.as_mut() {
            Some(inflater) => {
                inflater.write_all(chunk).map_err(corrupt_stream)?;
                let out = std::mem::take(inflater.get_mut());
                self.emit(&out).await?;
            }
            None => self.emit(chunk).await?,
        }

        if let Some(cb) = self.on_progress {
            cb(self.received, self.total);
        }
        Ok(())
    }
}

fn corrupt_stream(e: std::io::Error) -> Error {
    Error::Format(format!("corrupt deflate stream: {e}"))
}

/// Write the member described by `entry` and `range` to `destination`.
///
/// The range is fetched with a single request and decompressed as it
/// arrives. If anything fails after the output was created, the output is
/// removed; a file that was already at `destination` and never opened by
/// this call is left as it was. Empty members produce an empty file without
/// touching `reader`.
pub async fn extract_member<R: ReadAt + ?Sized>(
    reader: &R,
    entry: &CentralDirectoryEntry,
    range: ResolvedRange,
    destination: &Path,
    verify: bool,
    on_progress: Option<&ProgressCallback<'_>>,
) -> Result<u64> {
    entry.compression_method.ensure_supported()?;

    // Create parent directories if needed
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::write(parent, e))?;
    }

    let mut sink = MemberSink::new(destination, entry, range.size, on_progress);
    let result = materialize(reader, entry, range, verify, &mut sink).await;
    let (written, created) = (sink.written, sink.created);
    drop(sink);

    match result {
        Ok(()) => {
            tracing::info!(
                member = %entry.file_name,
                destination = %destination.display(),
                bytes = written,
                "Member extracted"
            );
            Ok(written)
        }
        Err(e) if !created => Err(e),
        Err(e) => {
            if let Err(rm) = fs::remove_file(destination).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(error = %rm, destination = %destination.display(), "Failed to remove partial output");
            }
            Err(e)
        }
    }
}

async fn materialize<R: ReadAt + ?Sized>(
    reader: &R,
    entry: &CentralDirectoryEntry,
    range: ResolvedRange,
    verify: bool,
    sink: &mut MemberSink<'_>,
) -> Result<()> {
    if range.is_empty() {
        sink.restart().await?;
    } else {
        reader.copy_range(range.start, range.size, &mut *sink).await?;
    }
    sink.finish().await?;

    if verify {
        sink.verify(entry)?;
    }
    Ok(())
}
