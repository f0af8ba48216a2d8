//! Central directory index.
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) by scanning the file's tail
//! 2. If ZIP64, follow the locator to the ZIP64 EOCD for 64-bit values
//! 3. Read the Central Directory in one request and parse every entry
//! 4. For extraction, read the member's Local File Header to find its data
//!
//! Only the tail, the directory and one local header per extracted member
//! are ever fetched, which keeps remote extraction to a handful of range
//! requests.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::io::{ReadAt, RemoteStream};

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Parsed central directory of one archive
///
/// An index only exists once the whole directory parsed cleanly; there is no
/// partially built state.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    entries: Vec<CentralDirectoryEntry>,
    by_name: HashMap<String, usize>,
    archive_size: u64,
    zip64: bool,
}

impl ArchiveIndex {
    /// Locate and parse the central directory of the object behind `stream`.
    pub async fn build<R: ReadAt + ?Sized>(stream: &mut RemoteStream<R>) -> Result<Self> {
        let archive_size = stream.len();
        let (eocd, eocd_offset) = find_eocd(stream).await?;

        let (cd_offset, cd_size, total_entries, zip64) = if eocd.may_be_zip64() {
            match read_zip64_eocd(stream, eocd_offset).await? {
                Some(eocd64) => (
                    eocd64.cd_offset,
                    eocd64.cd_size,
                    eocd64.total_entries,
                    true,
                ),
                None if eocd.requires_zip64() => {
                    return Err(Error::Format(
                        "directory offset requires ZIP64 but no ZIP64 locator is present".into(),
                    ));
                }
                // Saturated counts without a locator: take the 32-bit values as they are
                None => (
                    eocd.cd_offset as u64,
                    eocd.cd_size as u64,
                    eocd.total_entries as u64,
                    false,
                ),
            }
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
                false,
            )
        };

        let cd_end = cd_offset
            .checked_add(cd_size)
            .filter(|end| *end <= eocd_offset)
            .ok_or_else(|| {
                Error::Format(format!(
                    "central directory at {cd_offset} ({cd_size} bytes) overlaps the end record at {eocd_offset}"
                ))
            })?;
        if total_entries.saturating_mul(CDFH_MIN_SIZE as u64) > cd_size {
            return Err(Error::Format(format!(
                "{total_entries} entries cannot fit in a {cd_size}-byte central directory"
            )));
        }

        tracing::debug!(cd_offset, cd_end, total_entries, zip64, "Reading central directory");

        // Read the entire Central Directory in one request
        let cd_len = usize::try_from(cd_size)
            .map_err(|_| Error::Format(format!("central directory of {cd_size} bytes is too large")))?;
        let cd_data = stream.read_exact_at(cd_offset, cd_len).await?;
        let entries = parse_central_directory(&cd_data, total_entries)?;

        let mut by_name = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            by_name.entry(entry.file_name.clone()).or_insert(i);
        }

        tracing::info!(entries = entries.len(), zip64, archive_size, "Archive index built");

        Ok(Self {
            entries,
            by_name,
            archive_size,
            zip64,
        })
    }

    /// All entries in archive order
    pub fn entries(&self) -> &[CentralDirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the directory was located through ZIP64 records
    pub fn is_zip64(&self) -> bool {
        self.zip64
    }

    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    /// Entry with exactly this name
    pub fn get(&self, name: &str) -> Option<&CentralDirectoryEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Find a member by exact name, or by basename when exactly one file
    /// carries it (`boot.img` matches `IMAGES/boot.img`).
    pub fn lookup(&self, name: &str) -> Result<&CentralDirectoryEntry> {
        if let Some(entry) = self.get(name) {
            return Ok(entry);
        }

        let mut matches = self
            .entries
            .iter()
            .filter(|e| !e.is_directory && e.basename() == name);
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry),
            (Some(_), Some(_)) => Err(Error::NotFound(format!(
                "{name} is ambiguous: several members share that name"
            ))),
            _ => Err(Error::NotFound(format!("{name} is not in the archive"))),
        }
    }

    /// Resolve the byte range holding `name`'s compressed data.
    pub async fn get_file_range<R: ReadAt + ?Sized>(
        &self,
        stream: &mut RemoteStream<R>,
        name: &str,
    ) -> Result<ResolvedRange> {
        let entry = self.lookup(name)?;
        self.resolve_range(stream, entry).await
    }

    /// Resolve the byte range of `entry` by reading its Local File Header.
    ///
    /// The local header's extra field may differ in length from the central
    /// directory's copy, so the data offset is only known after this read.
    pub async fn resolve_range<R: ReadAt + ?Sized>(
        &self,
        stream: &mut RemoteStream<R>,
        entry: &CentralDirectoryEntry,
    ) -> Result<ResolvedRange> {
        if entry.is_directory {
            return Err(Error::Format(format!(
                "{} is a directory entry",
                entry.file_name
            )));
        }
        entry.compression_method.ensure_supported()?;

        // Header plus the name, in one read
        let offset = i64::try_from(entry.local_header_offset).map_err(|_| {
            Error::Format(format!(
                "local header offset {} out of range",
                entry.local_header_offset
            ))
        })?;
        stream.seek(offset, crate::io::Whence::Set).map_err(|_| {
            Error::Format(format!(
                "local header of {} at {} lies outside the archive",
                entry.file_name, entry.local_header_offset
            ))
        })?;
        let bytes = stream
            .read(LocalFileHeader::SIZE + entry.file_name.len())
            .await?;
        let header = LocalFileHeader::from_bytes(&bytes)?;

        let name_end = LocalFileHeader::SIZE + header.file_name_length as usize;
        if let Some(local_name) = bytes.get(LocalFileHeader::SIZE..name_end)
            && String::from_utf8_lossy(local_name) != entry.file_name
        {
            return Err(Error::Format(format!(
                "local header name {:?} does not match central directory name {:?}",
                String::from_utf8_lossy(local_name),
                entry.file_name
            )));
        }

        let start = entry.local_header_offset + header.data_offset();
        let data_end = start.checked_add(entry.compressed_size);
        if data_end.is_none_or(|end| end > self.archive_size) {
            return Err(Error::Format(format!(
                "data of {} ({} bytes at {start}) extends past the end of the archive",
                entry.file_name, entry.compressed_size
            )));
        }

        let range = ResolvedRange::new(start, entry.compressed_size);
        tracing::debug!(
            member = %entry.file_name,
            start = range.start,
            end = range.end,
            size = range.size,
            "Resolved member range"
        );
        Ok(range)
    }
}

/// Find and parse the End of Central Directory record.
///
/// The EOCD may be followed by a comment of up to 65535 bytes, so the tail of
/// the object is scanned backwards for the signature. A candidate whose
/// comment length exactly reaches the end of the object is preferred; failing
/// that, the last signature found is used.
async fn find_eocd<R: ReadAt + ?Sized>(
    stream: &mut RemoteStream<R>,
) -> Result<(EndOfCentralDirectory, u64)> {
    let size = stream.len();
    if size < EndOfCentralDirectory::SIZE as u64 {
        return Err(Error::NotAnArchive(format!(
            "{size} bytes is too small to hold an End of Central Directory record"
        )));
    }

    let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(size);
    let search_start = size - search_size;
    let buf = stream
        .read_exact_at(search_start, search_size as usize)
        .await?;

    let signature = EndOfCentralDirectory::SIGNATURE.to_le_bytes();
    let mut fallback = None;

    // Search backwards for EOCD signature (PK\x05\x06)
    for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
        if buf[i..i + 4] != signature {
            continue;
        }

        let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
        if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
            let eocd =
                EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
            return Ok((eocd, search_start + i as u64));
        }
        if fallback.is_none() {
            fallback = Some(i);
        }
    }

    match fallback {
        Some(i) => {
            tracing::warn!(
                offset = search_start + i as u64,
                "End of Central Directory comment length does not reach end of file"
            );
            let eocd = EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
            Ok((eocd, search_start + i as u64))
        }
        None => Err(Error::NotAnArchive(format!(
            "no End of Central Directory signature in the last {search_size} bytes"
        ))),
    }
}

/// Read the ZIP64 End of Central Directory record, if a locator precedes the EOCD.
async fn read_zip64_eocd<R: ReadAt + ?Sized>(
    stream: &mut RemoteStream<R>,
    eocd_offset: u64,
) -> Result<Option<Zip64Eocd>> {
    // The ZIP64 EOCD Locator is located immediately before the regular EOCD
    let Some(locator_offset) = eocd_offset.checked_sub(Zip64EocdLocator::SIZE as u64) else {
        return Ok(None);
    };
    let locator_buf = stream
        .read_exact_at(locator_offset, Zip64EocdLocator::SIZE)
        .await?;
    if locator_buf[..4] != Zip64EocdLocator::SIGNATURE.to_le_bytes() {
        return Ok(None);
    }
    let locator = Zip64EocdLocator::from_bytes(&locator_buf)?;

    let record_end = locator
        .eocd64_offset
        .checked_add(Zip64Eocd::MIN_SIZE as u64);
    if record_end.is_none_or(|end| end > locator_offset) {
        return Err(Error::Format(format!(
            "ZIP64 End of Central Directory offset {} is out of bounds",
            locator.eocd64_offset
        )));
    }

    let eocd64_buf = stream
        .read_exact_at(locator.eocd64_offset, Zip64Eocd::MIN_SIZE)
        .await?;
    Zip64Eocd::from_bytes(&eocd64_buf).map(Some)
}

/// Parse exactly `total_entries` headers; they must consume the whole buffer.
fn parse_central_directory(cd: &[u8], total_entries: u64) -> Result<Vec<CentralDirectoryEntry>> {
    let capacity = usize::try_from(total_entries).unwrap_or(0);
    let mut entries = Vec::with_capacity(capacity);
    let mut cursor = Cursor::new(cd);

    for index in 0..total_entries {
        entries.push(parse_cdfh(&mut cursor, index)?);
    }

    let consumed = cursor.position();
    if consumed != cd.len() as u64 {
        return Err(Error::Format(format!(
            "central directory declares {} bytes but {total_entries} entries use {consumed}",
            cd.len()
        )));
    }

    Ok(entries)
}

/// Parse a Central Directory File Header from a cursor.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>, index: u64) -> Result<CentralDirectoryEntry> {
    let start = cursor.position();
    let total = cursor.get_ref().len() as u64;
    let overrun = |what: &str| {
        Error::Format(format!(
            "central directory entry {index} at {start} overruns the directory ({what})"
        ))
    };

    if total - start < CDFH_MIN_SIZE as u64 {
        return Err(overrun("fixed header"));
    }

    // Read and verify the signature (PK\x01\x02)
    let sig = cursor.read_u32::<LittleEndian>()?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::Format(format!(
            "invalid Central Directory File Header signature 0x{sig:08X} for entry {index}"
        )));
    }

    // Read fixed-size header fields
    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
    let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;
    let file_comment_length = cursor.read_u16::<LittleEndian>()? as u64;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut local_header_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let name_start = cursor.position();
    let extra_start = name_start + file_name_length;
    let extra_end = extra_start + extra_field_length;
    let entry_end = extra_end + file_comment_length;
    if entry_end > total {
        return Err(overrun("variable-length fields"));
    }

    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let data = *cursor.get_ref();
    let file_name =
        String::from_utf8_lossy(&data[name_start as usize..extra_start as usize]).into_owned();

    // Directory entries end with '/'
    let is_directory = file_name.ends_with('/');

    // Walk the extra field looking for ZIP64 extended information.
    // Its values are present only where the header field is saturated.
    let mut extra = Cursor::new(&data[extra_start as usize..extra_end as usize]);
    let extra_len = extra_field_length;
    while extra.position() + 4 <= extra_len {
        let header_id = extra.read_u16::<LittleEndian>()?;
        let field_size = extra.read_u16::<LittleEndian>()? as u64;
        let field_end = (extra.position() + field_size).min(extra_len);

        if header_id == ZIP64_EXTRA_ID {
            if uncompressed_size == u32::MAX as u64 && extra.position() + 8 <= field_end {
                uncompressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if compressed_size == u32::MAX as u64 && extra.position() + 8 <= field_end {
                compressed_size = extra.read_u64::<LittleEndian>()?;
            }
            if local_header_offset == u32::MAX as u64 && extra.position() + 8 <= field_end {
                local_header_offset = extra.read_u64::<LittleEndian>()?;
            }
        }
        extra.set_position(field_end);
    }

    // Skip the file comment
    cursor.set_position(entry_end);

    Ok(CentralDirectoryEntry {
        file_name,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        local_header_offset,
        last_mod_time,
        last_mod_date,
        is_directory,
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use std::io::Write;
    use std::sync::Arc;

    fn build_zip(members: &[(&str, &[u8], zip::CompressionMethod)], comment: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, method) in members {
            let options = zip::write::SimpleFileOptions::default().compression_method(*method);
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.set_comment(comment.to_string());
        writer.finish().unwrap().into_inner()
    }

    fn stream_over(data: Vec<u8>) -> RemoteStream<MemoryReader> {
        RemoteStream::new(Arc::new(MemoryReader::new(data)))
    }

    #[tokio::test]
    async fn indexes_members_in_archive_order() {
        let bytes = build_zip(
            &[
                ("boot.img", b"boot image", zip::CompressionMethod::Stored),
                ("system.img", &[7u8; 4096], zip::CompressionMethod::Deflated),
                ("META/", b"", zip::CompressionMethod::Stored),
            ],
            "",
        );
        let mut stream = stream_over(bytes);
        let index = ArchiveIndex::build(&mut stream).await.unwrap();

        let names: Vec<_> = index.entries().iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["boot.img", "system.img", "META/"]);
        assert!(!index.is_zip64());

        let system = index.get("system.img").unwrap();
        assert_eq!(system.compression_method, CompressionMethod::Deflate);
        assert_eq!(system.uncompressed_size, 4096);
        assert!(index.get("META/").unwrap().is_directory);
    }

    #[tokio::test]
    async fn range_points_at_stored_bytes() {
        let bytes = build_zip(
            &[("boot.img", b"boot image", zip::CompressionMethod::Stored)],
            "",
        );
        let mut stream = stream_over(bytes.clone());
        let index = ArchiveIndex::build(&mut stream).await.unwrap();

        let range = index.get_file_range(&mut stream, "boot.img").await.unwrap();
        assert_eq!(range.size, 10);
        assert_eq!(
            &bytes[range.start as usize..=range.end as usize],
            b"boot image"
        );
    }

    #[tokio::test]
    async fn finds_eocd_behind_comment() {
        let comment = "c".repeat(1000);
        let bytes = build_zip(&[("a.bin", b"abc", zip::CompressionMethod::Stored)], &comment);
        let mut stream = stream_over(bytes);
        let index = ArchiveIndex::build(&mut stream).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn lookup_by_unique_basename() {
        let bytes = build_zip(
            &[
                ("IMAGES/boot.img", b"1", zip::CompressionMethod::Stored),
                ("a/vendor.img", b"2", zip::CompressionMethod::Stored),
                ("b/vendor.img", b"3", zip::CompressionMethod::Stored),
            ],
            "",
        );
        let mut stream = stream_over(bytes);
        let index = ArchiveIndex::build(&mut stream).await.unwrap();

        assert_eq!(index.lookup("boot.img").unwrap().file_name, "IMAGES/boot.img");
        assert!(matches!(index.lookup("vendor.img"), Err(Error::NotFound(_))));
        assert!(matches!(index.lookup("recovery.img"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn non_zip_data_is_not_an_archive() {
        let mut stream = stream_over(b"RAWIMAGE".repeat(512));
        let err = ArchiveIndex::build(&mut stream).await.unwrap_err();
        assert!(matches!(err, Error::NotAnArchive(_)));

        let mut tiny = stream_over(b"PK".to_vec());
        assert!(matches!(
            ArchiveIndex::build(&mut tiny).await.unwrap_err(),
            Error::NotAnArchive(_)
        ));
    }

    #[tokio::test]
    async fn entry_count_mismatch_is_a_format_error() {
        let mut bytes = build_zip(
            &[
                ("a.bin", b"a", zip::CompressionMethod::Stored),
                ("b.bin", b"b", zip::CompressionMethod::Stored),
            ],
            "",
        );
        // EOCD is the final 22 bytes; claim one entry instead of two
        let eocd = bytes.len() - 22;
        bytes[eocd + 8..eocd + 10].copy_from_slice(&1u16.to_le_bytes());
        bytes[eocd + 10..eocd + 12].copy_from_slice(&1u16.to_le_bytes());

        let mut stream = stream_over(bytes);
        let err = ArchiveIndex::build(&mut stream).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[tokio::test]
    async fn corrupt_directory_signature_is_a_format_error() {
        let mut bytes = build_zip(&[("a.bin", b"a", zip::CompressionMethod::Stored)], "");
        let eocd = bytes.len() - 22;
        let cd_offset =
            u32::from_le_bytes(bytes[eocd + 16..eocd + 20].try_into().unwrap()) as usize;
        bytes[cd_offset] = b'X';

        let mut stream = stream_over(bytes);
        let err = ArchiveIndex::build(&mut stream).await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[tokio::test]
    async fn directory_entries_cannot_be_resolved() {
        let bytes = build_zip(&[("META/", b"", zip::CompressionMethod::Stored)], "");
        let mut stream = stream_over(bytes);
        let index = ArchiveIndex::build(&mut stream).await.unwrap();
        let err = index.get_file_range(&mut stream, "META/").await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn zip64_extra_field_overrides_saturated_values() {
        let name = b"big.img";
        let mut extra = Vec::new();
        extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
        extra.extend_from_slice(&24u16.to_le_bytes());
        extra.extend_from_slice(&0x1_2345_6789u64.to_le_bytes()); // uncompressed
        extra.extend_from_slice(&0x1_0000_0000u64.to_le_bytes()); // compressed
        extra.extend_from_slice(&0x2_0000_0000u64.to_le_bytes()); // offset

        let mut cd = Vec::new();
        cd.extend_from_slice(&CDFH_SIGNATURE.to_le_bytes());
        cd.extend_from_slice(&[45, 0, 45, 0, 0, 0]); // made by, needed, flags
        cd.extend_from_slice(&0u16.to_le_bytes()); // stored
        cd.extend_from_slice(&[0, 0, 0, 0]); // time, date
        cd.extend_from_slice(&0u32.to_le_bytes()); // crc
        cd.extend_from_slice(&u32::MAX.to_le_bytes());
        cd.extend_from_slice(&u32::MAX.to_le_bytes());
        cd.extend_from_slice(&(name.len() as u16).to_le_bytes());
        cd.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        cd.extend_from_slice(&0u16.to_le_bytes()); // comment
        cd.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]); // disk, internal, external
        cd.extend_from_slice(&u32::MAX.to_le_bytes());
        cd.extend_from_slice(name);
        cd.extend_from_slice(&extra);

        let entries = parse_central_directory(&cd, 1).unwrap();
        assert_eq!(entries[0].uncompressed_size, 0x1_2345_6789);
        assert_eq!(entries[0].compressed_size, 0x1_0000_0000);
        assert_eq!(entries[0].local_header_offset, 0x2_0000_0000);

        // One trailing byte the entries do not account for
        cd.push(0);
        assert!(matches!(
            parse_central_directory(&cd, 1),
            Err(Error::Format(_))
        ));
    }
}
