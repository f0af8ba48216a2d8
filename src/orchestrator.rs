//! Source classification and extraction strategy.
//!
//! A source is opened as a random-access reader (remote, cached or local) and
//! first treated as a ZIP archive. When no end record is found the whole
//! object is either an update payload, handed to the configured
//! [`PayloadResolver`], or the raw image itself.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::ArchiveCache;
use crate::config::{ExtractorConfig, FetchConfig};
use crate::error::{Error, Result};
use crate::io::{LocalFileReader, ReadAt, RemoteFileHandle, RemoteStream};
use crate::payload::{self, PAYLOAD_MEMBER_NAME, PayloadResolver, PayloadSource};
use crate::types::{ExtractionRequest, ExtractionResult, ProgressCallback, SourceLocator};
use crate::zip::{ArchiveIndex, CentralDirectoryEntry, CompressionMethod, extract_member};

/// A source opened for random access
enum OpenedSource {
    Remote(Arc<RemoteFileHandle>),
    Local(Arc<LocalFileReader>),
}

impl OpenedSource {
    fn reader(&self) -> Arc<dyn ReadAt> {
        match self {
            OpenedSource::Remote(handle) => handle.clone() as Arc<dyn ReadAt>,
            OpenedSource::Local(reader) => reader.clone() as Arc<dyn ReadAt>,
        }
    }

    fn log_transfer(&self) {
        if let OpenedSource::Remote(handle) = self {
            tracing::info!(
                url = %handle.url(),
                transferred_bytes = handle.transferred_bytes(),
                range_requests = handle.range_requests(),
                "Transfer complete"
            );
        }
    }
}

/// Entry point for extracting partitions from archives, payloads and images
///
/// Every call owns its own [`RemoteFileHandle`]; nothing is shared between
/// calls except the configuration and the cancellation token.
pub struct ExtractionOrchestrator {
    config: ExtractorConfig,
    payload_resolver: Option<Arc<dyn PayloadResolver>>,
    cancel: CancellationToken,
}

impl ExtractionOrchestrator {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            payload_resolver: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Resolver used for update payloads. Without one, payload sources fail.
    pub fn with_payload_resolver(mut self, resolver: Arc<dyn PayloadResolver>) -> Self {
        self.payload_resolver = Some(resolver);
        self
    }

    /// Cancelling `token` aborts in-flight requests and backoff sleeps.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract `request.member` from `request.source` into `request.destination`.
    ///
    /// Never fails across this boundary: errors are classified into the
    /// returned [`ExtractionResult`].
    pub async fn extract_partition(
        &self,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> ExtractionResult {
        tracing::info!(
            source = %request.source,
            member = %request.member,
            destination = %request.destination.display(),
            "Extracting partition"
        );

        let result = self.try_extract(request, on_progress).await;
        if let Err(e) = &result {
            tracing::warn!(source = %request.source, member = %request.member, kind = %e.kind(), error = %e, "Extraction failed");
        }
        result.into()
    }

    /// Download the whole object at `url` to `destination`.
    pub async fn download_partition_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> ExtractionResult {
        let result = self.try_download(url, destination, on_progress).await;
        if let Err(e) = &result {
            tracing::warn!(url, kind = %e.kind(), error = %e, "Download failed");
        }
        result.into()
    }

    /// Central directory entries of the archive at `source`, in archive order.
    pub async fn list_members(&self, source: &str) -> Result<Vec<CentralDirectoryEntry>> {
        let locator = SourceLocator::parse(source);
        let opened = self.open(&locator, self.config.fetch.clone(), None).await?;
        let mut stream = RemoteStream::new(opened.reader());
        let index = ArchiveIndex::build(&mut stream).await?;
        Ok(index.entries().to_vec())
    }

    async fn try_extract(
        &self,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let locator = SourceLocator::parse(&request.source);
        let mut fetch = self.config.fetch.clone();
        if let Some(timeout) = request.options.timeout {
            fetch.timeout = timeout;
        }

        let opened = self.open(&locator, fetch, on_progress).await?;
        let mut stream = RemoteStream::new(opened.reader());

        let result = match ArchiveIndex::build(&mut stream).await {
            Ok(index) => {
                self.extract_from_archive(&index, &mut stream, request, on_progress)
                    .await
            }
            Err(Error::NotAnArchive(reason)) => {
                tracing::info!(source = %request.source, reason = %reason, "Source is not a ZIP archive");
                self.extract_from_image(&locator, &opened, request, on_progress)
                    .await
            }
            Err(e) => Err(e),
        };

        opened.log_transfer();
        result
    }

    async fn try_download(
        &self,
        url: &str,
        destination: &Path,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        if !SourceLocator::parse(url).is_remote() {
            return Err(Error::Config(format!("{url} is not an http(s) URL")));
        }

        let mut handle = RemoteFileHandle::new(url, self.config.fetch.clone(), self.cancel.clone())?;
        handle.initialize().await?;
        create_parent_dirs(destination).await?;
        handle.download(destination, on_progress).await?;
        Ok(())
    }

    /// Open `locator` for random access. Remote sources are probed, and
    /// downloaded into the cache first when one is configured.
    async fn open(
        &self,
        locator: &SourceLocator,
        fetch: FetchConfig,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<OpenedSource> {
        match locator {
            SourceLocator::Remote(url) => {
                let mut handle = RemoteFileHandle::new(url.as_str(), fetch, self.cancel.clone())?;
                handle.initialize().await?;

                match &self.config.cache_dir {
                    Some(dir) => {
                        let path = ArchiveCache::new(dir).fetch(&handle, on_progress).await?;
                        Ok(OpenedSource::Local(Arc::new(LocalFileReader::new(&path)?)))
                    }
                    None => Ok(OpenedSource::Remote(Arc::new(handle))),
                }
            }
            SourceLocator::Local(path) => {
                Ok(OpenedSource::Local(Arc::new(LocalFileReader::new(path)?)))
            }
        }
    }

    async fn extract_from_archive(
        &self,
        index: &ArchiveIndex,
        stream: &mut RemoteStream<dyn ReadAt>,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        let entry = match index.lookup(&request.member) {
            Ok(entry) => entry,
            Err(Error::NotFound(reason)) => {
                // OTA zips carry partitions inside a payload member
                if let Some(payload_entry) = index.get(PAYLOAD_MEMBER_NAME) {
                    tracing::info!(member = %request.member, "Member not in archive, trying the update payload");
                    return self
                        .extract_from_payload_member(index, payload_entry, stream, request, on_progress)
                        .await;
                }
                return Err(Error::NotFound(reason));
            }
            Err(e) => return Err(e),
        };

        let range = index.resolve_range(stream, entry).await?;
        let reader = stream.get_ref().clone();
        extract_member(
            reader.as_ref(),
            entry,
            range,
            &request.destination,
            request.options.verify,
            on_progress,
        )
        .await?;
        Ok(())
    }

    async fn extract_from_payload_member(
        &self,
        index: &ArchiveIndex,
        entry: &CentralDirectoryEntry,
        stream: &mut RemoteStream<dyn ReadAt>,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        if entry.compression_method != CompressionMethod::Stored {
            return Err(Error::Unsupported(format!(
                "{} is compressed and cannot be read in place",
                entry.file_name
            )));
        }

        let range = index.resolve_range(stream, entry).await?;
        let reader = stream.get_ref().clone();
        let header = payload::read_header(reader.as_ref(), range.start)
            .await?
            .ok_or_else(|| {
                Error::Format(format!("{} has no update payload header", entry.file_name))
            })?;

        let source = PayloadSource {
            reader,
            base_offset: range.start,
            length: range.size,
            header,
        };
        self.hand_off(&source, request, on_progress).await
    }

    async fn extract_from_image(
        &self,
        locator: &SourceLocator,
        opened: &OpenedSource,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        let reader = opened.reader();
        if let Some(header) = payload::read_header(reader.as_ref(), 0).await? {
            let length = reader.size();
            let source = PayloadSource {
                reader,
                base_offset: 0,
                length,
                header,
            };
            return self.hand_off(&source, request, on_progress).await;
        }

        if payload::looks_like_payload(locator) {
            return Err(Error::Format(format!(
                "{} is named like an update payload but has no payload header",
                request.source
            )));
        }

        tracing::info!(source = %request.source, "Treating the whole object as the raw image");
        create_parent_dirs(&request.destination).await?;

        let expected = reader.size();
        let written = match opened {
            OpenedSource::Remote(handle) => handle.download(&request.destination, on_progress).await?,
            OpenedSource::Local(local) => {
                let written = tokio::fs::copy(local.path(), &request.destination)
                    .await
                    .map_err(|e| Error::write(&request.destination, e))?;
                if let Some(cb) = on_progress {
                    cb(written, written);
                }
                written
            }
        };

        if request.options.verify && written != expected {
            remove_output(&request.destination).await;
            return Err(Error::Integrity {
                name: request.source.clone(),
                reason: format!("wrote {written} bytes, source has {expected}"),
            });
        }
        Ok(())
    }

    async fn hand_off(
        &self,
        source: &PayloadSource,
        request: &ExtractionRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<()> {
        let Some(resolver) = &self.payload_resolver else {
            return Err(Error::Unsupported(
                "update payloads require a payload resolver".into(),
            ));
        };

        tracing::info!(
            partition = %request.member,
            version = source.header.version,
            base_offset = source.base_offset,
            "Handing off to the payload resolver"
        );
        create_parent_dirs(&request.destination).await?;
        resolver
            .extract_partition(source, &request.member, &request.destination, on_progress)
            .await
    }
}

async fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::write(parent, e))?;
    }
    Ok(())
}

async fn remove_output(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(error = %e, path = %path.display(), "Failed to remove output");
    }
}
