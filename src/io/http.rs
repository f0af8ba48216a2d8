use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderValue, LAST_MODIFIED, RANGE,
    REFERER,
};
use reqwest::{Client, Response, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{RangeSink, ReadAt};
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::retry::Retrier;
use crate::types::ProgressCallback;

/// Byte-addressable view of a remote object served over HTTP
///
/// Nothing can be read until [`initialize`](Self::initialize) has probed the
/// object's size. Every ranged read is a single, independent `Range` request;
/// a retried read re-issues the full range.
pub struct RemoteFileHandle {
    client: Client,
    url: String,
    config: FetchConfig,
    cancel: CancellationToken,
    size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    accepts_ranges: bool,
    transferred_bytes: AtomicU64,
    range_requests: AtomicU64,
}

/// Result of a metadata probe
struct Probe {
    length: Option<u64>,
    accepts_ranges: bool,
    last_modified: Option<DateTime<Utc>>,
}

impl RemoteFileHandle {
    /// Create an uninitialized handle for `url`
    pub fn new(
        url: impl Into<String>,
        config: FetchConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = &config.referer {
            let value = HeaderValue::from_str(referer)
                .map_err(|e| Error::Config(format!("invalid referer {referer:?}: {e}")))?;
            headers.insert(REFERER, value);
        }

        // Streamed bodies may run far longer than `timeout`; only a stalled
        // read is fatal. Probes and small reads add a whole-request deadline.
        let client = Client::builder()
            .read_timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            config,
            cancel,
            size: None,
            last_modified: None,
            accepts_ranges: false,
            transferred_bytes: AtomicU64::new(0),
            range_requests: AtomicU64::new(0),
        })
    }

    /// Probe the object with a HEAD request and record its size.
    ///
    /// Servers that do not advertise `Accept-Ranges: bytes` are accepted; a
    /// later range fetch against them fails with a range error. When the HEAD
    /// response carries no length, a one-byte range request is used instead.
    pub async fn initialize(&mut self) -> Result<u64> {
        let this = &*self;
        let probe = Retrier::run(&this.config.retry, &this.cancel, "metadata probe", || {
            this.probe_head()
        })
        .await?;

        let size = match probe.length {
            Some(length) => length,
            None => {
                tracing::debug!(url = %this.url, "HEAD response has no length, probing with a range request");
                Retrier::run(&this.config.retry, &this.cancel, "size probe", || {
                    this.probe_range()
                })
                .await?
            }
        };

        if !probe.accepts_ranges {
            tracing::warn!(
                url = %self.url,
                "Server does not advertise byte range support, continuing anyway"
            );
        }

        tracing::info!(
            url = %self.url,
            size,
            accepts_ranges = probe.accepts_ranges,
            last_modified = ?probe.last_modified,
            "Remote object probed"
        );

        self.size = Some(size);
        self.accepts_ranges = probe.accepts_ranges;
        self.last_modified = probe.last_modified;
        Ok(size)
    }

    async fn probe_head(&self) -> Result<Probe> {
        let resp = self
            .client
            .head(&self.url)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let resp = self.require_success(resp)?;
        let headers = resp.headers();

        // Read the header directly: the body length of a HEAD response is 0.
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("bytes"));
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        Ok(Probe {
            length,
            accepts_ranges,
            last_modified,
        })
    }

    async fn probe_range(&self) -> Result<u64> {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.config.timeout)
            .send()
            .await?;

        let status = resp.status();
        let total = if status == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else if status.is_success() {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        } else {
            return Err(self.status_error(status));
        };

        total.ok_or_else(|| {
            Error::Range(format!("{} did not report its size", self.url))
        })
    }

    /// Fetch the inclusive byte range `start..=end`.
    ///
    /// Bounds are checked before any request is made.
    pub async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self.check_bounds(start, end)?;
        Retrier::run(&self.config.retry, &self.cancel, "range fetch", || {
            self.fetch_range_once(start, end)
        })
        .await
    }

    async fn fetch_range_once(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let resp = self
            .send_range(start, end, Some(self.config.timeout))
            .await?;
        let body = resp.bytes().await?;

        let expected = end - start + 1;
        let received = body.len() as u64;
        self.transferred_bytes.fetch_add(received, Ordering::Relaxed);
        if received < expected {
            return Err(Error::Truncated { expected, received });
        }

        let mut data = body.to_vec();
        data.truncate(expected as usize);
        Ok(data)
    }

    async fn stream_range_once(
        &self,
        start: u64,
        end: u64,
        sink: &mut dyn RangeSink,
    ) -> Result<()> {
        let mut resp = self.send_range(start, end, None).await?;
        sink.restart().await?;

        let expected = end - start + 1;
        let mut received = 0u64;
        while received < expected {
            let Some(chunk) = resp.chunk().await? else {
                break;
            };
            let take = (chunk.len() as u64).min(expected - received) as usize;
            sink.write_chunk(&chunk[..take]).await?;
            received += take as u64;
            self.transferred_bytes
                .fetch_add(take as u64, Ordering::Relaxed);
        }

        if received < expected {
            return Err(Error::Truncated { expected, received });
        }
        Ok(())
    }

    /// Issue a range GET. `deadline` bounds the whole request including the
    /// body; without one only the client's idle read timeout applies.
    async fn send_range(
        &self,
        start: u64,
        end: u64,
        deadline: Option<Duration>,
    ) -> Result<Response> {
        tracing::debug!(url = %self.url, start, end, "Fetching byte range");
        self.range_requests.fetch_add(1, Ordering::Relaxed);

        let mut request = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={start}-{end}"));
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if status == StatusCode::PARTIAL_CONTENT {
            Ok(resp)
        } else if status.is_success() {
            Err(Error::Range(format!(
                "server ignored the range request for bytes {start}-{end} (status {status})"
            )))
        } else {
            Err(self.status_error(status))
        }
    }

    /// Download the whole object to `destination` in one streamed request.
    ///
    /// Progress is reported as `(bytes written, total)` after every chunk,
    /// with `total` 0 when unknown. A failure mid-stream aborts and may leave
    /// an incomplete file behind.
    pub async fn download(
        &self,
        destination: &Path,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<u64> {
        let mut resp = Retrier::run(&self.config.retry, &self.cancel, "download", || async {
            let resp = self.client.get(&self.url).send().await?;
            self.require_success(resp)
        })
        .await?;

        let expected = self.size.or_else(|| {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        });
        let total = expected.unwrap_or(0);

        tracing::info!(url = %self.url, destination = %destination.display(), total, "Downloading");

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| Error::write(destination, e))?;

        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = resp.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| Error::write(destination, e))?;
            written += chunk.len() as u64;
            self.transferred_bytes
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);

            if let Some(cb) = on_progress {
                cb(written, total);
            }
        }

        file.flush().await.map_err(|e| Error::write(destination, e))?;

        if let Some(expected) = expected
            && written != expected
        {
            return Err(Error::Truncated {
                expected,
                received: written,
            });
        }

        Ok(written)
    }

    fn check_bounds(&self, start: u64, end: u64) -> Result<()> {
        let size = self.size.ok_or(Error::NotInitialized)?;
        if start > end {
            return Err(Error::Range(format!("start {start} is after end {end}")));
        }
        if end >= size {
            return Err(Error::Range(format!(
                "end {end} is beyond the object size {size}"
            )));
        }
        Ok(())
    }

    fn require_success(&self, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(self.status_error(status))
        }
    }

    fn status_error(&self, status: StatusCode) -> Error {
        Error::Status {
            status: status.as_u16(),
            url: self.url.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Size reported by the probe, `None` before initialization
    pub fn content_length(&self) -> Option<u64> {
        self.size
    }

    /// `Last-Modified` reported by the probe
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Whether the server advertised `Accept-Ranges: bytes`
    pub fn accepts_ranges(&self) -> bool {
        self.accepts_ranges
    }

    pub fn is_initialized(&self) -> bool {
        self.size.is_some()
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Number of range requests issued, including retries
    pub fn range_requests(&self) -> u64 {
        self.range_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReadAt for RemoteFileHandle {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let size = self.size.ok_or(Error::NotInitialized)?;
        if offset >= size {
            return Ok(0);
        }

        let end = (offset + buf.len() as u64 - 1).min(size - 1);
        let data = self.read(offset, end).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    async fn copy_range(&self, offset: u64, len: u64, sink: &mut dyn RangeSink) -> Result<()> {
        if len == 0 {
            return sink.restart().await;
        }

        let end = offset
            .checked_add(len - 1)
            .ok_or_else(|| Error::Range(format!("range at {offset} of {len} bytes overflows")))?;
        self.check_bounds(offset, end)?;

        let mut retrier = Retrier::new(&self.config.retry, &self.cancel, "range fetch");
        loop {
            match retrier
                .guard(self.stream_range_once(offset, end, &mut *sink))
                .await
            {
                Ok(()) => {
                    retrier.succeeded();
                    return Ok(());
                }
                Err(e) => retrier.on_error(e).await?,
            }
        }
    }
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`)
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Total length from a `Content-Range: bytes 0-0/1234` header
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
