//! Shared fixtures: a ZIP builder and a mock server that honours `Range`.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const DOS_TIME: u16 = 0x6000; // 12:00:00
const DOS_DATE: u16 = 0x5A21; // 2025-01-01

struct Member {
    name: String,
    data: Vec<u8>,
    deflate: bool,
    local_extra: Vec<u8>,
}

/// Hand-rolled ZIP writer for shapes the `zip` crate will not produce
#[derive(Default)]
pub struct ZipFixture {
    members: Vec<Member>,
    comment: Vec<u8>,
    zip64: bool,
}

impl ZipFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.members.push(Member {
            name: name.into(),
            data: data.to_vec(),
            deflate: false,
            local_extra: Vec::new(),
        });
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self.members.push(Member {
            name: name.into(),
            data: data.to_vec(),
            deflate: true,
            local_extra: Vec::new(),
        });
        self
    }

    /// Give the last member a local extra field the central directory lacks
    pub fn local_extra(mut self, extra: &[u8]) -> Self {
        if let Some(member) = self.members.last_mut() {
            member.local_extra = extra.to_vec();
        }
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Saturate the 32-bit fields and emit ZIP64 end records and extra fields
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for member in &self.members {
            let offset = out.len() as u64;
            let payload = if member.deflate {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(&member.data).unwrap();
                enc.finish().unwrap()
            } else {
                member.data.clone()
            };
            let mut crc = flate2::Crc::new();
            crc.update(&member.data);
            let method: u16 = if member.deflate { 8 } else { 0 };

            out.write_u32::<LittleEndian>(0x0403_4B50).unwrap();
            out.write_u16::<LittleEndian>(20).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(method).unwrap();
            out.write_u16::<LittleEndian>(DOS_TIME).unwrap();
            out.write_u16::<LittleEndian>(DOS_DATE).unwrap();
            out.write_u32::<LittleEndian>(crc.sum()).unwrap();
            out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(member.data.len() as u32).unwrap();
            out.write_u16::<LittleEndian>(member.name.len() as u16).unwrap();
            out.write_u16::<LittleEndian>(member.local_extra.len() as u16).unwrap();
            out.extend_from_slice(member.name.as_bytes());
            out.extend_from_slice(&member.local_extra);
            out.extend_from_slice(&payload);

            let mut extra = Vec::new();
            let (csize, usize_, header_offset) = if self.zip64 {
                extra.write_u16::<LittleEndian>(0x0001).unwrap();
                extra.write_u16::<LittleEndian>(24).unwrap();
                extra.write_u64::<LittleEndian>(member.data.len() as u64).unwrap();
                extra.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
                extra.write_u64::<LittleEndian>(offset).unwrap();
                (u32::MAX, u32::MAX, u32::MAX)
            } else {
                (payload.len() as u32, member.data.len() as u32, offset as u32)
            };

            central.write_u32::<LittleEndian>(0x0201_4B50).unwrap();
            central.write_u16::<LittleEndian>(45).unwrap();
            central.write_u16::<LittleEndian>(20).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(method).unwrap();
            central.write_u16::<LittleEndian>(DOS_TIME).unwrap();
            central.write_u16::<LittleEndian>(DOS_DATE).unwrap();
            central.write_u32::<LittleEndian>(crc.sum()).unwrap();
            central.write_u32::<LittleEndian>(csize).unwrap();
            central.write_u32::<LittleEndian>(usize_).unwrap();
            central.write_u16::<LittleEndian>(member.name.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(extra.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(header_offset).unwrap();
            central.extend_from_slice(member.name.as_bytes());
            central.extend_from_slice(&extra);
        }

        let cd_offset = out.len() as u64;
        let cd_size = central.len() as u64;
        let entries = self.members.len() as u64;
        out.extend_from_slice(&central);

        if self.zip64 {
            let eocd64_offset = out.len() as u64;
            out.write_u32::<LittleEndian>(0x0606_4B50).unwrap();
            out.write_u64::<LittleEndian>(44).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(entries).unwrap();
            out.write_u64::<LittleEndian>(entries).unwrap();
            out.write_u64::<LittleEndian>(cd_size).unwrap();
            out.write_u64::<LittleEndian>(cd_offset).unwrap();

            out.write_u32::<LittleEndian>(0x0706_4B50).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(eocd64_offset).unwrap();
            out.write_u32::<LittleEndian>(1).unwrap();
        }

        out.write_u32::<LittleEndian>(0x0605_4B50).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        if self.zip64 {
            out.write_u16::<LittleEndian>(u16::MAX).unwrap();
            out.write_u16::<LittleEndian>(u16::MAX).unwrap();
            out.write_u32::<LittleEndian>(u32::MAX).unwrap();
            out.write_u32::<LittleEndian>(u32::MAX).unwrap();
        } else {
            out.write_u16::<LittleEndian>(entries as u16).unwrap();
            out.write_u16::<LittleEndian>(entries as u16).unwrap();
            out.write_u32::<LittleEndian>(cd_size as u32).unwrap();
            out.write_u32::<LittleEndian>(cd_offset as u32).unwrap();
        }
        out.write_u16::<LittleEndian>(self.comment.len() as u16).unwrap();
        out.extend_from_slice(&self.comment);
        out
    }
}

/// Serves a fixed object: HEAD for metadata, `Range` GETs as 206
#[derive(Clone)]
pub struct RangeResponder {
    data: Arc<Vec<u8>>,
    last_modified: Option<String>,
    honour_ranges: bool,
    cut_short: Option<(u64, Arc<AtomicUsize>)>,
}

impl RangeResponder {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            last_modified: None,
            honour_ranges: true,
            cut_short: None,
        }
    }

    /// Answer the first range GET starting at `start` with only half of the
    /// requested bytes
    pub fn cut_short_once(mut self, start: u64) -> Self {
        self.cut_short = Some((start, Arc::new(AtomicUsize::new(1))));
        self
    }

    fn take_cut(&self, start: u64) -> bool {
        match &self.cut_short {
            Some((at, remaining)) if *at == start => remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
            _ => false,
        }
    }

    pub fn last_modified(mut self, value: &str) -> Self {
        self.last_modified = Some(value.into());
        self
    }

    /// Answer every GET with the whole body and 200, like a server without range support
    pub fn ignoring_ranges(mut self) -> Self {
        self.honour_ranges = false;
        self
    }

    fn with_metadata(&self, template: ResponseTemplate) -> ResponseTemplate {
        let template = if self.honour_ranges {
            template.insert_header("accept-ranges", "bytes")
        } else {
            template
        };
        match &self.last_modified {
            Some(value) => template.insert_header("last-modified", value.as_str()),
            None => template,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.data.len() as u64;

        if request.method.as_str() == "HEAD" {
            return self.with_metadata(ResponseTemplate::new(200).set_body_bytes(self.data.to_vec()));
        }

        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if self.honour_ranges => {
                if start >= len || start > end {
                    return ResponseTemplate::new(416)
                        .insert_header("content-range", format!("bytes */{len}").as_str());
                }
                let end = end.min(len - 1);
                let mut body = self.data[start as usize..=end as usize].to_vec();
                if self.take_cut(start) {
                    body.truncate(body.len() / 2);
                }
                self.with_metadata(
                    ResponseTemplate::new(206)
                        .insert_header("content-range", format!("bytes {start}-{end}/{len}").as_str())
                        .set_body_bytes(body),
                )
            }
            _ => self.with_metadata(ResponseTemplate::new(200).set_body_bytes(self.data.to_vec())),
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Start a server serving `responder` at `route`; returns the object's URL.
pub async fn serve(responder: RangeResponder, route: &str) -> (MockServer, String) {
    let server = MockServer::start().await;
    Mock::given(path(route))
        .respond_with(responder)
        .mount(&server)
        .await;
    let url = format!("{}{route}", server.uri());
    (server, url)
}

/// GET requests that carried a `Range` header, excluding the one-byte size probe
pub async fn content_range_gets(server: &MockServer) -> usize {
    received(server)
        .await
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter(|r| {
            r.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v != "bytes=0-0")
        })
        .count()
}

/// GET requests whose `Range` header is exactly `range`
pub async fn gets_for_range(server: &MockServer, range: &str) -> usize {
    received(server)
        .await
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter(|r| r.headers.get("range").and_then(|v| v.to_str().ok()) == Some(range))
        .count()
}

/// GET requests without a `Range` header (whole-object downloads)
pub async fn full_gets(server: &MockServer) -> usize {
    received(server)
        .await
        .iter()
        .filter(|r| r.method.as_str() == "GET" && !r.headers.contains_key("range"))
        .count()
}

async fn received(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

/// Deterministic, poorly compressible bytes
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// A bare HTTP/1.1 server for `data` that sends range bodies in `piece`-sized
/// writes with `pause` between them. Returns the object's URL.
pub async fn serve_slowly(data: Vec<u8>, piece: usize, pause: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let data = Arc::new(data);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let data = data.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request).to_ascii_lowercase();
                let len = data.len();

                if request.starts_with("head") {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {len}\r\naccept-ranges: bytes\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    return;
                }

                let (start, end) = request
                    .lines()
                    .find_map(|line| line.strip_prefix("range:").and_then(|v| parse_range(v.trim())))
                    .map(|(s, e)| (s as usize, (e as usize).min(len - 1)))
                    .unwrap_or((0, len - 1));
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\ncontent-length: {}\r\ncontent-range: bytes {start}-{end}/{len}\r\nconnection: close\r\n\r\n",
                    end - start + 1
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for chunk in data[start..=end].chunks(piece) {
                    tokio::time::sleep(pause).await;
                    if socket.write_all(chunk).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("http://{addr}/system.img")
}
