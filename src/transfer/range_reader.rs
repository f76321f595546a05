//! Random access to a remote file over HTTP range requests.
//!
//! [`HttpRangeReader`] implements `Read + Seek` on top of a blocking reqwest
//! client so a zip archive's central directory and a single member can be
//! read without downloading the whole archive. It must run on a blocking
//! thread (e.g. inside `spawn_blocking`).

use std::io::{self, Read, Seek, SeekFrom};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;

/// Bytes fetched per range request beyond what the caller asked for.
const READ_AHEAD: u64 = 256 * 1024;

pub struct HttpRangeReader {
    client: Client,
    url: String,
    headers: HeaderMap,
    len: u64,
    pos: u64,
    buf: Vec<u8>,
    buf_start: u64,
}

fn to_io(e: reqwest::Error) -> io::Error {
    let kind = if e.is_timeout() {
        io::ErrorKind::TimedOut
    } else if e.is_connect() {
        io::ErrorKind::ConnectionRefused
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, e)
}

/// Total length from a `Content-Range: bytes a-b/len` header.
fn total_length(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

impl HttpRangeReader {
    /// Probe the resource with a one-byte range request to learn its length.
    pub fn open(client: Client, url: &str, headers: HeaderMap) -> io::Result<Self> {
        let response = client
            .get(url)
            .headers(headers.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .map_err(to_io)?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("range request to {url} returned {}", response.status()),
            ));
        }
        let len = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_length)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "missing or malformed Content-Range")
            })?;

        Ok(Self {
            client,
            url: url.to_string(),
            headers,
            len,
            pos: 0,
            buf: Vec::new(),
            buf_start: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn fill(&mut self, want: u64) -> io::Result<()> {
        let start = self.pos;
        let end = (start + want.max(READ_AHEAD)).min(self.len) - 1;
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(to_io)?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("range request returned {}", response.status()),
            ));
        }
        let body = response.bytes().map_err(to_io)?;
        if body.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty range response"));
        }
        self.buf = body.to_vec();
        self.buf_start = start;
        Ok(())
    }
}

impl Read for HttpRangeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || out.is_empty() {
            return Ok(0);
        }
        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.pos < self.buf_start || self.pos >= buf_end {
            self.fill(out.len() as u64)?;
        }
        let offset = (self.pos - self.buf_start) as usize;
        let available = &self.buf[offset..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpRangeReader {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(off) => self.len.checked_add_signed(off),
            SeekFrom::Current(off) => self.pos.checked_add_signed(off),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        };
        self.pos = target;
        Ok(self.pos)
    }
}
