//! HTTP/1.x message plumbing.
//!
//! Heads are parsed with `httparse` out of a growing buffer; any bytes read
//! past the head are handed back to the caller as leftover body input. Body
//! framing (content-length, chunked, read-to-close) is tracked explicitly so
//! the bridge can either stream a body through untouched or buffer and decode
//! it for filtering.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Upper bound on a message head (request line / status line plus headers).
pub const MAX_HEAD_BYTES: usize = 32 * 1024;

const MAX_HEADERS: usize = 100;

/// A parsed header field. Names keep their wire spelling; comparisons are
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Shared view over a header list.
pub trait HasHeaders {
    fn headers(&self) -> &[Header];

    fn header(&self, name: &str) -> Option<&Header> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(Header::value_str)
    }
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor HTTP version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version_minor: u8,
    pub headers: Vec<Header>,
}

/// A parsed response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: Vec<Header>,
}

impl HasHeaders for RequestHead {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
}

impl HasHeaders for ResponseHead {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
}

impl RequestHead {
    pub fn host(&self) -> Option<&str> {
        self.header_str("host")
            .map(|h| h.split(':').next().unwrap_or(h).trim())
            .filter(|h| !h.is_empty())
    }

    /// Whether the connection persists after this exchange.
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version_minor, self.header_str("connection"))
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    pub fn set_header(&mut self, name: &str, value: &[u8]) {
        match self.headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(h) => h.value = value.to_vec(),
            None => self.headers.push(Header::new(name, value)),
        }
    }

    /// Serializes the head back to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version_minor).as_bytes());
        encode_headers(&self.headers, &mut out);
        out
    }
}

impl ResponseHead {
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version_minor, self.header_str("connection"))
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    pub fn set_header(&mut self, name: &str, value: &[u8]) {
        match self.headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(h) => h.value = value.to_vec(),
            None => self.headers.push(Header::new(name, value)),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_str("content-type")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("HTTP/1.{} {} {}\r\n", self.version_minor, self.status, self.reason).as_bytes());
        encode_headers(&self.headers, &mut out);
        out
    }
}

fn encode_headers(headers: &[Header], out: &mut Vec<u8>) {
    for header in headers {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&header.value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn keep_alive(version_minor: u8, connection: Option<&str>) -> bool {
    let connection = connection.unwrap_or("");
    let has_token = |token: &str| {
        connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if version_minor == 0 {
        has_token("keep-alive")
    } else {
        !has_token("close")
    }
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    None,
    /// Exactly this many bytes.
    ContentLength(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes (responses only).
    UntilClose,
}

impl BodyFraming {
    /// Framing of a request body.
    pub fn for_request(head: &RequestHead) -> Result<Self> {
        if is_chunked(head.header_str("transfer-encoding")) {
            return Ok(Self::Chunked);
        }
        match parse_content_length(head)? {
            Some(0) | None => Ok(Self::None),
            Some(n) => Ok(Self::ContentLength(n)),
        }
    }

    /// Framing of a response body, which depends on the request method and
    /// the status code.
    pub fn for_response(method: &str, head: &ResponseHead) -> Result<Self> {
        if method.eq_ignore_ascii_case("HEAD")
            || matches!(head.status, 100..=199 | 204 | 304)
        {
            return Ok(Self::None);
        }
        if is_chunked(head.header_str("transfer-encoding")) {
            return Ok(Self::Chunked);
        }
        match parse_content_length(head)? {
            Some(n) => Ok(if n == 0 { Self::None } else { Self::ContentLength(n) }),
            None => Ok(Self::UntilClose),
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, Self::None)
    }
}

fn is_chunked(transfer_encoding: Option<&str>) -> bool {
    transfer_encoding
        .map(|te| {
            te.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false)
}

fn parse_content_length(head: &impl HasHeaders) -> Result<Option<u64>> {
    match head.header_str("content-length") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProxyError::Protocol(format!("bad content-length: {value:?}"))),
        None => Ok(None),
    }
}

/// Reads a request head. Returns `Ok(None)` on a clean EOF before any bytes,
/// which ends a keep-alive connection without noise.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let head = RequestHead {
                        method: parsed.method.unwrap_or("").to_owned(),
                        target: parsed.path.unwrap_or("").to_owned(),
                        version_minor: parsed.version.unwrap_or(1) as u8,
                        headers: convert_headers(parsed.headers),
                    };
                    buf.advance(head_len);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => {
                    return Err(ProxyError::Protocol(format!("bad request head: {e}")))
                }
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Protocol("request head too large".into()));
            }
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Protocol(
                "connection closed mid request head".into(),
            ));
        }
    }
}

/// Reads a response head. 1xx informational responses are forwarded by the
/// caller; this only parses one head at a time.
pub async fn read_response_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut headers);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let head = ResponseHead {
                        status: parsed.code.unwrap_or(502),
                        reason: parsed.reason.unwrap_or("").to_owned(),
                        version_minor: parsed.version.unwrap_or(1) as u8,
                        headers: convert_headers(parsed.headers),
                    };
                    buf.advance(head_len);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => {
                    return Err(ProxyError::Protocol(format!("bad response head: {e}")))
                }
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Protocol("response head too large".into()));
            }
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "connection closed mid response head".into(),
            ));
        }
    }
}

fn convert_headers(parsed: &[httparse::Header<'_>]) -> Vec<Header> {
    parsed
        .iter()
        .map(|h| Header::new(h.name, h.value))
        .collect()
}

/// Incremental scanner over raw chunked-transfer bytes. Tracks where the
/// terminal chunk (plus trailers) ends without copying.
#[derive(Debug)]
pub struct ChunkScanner {
    state: ChunkState,
    /// Partial size/trailer line carried across `advance` calls.
    line: Vec<u8>,
}

/// Bound on one chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Accumulating a chunk-size line.
    SizeLine,
    /// Inside chunk data, `n` bytes plus trailing CRLF to go.
    Data(u64),
    /// After the zero chunk, skipping trailers until a blank line.
    Trailers,
    Done,
}

/// Result of feeding bytes to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes of the input that belong to this body.
    pub consumed: usize,
    /// True when the body (including trailers) is complete.
    pub done: bool,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Advances over `input`, returning how many bytes belong to the body.
    /// `consumed < input.len()` only when the body finished inside `input`.
    pub fn advance(&mut self, input: &[u8]) -> Result<ChunkProgress> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                ChunkState::Done => break,
                ChunkState::Data(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.state = ChunkState::SizeLine;
                    } else {
                        self.state = ChunkState::Data(left);
                    }
                }
                ChunkState::SizeLine | ChunkState::Trailers => {
                    match find_line_end(&input[pos..]) {
                        Some(line_end) => {
                            self.line.extend_from_slice(&input[pos..pos + line_end]);
                            pos += line_end + 1;
                            let line = std::mem::take(&mut self.line);
                            match self.state {
                                ChunkState::SizeLine => {
                                    let size = parse_chunk_size(&line)?;
                                    if size == 0 {
                                        self.state = ChunkState::Trailers;
                                    } else {
                                        // chunk data + its CRLF
                                        self.state = ChunkState::Data(size + 2);
                                    }
                                }
                                ChunkState::Trailers => {
                                    if line.is_empty() || line == b"\r" {
                                        self.state = ChunkState::Done;
                                    }
                                }
                                _ => unreachable!(),
                            }
                        }
                        // Line continues past this input; stash what we have.
                        None => {
                            self.line.extend_from_slice(&input[pos..]);
                            if self.line.len() > MAX_CHUNK_LINE {
                                return Err(ProxyError::Protocol(
                                    "chunk size line too long".into(),
                                ));
                            }
                            return Ok(ChunkProgress {
                                consumed: input.len(),
                                done: false,
                            });
                        }
                    }
                }
            }
        }
        Ok(ChunkProgress {
            consumed: pos,
            done: self.state == ChunkState::Done,
        })
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn find_line_end(input: &[u8]) -> Option<usize> {
    input.iter().position(|&b| b == b'\n')
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Protocol("non-UTF-8 chunk size line".into()))?;
    let size_part = line
        .trim_end_matches('\r')
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size_part, 16)
        .map_err(|_| ProxyError::Protocol(format!("bad chunk size: {size_part:?}")))
}

/// Removes chunked framing from a complete raw body.
pub fn dechunk(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0;
    loop {
        let line_end = find_line_end(&raw[pos..])
            .ok_or_else(|| ProxyError::Protocol("truncated chunked body".into()))?;
        let size = parse_chunk_size(&raw[pos..pos + line_end])?;
        pos += line_end + 1;
        if size == 0 {
            return Ok(out);
        }
        let end = pos + size as usize;
        if end > raw.len() {
            return Err(ProxyError::Protocol("truncated chunk data".into()));
        }
        out.extend_from_slice(&raw[pos..end]);
        // skip the chunk's CRLF
        pos = (end + 2).min(raw.len());
    }
}
