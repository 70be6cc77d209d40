//! Minimal HTTP/1.1 message plumbing for the forward proxy.
//!
//! Heads are read into memory and parsed just enough to route and frame the
//! message; header lines keep their original bytes so they can be forwarded
//! unmodified. Bodies are never buffered: they are relayed chunk by chunk
//! while the payload size is counted.

use bytes::{Buf, BytesMut};
use http::uri::Authority;
use http::{StatusCode, Uri, Version};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const IO_CHUNK_SIZE: usize = 16 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 4096;
const MAX_TRAILER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("connection closed before the head was complete")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A stream plus whatever has been read from it but not yet consumed.
///
/// Reads through the [`AsyncRead`] impl drain the buffer before touching the
/// stream, so bytes a client pipelined behind a head are never lost when the
/// connection is handed to a TLS acceptor or a raw relay.
pub struct BufferedConn<S> {
    stream: S,
    buf: BytesMut,
}

/// Raw head bytes (terminating blank line included) and when the first of
/// them became available.
pub struct RawHead {
    pub bytes: BytesMut,
    pub started: Instant,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(IO_CHUNK_SIZE),
        }
    }

    /// Bytes read from the stream but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(IO_CHUNK_SIZE);
        self.stream.read_buf(&mut self.buf).await
    }

    /// Read up to and including the blank line that ends a message head.
    ///
    /// Empty lines before the start line are skipped. Returns `Ok(None)` if
    /// the peer closed the connection before sending anything.
    pub async fn read_head(&mut self, max_bytes: usize) -> Result<Option<RawHead>, HeadError> {
        let mut started = None;
        let mut scanned = 0;

        loop {
            while self.buf.starts_with(b"\r\n") || self.buf.starts_with(b"\n") {
                let skip = if self.buf[0] == b'\r' { 2 } else { 1 };
                self.buf.advance(skip);
                scanned = 0;
            }

            if !self.buf.is_empty() && started.is_none() {
                started = Some(Instant::now());
            }

            if let Some(end) = find_head_end(&self.buf, scanned) {
                if end > max_bytes {
                    return Err(HeadError::TooLarge(max_bytes));
                }
                let bytes = self.buf.split_to(end);
                return Ok(Some(RawHead {
                    bytes,
                    started: started.unwrap_or_else(Instant::now),
                }));
            }

            if self.buf.len() > max_bytes {
                return Err(HeadError::TooLarge(max_bytes));
            }
            // Resume the search a few bytes back so a terminator split
            // across reads is still found.
            scanned = self.buf.len().saturating_sub(3);

            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HeadError::Truncated);
            }
        }
    }

    /// Read one line, terminator included.
    pub async fn read_line(&mut self, max_bytes: usize) -> io::Result<BytesMut> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|b| *b == b'\n') {
                return Ok(self.buf.split_to(scanned + pos + 1));
            }
            scanned = self.buf.len();
            if scanned > max_bytes {
                return Err(invalid_data("line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                ));
            }
        }
    }

    /// Copy exactly `len` bytes to `dst`.
    pub async fn relay_exact<W>(&mut self, dst: &mut W, len: u64) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {remaining} body bytes outstanding"),
                ));
            }
            let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let chunk = self.buf.split_to(take);
            dst.write_all(&chunk).await?;
            remaining -= take as u64;
        }
        Ok(len)
    }

    /// Relay a chunked body verbatim (sizes, extensions and trailers
    /// included). Returns the decoded payload size.
    pub async fn relay_chunked<W>(&mut self, dst: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut payload = 0u64;
        loop {
            let line = self.read_line(MAX_CHUNK_LINE_BYTES).await?;
            let size = parse_chunk_size(&line)?;
            dst.write_all(&line).await?;

            if size == 0 {
                let mut trailer_bytes = 0;
                loop {
                    let trailer = self.read_line(MAX_CHUNK_LINE_BYTES).await?;
                    trailer_bytes += trailer.len();
                    if trailer_bytes > MAX_TRAILER_BYTES {
                        return Err(invalid_data("chunked trailer too large"));
                    }
                    dst.write_all(&trailer).await?;
                    if is_blank_line(&trailer) {
                        return Ok(payload);
                    }
                }
            }

            self.relay_exact(dst, size).await?;
            payload += size;

            let crlf = self.read_line(MAX_CHUNK_LINE_BYTES).await?;
            if !is_blank_line(&crlf) {
                return Err(invalid_data("missing CRLF after chunk data"));
            }
            dst.write_all(&crlf).await?;
        }
    }

    /// Relay everything until the source closes.
    pub async fn relay_to_eof<W>(&mut self, dst: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = self.buf.len() as u64;
        if !self.buf.is_empty() {
            let pending = self.buf.split();
            dst.write_all(&pending).await?;
        }
        total += tokio::io::copy(&mut self.stream, dst).await?;
        Ok(total)
    }

    pub async fn relay_body<W>(&mut self, dst: &mut W, framing: BodyFraming) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match framing {
            BodyFraming::None => Ok(0),
            BodyFraming::Length(len) => self.relay_exact(dst, len).await,
            BodyFraming::Chunked => self.relay_chunked(dst).await,
            BodyFraming::UntilClose => self.relay_to_eof(dst).await,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let take = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..take]);
            this.buf.advance(take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1..].starts_with(b"\r\n") {
                return Some(i + 3);
            }
            if buf[i + 1..].starts_with(b"\n") {
                return Some(i + 2);
            }
        }
        i += 1;
    }
    None
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| invalid_data("chunk size is not ASCII"))?;
    let size = text
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if size.is_empty() || size.len() > 16 {
        return Err(invalid_data("invalid chunk size"));
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// One logical header. `raw` holds the exact wire bytes, continuation lines
/// and line terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub headers: Vec<Header>,
}

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Split a start line off a raw head and parse the header block.
fn split_head(raw: &[u8]) -> Result<(&str, Vec<Header>), String> {
    let line_end = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| "missing start line".to_string())?;
    let start_line = std::str::from_utf8(trim_eol(&raw[..=line_end]))
        .map_err(|_| "start line is not valid UTF-8".to_string())?;
    let headers = parse_headers(&raw[line_end + 1..])?;
    Ok((start_line, headers))
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_headers(block: &[u8]) -> Result<Vec<Header>, String> {
    let mut headers: Vec<Header> = Vec::new();
    let mut rest = block;

    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;

        let content = trim_eol(line);
        if content.is_empty() {
            break;
        }

        // obs-fold: a continuation of the previous header's value.
        if content[0] == b' ' || content[0] == b'\t' {
            let previous = headers
                .last_mut()
                .ok_or_else(|| "continuation line before any header".to_string())?;
            let continuation = String::from_utf8_lossy(content);
            previous.value.push(' ');
            previous.value.push_str(continuation.trim());
            previous.raw.extend_from_slice(line);
            continue;
        }

        let colon = content
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| format!("header line without colon: {}", String::from_utf8_lossy(content)))?;
        let name = &content[..colon];
        if name.is_empty() || !name.iter().all(|b| is_token_byte(*b)) {
            return Err(format!(
                "invalid header name: {}",
                String::from_utf8_lossy(name)
            ));
        }

        headers.push(Header {
            name: String::from_utf8_lossy(name).into_owned(),
            value: String::from_utf8_lossy(&content[colon + 1..]).trim().to_string(),
            raw: line.to_vec(),
        });
    }

    Ok(headers)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_version(text: &str) -> Result<Version, String> {
    match text {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(format!("unsupported HTTP version: {other}")),
    }
}

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let (start_line, headers) = split_head(raw)?;
        let parts: Vec<&str> = start_line.split(' ').collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(format!("malformed request line: {start_line}"));
        };
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(format!("invalid method: {method}"));
        }
        if target.is_empty() {
            return Err("empty request target".to_string());
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: parse_version(version)?,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn framing(&self) -> Result<BodyFraming, String> {
        let transfer_encoding = joined_values(&self.headers, "transfer-encoding");
        let content_length = content_length(&self.headers)?;

        match (transfer_encoding, content_length) {
            (Some(_), Some(_)) => Err("both Transfer-Encoding and Content-Length present".into()),
            (Some(te), None) if last_coding_is_chunked(&te) => Ok(BodyFraming::Chunked),
            (Some(te), None) => Err(format!("unsupported request Transfer-Encoding: {te}")),
            (None, Some(0)) | (None, None) => Ok(BodyFraming::None),
            (None, Some(len)) => Ok(BodyFraming::Length(len)),
        }
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let (start_line, headers) = split_head(raw)?;
        let mut parts = start_line.splitn(3, ' ');
        let version = parse_version(parts.next().unwrap_or_default())?;
        let status = parts
            .next()
            .filter(|code| code.len() == 3)
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..=999).contains(code))
            .ok_or_else(|| format!("malformed status line: {start_line}"))?;

        Ok(Self {
            version,
            status,
            headers,
        })
    }

    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn framing(&self, request_method: &str) -> Result<BodyFraming, String> {
        if request_method == "HEAD"
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::None);
        }

        if let Some(te) = joined_values(&self.headers, "transfer-encoding") {
            if last_coding_is_chunked(&te) {
                return Ok(BodyFraming::Chunked);
            }
            return Ok(BodyFraming::UntilClose);
        }

        match content_length(&self.headers)? {
            Some(len) => Ok(BodyFraming::Length(len)),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

pub fn has_header(headers: &[Header], name: &str) -> bool {
    headers.iter().any(|h| h.name.eq_ignore_ascii_case(name))
}

fn joined_values(headers: &[Header], name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

fn last_coding_is_chunked(te: &str) -> bool {
    te.rsplit(',')
        .map(str::trim)
        .find(|coding| !coding.is_empty())
        .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"))
}

/// Content-Length, requiring every occurrence (and list element) to agree.
fn content_length(headers: &[Header]) -> Result<Option<u64>, String> {
    let mut length = None;
    for value in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
        .flat_map(|h| h.value.split(','))
    {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid Content-Length: {value}"));
        }
        let parsed: u64 = value
            .parse()
            .map_err(|_| format!("invalid Content-Length: {value}"))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err("conflicting Content-Length values".to_string())
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn connection_has(headers: &[Header], token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("connection"))
        .flat_map(|h| h.value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn keep_alive(version: Version, headers: &[Header]) -> bool {
    if connection_has(headers, "close") {
        return false;
    }
    version == Version::HTTP_11 || connection_has(headers, "keep-alive")
}

/// `host:port` a request should be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parse a CONNECT target. A missing port defaults to `default_port`.
    pub fn parse_authority(text: &str, default_port: u16) -> Result<Self, String> {
        let authority: Authority = text
            .parse()
            .map_err(|_| format!("invalid authority: {text}"))?;
        Self::from_authority(&authority, default_port)
    }

    fn from_authority(authority: &Authority, default_port: u16) -> Result<Self, String> {
        if authority.as_str().contains('@') {
            return Err("userinfo is not allowed in a proxy target".to_string());
        }
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err("empty host".to_string());
        }
        Ok(Self {
            host,
            port: authority.port_u16().unwrap_or(default_port),
        })
    }

    /// Host as it appears in a URL (IPv6 literals bracketed).
    pub fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Host plus the port when it differs from `default_port`.
    pub fn url_authority(&self, default_port: u16) -> String {
        if self.port == default_port {
            self.url_host()
        } else {
            format!("{}:{}", self.url_host(), self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url_host(), self.port)
    }
}

/// An absolute-form `http://` request target split into where to connect
/// and the origin-form target to send upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteTarget {
    pub target: Target,
    pub origin_form: String,
}

impl AbsoluteTarget {
    pub fn parse(text: &str) -> Result<Self, String> {
        let uri: Uri = text
            .parse()
            .map_err(|_| format!("invalid request target: {text}"))?;
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(scheme) => return Err(format!("unsupported scheme for plain proxying: {scheme}")),
            None => return Err(format!("expected an absolute-form target, got {text}")),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| format!("target has no host: {text}"))?;
        let target = Target::from_authority(authority, 80)?;

        let origin_form = match uri.path_and_query() {
            Some(pq) if pq.as_str().starts_with('/') => pq.as_str().to_string(),
            Some(pq) if !pq.as_str().is_empty() => format!("/{}", pq.as_str()),
            _ => "/".to_string(),
        };

        Ok(Self {
            target,
            origin_form,
        })
    }
}

/// Origin-form path of a request read inside a decrypted tunnel. Clients
/// normally send origin-form there, but absolute-form is legal too.
pub fn tunnel_origin_form(target: &str) -> Result<String, String> {
    if target.starts_with('/') {
        return Ok(target.to_string());
    }
    let uri: Uri = target
        .parse()
        .map_err(|_| format!("invalid request target: {target}"))?;
    if uri.scheme().is_none() {
        return Err(format!("invalid request target: {target}"));
    }
    Ok(uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/")
        .to_string())
}

/// Serialize a request head for the upstream leg: start line with the given
/// target, then the original header lines minus any named in `drop`.
pub fn encode_request_head(
    head: &RequestHead,
    target: &str,
    drop: &[&str],
    extra: &[(&str, &str)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version_str(head.version).as_bytes());
    out.extend_from_slice(b"\r\n");

    for header in &head.headers {
        if drop.iter().any(|name| header.name.eq_ignore_ascii_case(name)) {
            continue;
        }
        out.extend_from_slice(&header.raw);
    }
    for (name, value) in extra {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// A complete, self-contained response generated by the proxy itself.
pub fn simple_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head_skips_leading_blank_lines() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(b"\r\nGET http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\nrest")
            .await
            .unwrap();
        drop(tx);

        let mut conn = BufferedConn::new(rx);
        let head = conn.read_head(4096).await.unwrap().unwrap();
        assert!(head.bytes.starts_with(b"GET "));
        assert!(head.bytes.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.buffered(), b"rest");
    }

    #[tokio::test]
    async fn test_read_head_reports_eof_and_truncation() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut conn = BufferedConn::new(rx);
        assert!(conn.read_head(4096).await.unwrap().is_none());

        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(tx);
        let mut conn = BufferedConn::new(rx);
        assert!(matches!(conn.read_head(4096).await, Err(HeadError::Truncated)));
    }

    #[tokio::test]
    async fn test_read_head_enforces_limit() {
        let (mut tx, rx) = tokio::io::duplex(8192);
        let long = format!("GET / HTTP/1.1\r\nX-Fill: {}\r\n\r\n", "a".repeat(3000));
        tx.write_all(long.as_bytes()).await.unwrap();

        let mut conn = BufferedConn::new(rx);
        assert!(matches!(
            conn.read_head(1024).await,
            Err(HeadError::TooLarge(1024))
        ));
    }

    #[test]
    fn test_parse_request_head_keeps_raw_header_bytes() {
        let raw = b"POST http://a.test/x?y=1 HTTP/1.1\r\nHost: a.test\r\nX-Long: one\r\n two\r\nContent-Length: 3\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "http://a.test/x?y=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 3);
        assert_eq!(head.header("x-long"), Some("one two"));
        assert_eq!(head.headers[1].raw, b"X-Long: one\r\n two\r\n");
        assert_eq!(head.framing().unwrap(), BodyFraming::Length(3));
    }

    #[test]
    fn test_parse_request_head_rejects_garbage() {
        assert!(RequestHead::parse(b"hello\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/2\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET  / HTTP/1.1\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n").is_err());
    }

    #[test]
    fn test_request_framing() {
        let chunked =
            RequestHead::parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
                .unwrap();
        assert_eq!(chunked.framing().unwrap(), BodyFraming::Chunked);

        let conflicting = RequestHead::parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n",
        )
        .unwrap();
        assert!(conflicting.framing().is_err());

        let disagreeing =
            RequestHead::parse(b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n")
                .unwrap();
        assert!(disagreeing.framing().is_err());

        let bodiless = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(bodiless.framing().unwrap(), BodyFraming::None);
    }

    #[test]
    fn test_response_framing() {
        let ok = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(ok.framing("GET").unwrap(), BodyFraming::Length(5));
        assert_eq!(ok.framing("HEAD").unwrap(), BodyFraming::None);

        let no_content = ResponseHead::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(no_content.framing("GET").unwrap(), BodyFraming::None);

        let streamed = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(streamed.framing("GET").unwrap(), BodyFraming::UntilClose);
        assert!(!streamed.keep_alive());

        let interim = ResponseHead::parse(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        assert!(interim.is_interim());
        let switching = ResponseHead::parse(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").unwrap();
        assert!(!switching.is_interim());
    }

    #[test]
    fn test_keep_alive_rules() {
        let http11 = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(http11.keep_alive());
        let closing = RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!closing.keep_alive());
        let http10 = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!http10.keep_alive());
        let http10_ka =
            RequestHead::parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(http10_ka.keep_alive());
    }

    #[test]
    fn test_targets() {
        let plain = AbsoluteTarget::parse("http://Example.test:8080/a/b?c=d").unwrap();
        assert_eq!(plain.target.port, 8080);
        assert_eq!(plain.origin_form, "/a/b?c=d");

        let bare = AbsoluteTarget::parse("http://example.test").unwrap();
        assert_eq!(bare.target.port, 80);
        assert_eq!(bare.origin_form, "/");

        assert!(AbsoluteTarget::parse("/relative").is_err());
        assert!(AbsoluteTarget::parse("https://example.test/").is_err());

        let connect = Target::parse_authority("example.test", 443).unwrap();
        assert_eq!(connect.to_string(), "example.test:443");
        let v6 = Target::parse_authority("[::1]:8443", 443).unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8443");
        assert_eq!(v6.url_authority(443), "[::1]:8443");

        assert_eq!(tunnel_origin_form("/x").unwrap(), "/x");
        assert_eq!(tunnel_origin_form("https://a.test/y?z").unwrap(), "/y?z");
    }

    #[test]
    fn test_encode_request_head_drops_proxy_headers() {
        let head = RequestHead::parse(
            b"GET http://a.test/p HTTP/1.1\r\nHost: a.test\r\nProxy-Connection: keep-alive\r\nAccept:  */*\r\n\r\n",
        )
        .unwrap();
        let encoded = encode_request_head(&head, "/p", &["proxy-connection"], &[]);
        assert_eq!(
            encoded,
            b"GET /p HTTP/1.1\r\nHost: a.test\r\nAccept:  */*\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_relay_chunked_is_verbatim() {
        let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nTrailer: x\r\n\r\nNEXT";
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(body).await.unwrap();
        drop(tx);

        let mut conn = BufferedConn::new(rx);
        let mut out = Vec::new();
        let payload = conn.relay_chunked(&mut out).await.unwrap();

        assert_eq!(payload, 9);
        assert_eq!(out, body[..body.len() - 4].to_vec());
        assert_eq!(conn.buffered(), b"NEXT");
    }

    #[tokio::test]
    async fn test_relay_exact_reports_short_body() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"abc").await.unwrap();
        drop(tx);

        let mut conn = BufferedConn::new(rx);
        let mut out = Vec::new();
        let err = conn.relay_exact(&mut out, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_buffered_bytes_are_read_first() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"HEAD / HTTP/1.1\r\n\r\nhello").await.unwrap();
        drop(tx);

        let mut conn = BufferedConn::new(rx);
        conn.read_head(1024).await.unwrap().unwrap();
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"hello");
    }

    #[test]
    fn test_simple_response_format() {
        let bytes = simple_response(StatusCode::BAD_GATEWAY, "no route");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("\r\n\r\nno route"));
    }
}
