//! HTTP/1.x wire codec.
//!
//! Decoding works off a buffered reader so the pipeline can sniff the first
//! bytes of a connection (TLS detection) and later hand unconsumed bytes to
//! the TLS layer via [`Rewind`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{ProxyError, Result};
use crate::message::{Headers, HttpRequest, HttpResponse};

/// Upper bound on the size of a request head.
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Upper bound on the size of a decoded request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const MAX_HEADER_COUNT: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

/// Placeholder wire form of a response nothing filled in.
const EMPTY_RESPONSE_LINE: &[u8] = b"HTTP/1.0 0\r\n\r\n";

/// A stream that replays a byte prefix before reading from the wrapped
/// stream. Used to feed bytes consumed during protocol sniffing back to the
/// TLS acceptor.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    /// Wraps `inner`, replaying `prefix` first.
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Buffered request decoder over an async stream.
#[derive(Debug)]
pub struct MessageReader<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + Unpin> MessageReader<S> {
    /// Wraps a stream with an empty buffer.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Returns up to `n` buffered bytes without consuming them, reading from
    /// the stream as needed. Returns fewer bytes only at end of stream.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffer.len() < n {
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(&self.buffer[..self.buffer.len().min(n)])
    }

    /// Unwraps the reader, returning the stream and any bytes read but not
    /// yet consumed.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buffer)
    }

    /// The underlying stream, for writing responses back.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let read = self.stream.read(&mut chunk).await?;
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Decodes the next request. Returns `Ok(None)` on a clean end of stream
    /// at a message boundary; a stream that ends mid-message or carries an
    /// unparseable head is `ProxyError::Malformed`.
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>> {
        let (head_len, mut request) = loop {
            // Tolerate stray blank lines between messages.
            while self.buffer.starts_with(b"\r\n") {
                self.buffer.drain(..2);
            }

            match parse_head(&self.buffer)? {
                Some(parsed) => break parsed,
                None => {
                    if self.buffer.len() > MAX_HEAD_BYTES {
                        return Err(ProxyError::Malformed("request head too large".to_string()));
                    }
                    if self.fill().await? == 0 {
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        return Err(ProxyError::Malformed(
                            "connection closed before request head was complete".to_string(),
                        ));
                    }
                }
            }
        };
        self.buffer.drain(..head_len);

        if request.is_connect() {
            return Ok(Some(request));
        }

        if request.headers.contains_token("Transfer-Encoding", "chunked") {
            let body = self.read_chunked_body().await?;
            request.headers.remove("Transfer-Encoding");
            request.headers.set("Content-Length", body.len().to_string());
            request.body = body;
        } else if let Some(value) = request.headers.get("Content-Length") {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| ProxyError::Malformed(format!("invalid Content-Length: {value:?}")))?;
            if length > MAX_BODY_BYTES {
                return Err(ProxyError::Malformed("request body too large".to_string()));
            }
            request.body = self.take_exact(length).await?;
        }

        Ok(Some(request))
    }

    /// Consumes exactly `n` bytes from the buffer, reading as needed.
    async fn take_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < n {
            if self.fill().await? == 0 {
                return Err(ProxyError::Malformed(
                    "connection closed before message body was complete".to_string(),
                ));
            }
        }
        Ok(self.buffer.drain(..n).collect())
    }

    /// Consumes one CRLF-terminated line, returning it without the
    /// terminator.
    async fn take_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buffer.len() > MAX_HEAD_BYTES {
                return Err(ProxyError::Malformed("chunk header too large".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(ProxyError::Malformed(
                    "connection closed inside chunked body".to_string(),
                ));
            }
        }
    }

    async fn read_chunked_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.take_line().await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| ProxyError::Malformed(format!("invalid chunk size: {size_str:?}")))?;
            if size == 0 {
                break;
            }
            if body.len() + size > MAX_BODY_BYTES {
                return Err(ProxyError::Malformed("request body too large".to_string()));
            }
            body.extend_from_slice(&self.take_exact(size).await?);
            if self.take_exact(2).await? != b"\r\n" {
                return Err(ProxyError::Malformed("missing chunk terminator".to_string()));
            }
        }
        // Discard trailers.
        loop {
            if self.take_line().await?.is_empty() {
                break;
            }
        }
        Ok(body)
    }
}

/// Parses a complete request head out of `buffer`. `Ok(None)` means more
/// bytes are needed.
fn parse_head(buffer: &[u8]) -> Result<Option<(usize, HttpRequest)>> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut parser = httparse::Request::new(&mut header_storage);
    let head_len = match parser
        .parse(buffer)
        .map_err(|e| ProxyError::Malformed(format!("invalid request head: {e}")))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let version = match parser.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let mut headers = Headers::new();
    for header in parser.headers.iter() {
        headers.push(
            header.name.to_string(),
            String::from_utf8_lossy(header.value).into_owned(),
        );
    }
    let request = HttpRequest {
        method: parser.method.unwrap_or_default().to_string(),
        uri: parser.path.unwrap_or_default().to_string(),
        version: version.to_string(),
        headers,
        body: Vec::new(),
        secure: false,
    };
    Ok(Some((head_len, request)))
}

/// Encodes a response into its wire form. The empty placeholder encodes as
/// `HTTP/1.0 0` with no headers.
pub fn encode_response(response: &HttpResponse) -> Vec<u8> {
    if response.is_empty() {
        return EMPTY_RESPONSE_LINE.to_vec();
    }
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(response.version.as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.status.to_string().as_bytes());
    if !response.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(response.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    for (name, value) in response.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Writes and flushes an encoded response.
pub async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: &HttpResponse,
) -> io::Result<()> {
    stream.write_all(&encode_response(response)).await?;
    stream.flush().await
}
