//! The HTTP/1.1 codec: CRLF-delimited heads, fixed-length or chunked
//! bodies, one exchange at a time per transport.

use bytes::{BufMut, Bytes, BytesMut};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
    Method, StatusCode, Uri, Version,
};
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connect::BoxedIo;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::ResponseHead;

/// An HTTP/1.1 transport: the socket plus read-ahead that must follow it
/// between exchanges.
pub(crate) struct H1Transport {
    pub(crate) io: BoxedIo,
    pub(crate) read_buf: BytesMut,
}

impl H1Transport {
    pub(crate) fn new(io: BoxedIo) -> H1Transport {
        H1Transport {
            io,
            read_buf: BytesMut::with_capacity(8 * 1024),
        }
    }
}

impl std::fmt::Debug for H1Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Transport")
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum ReadState {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkCrLf,
    Trailers,
    UntilClose,
    Done,
}

pub(crate) struct Http1Codec {
    transport: Option<H1Transport>,
    /// Plaintext HTTP proxies get the absolute request target.
    absolute_form: bool,
    method: Method,
    state: ReadState,
    connection_close: bool,
    complete: bool,
}

impl Http1Codec {
    pub(crate) fn new(transport: H1Transport, absolute_form: bool) -> Http1Codec {
        Http1Codec {
            transport: Some(transport),
            absolute_form,
            method: Method::GET,
            state: ReadState::Head,
            connection_close: false,
            complete: false,
        }
    }

    /// After a completed exchange: the transport, if it may carry another.
    pub(crate) fn into_reusable_transport(&mut self) -> Option<H1Transport> {
        if self.complete && !self.connection_close {
            self.transport.take()
        } else {
            None
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn cancel(&mut self) {
        // Dropping the transport closes the socket and breaks any pending
        // read on it in this codec.
        self.transport = None;
    }

    fn transport_mut(&mut self) -> Result<&mut H1Transport> {
        self.transport
            .as_mut()
            .ok_or_else(Error::canceled)
    }

    pub(crate) async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        self.method = request.method().clone();

        let mut head = BytesMut::with_capacity(512);
        head.put_slice(request.method().as_str().as_bytes());
        head.put_u8(b' ');
        put_request_target(&mut head, request.uri(), self.absolute_form);
        head.put_slice(b" HTTP/1.1\r\n");

        if !request.headers().contains_key(HOST) {
            head.put_slice(b"Host: ");
            put_host(&mut head, request.uri());
            head.put_slice(b"\r\n");
        }

        let body_len = request.body().len();
        let needs_length = body_len > 0
            || matches!(
                *request.method(),
                Method::POST | Method::PUT | Method::PATCH
            );
        if needs_length && !request.headers().contains_key(CONTENT_LENGTH) {
            head.put_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
        }

        for (name, value) in request.headers() {
            head.put_slice(name.as_str().as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");

        let transport = self.transport_mut()?;
        transport.io.write_all(&head).await.map_err(Error::request)?;
        transport.io.flush().await.map_err(Error::request)?;
        Ok(())
    }

    pub(crate) async fn write_request_body(&mut self, body: &Bytes) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let transport = self.transport_mut()?;
        transport.io.write_all(body).await.map_err(Error::request)?;
        transport.io.flush().await.map_err(Error::request)?;
        Ok(())
    }

    pub(crate) async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        let method = self.method.clone();
        loop {
            let head = self.parse_head().await?;
            // Informational responses are consumed here; the caller only
            // sees the final response.
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                trace!("discarding informational response {}", head.status);
                continue;
            }
            self.prepare_body(&method, &head)?;
            return Ok(head);
        }
    }

    async fn parse_head(&mut self) -> Result<ResponseHead> {
        let transport = self.transport_mut()?;
        loop {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut headers);
            match parsed
                .parse(&transport.read_buf)
                .map_err(Error::protocol)?
            {
                httparse::Status::Complete(head_len) => {
                    let status = StatusCode::from_u16(parsed.code.expect("complete response"))
                        .map_err(Error::protocol)?;
                    let version = match parsed.version {
                        Some(0) => Version::HTTP_10,
                        _ => Version::HTTP_11,
                    };
                    let mut map = HeaderMap::with_capacity(parsed.headers.len());
                    for header in parsed.headers.iter() {
                        let name = HeaderName::from_bytes(header.name.as_bytes())
                            .map_err(Error::protocol)?;
                        let value =
                            HeaderValue::from_bytes(header.value).map_err(Error::protocol)?;
                        map.append(name, value);
                    }
                    let _ = transport.read_buf.split_to(head_len);
                    return Ok(ResponseHead {
                        status,
                        version,
                        headers: map,
                    });
                }
                httparse::Status::Partial => {
                    if transport.read_buf.len() > 256 * 1024 {
                        return Err(Error::protocol("response head too large"));
                    }
                    let n = transport
                        .io
                        .read_buf(&mut transport.read_buf)
                        .await
                        .map_err(Error::request)?;
                    if n == 0 {
                        return Err(Error::request(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed before response head",
                        )));
                    }
                }
            }
        }
    }

    fn prepare_body(&mut self, method: &Method, head: &ResponseHead) -> Result<()> {
        self.connection_close = wants_close(head);

        if method == Method::HEAD
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            self.state = ReadState::Done;
            return Ok(());
        }

        if is_chunked(&head.headers) {
            self.state = ReadState::ChunkSize;
            return Ok(());
        }

        if let Some(value) = head.headers.get(CONTENT_LENGTH) {
            let length: u64 = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| Error::protocol("invalid content-length"))?;
            self.state = if length == 0 {
                ReadState::Done
            } else {
                ReadState::FixedBody { remaining: length }
            };
            return Ok(());
        }

        // No framing: the body runs to connection close, and the transport
        // cannot be reused.
        self.connection_close = true;
        self.state = ReadState::UntilClose;
        Ok(())
    }

    pub(crate) async fn read_response_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                ReadState::Head => return Err(Error::protocol("body read before head")),
                ReadState::Done => {
                    self.complete = true;
                    return Ok(None);
                }
                ReadState::FixedBody { remaining } => {
                    let chunk = self.read_bounded(remaining).await?;
                    let taken = chunk.len() as u64;
                    self.state = if taken == remaining {
                        ReadState::Done
                    } else {
                        ReadState::FixedBody {
                            remaining: remaining - taken,
                        }
                    };
                    return Ok(Some(chunk));
                }
                ReadState::ChunkSize => {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ReadState::Trailers
                    } else {
                        ReadState::ChunkData { remaining: size }
                    };
                }
                ReadState::ChunkData { remaining } => {
                    let chunk = self.read_bounded(remaining).await?;
                    let taken = chunk.len() as u64;
                    self.state = if taken == remaining {
                        ReadState::ChunkCrLf
                    } else {
                        ReadState::ChunkData {
                            remaining: remaining - taken,
                        }
                    };
                    return Ok(Some(chunk));
                }
                ReadState::ChunkCrLf => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(Error::protocol("missing chunk terminator"));
                    }
                    self.state = ReadState::ChunkSize;
                }
                ReadState::Trailers => {
                    // Trailer fields are read and discarded.
                    let line = self.read_line().await?;
                    if line.is_empty() {
                        self.state = ReadState::Done;
                    }
                }
                ReadState::UntilClose => {
                    let transport = self.transport_mut()?;
                    if !transport.read_buf.is_empty() {
                        let chunk = transport.read_buf.split().freeze();
                        return Ok(Some(chunk));
                    }
                    let n = transport
                        .io
                        .read_buf(&mut transport.read_buf)
                        .await
                        .map_err(Error::body)?;
                    if n == 0 {
                        self.state = ReadState::Done;
                    }
                }
            }
        }
    }

    /// Read up to `limit` body bytes, at least one.
    async fn read_bounded(&mut self, limit: u64) -> Result<Bytes> {
        let transport = self.transport_mut()?;
        if transport.read_buf.is_empty() {
            let n = transport
                .io
                .read_buf(&mut transport.read_buf)
                .await
                .map_err(Error::body)?;
            if n == 0 {
                return Err(Error::body(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                )));
            }
        }
        let take = (transport.read_buf.len() as u64).min(limit) as usize;
        Ok(transport.read_buf.split_to(take).freeze())
    }

    /// Read one CRLF-terminated line, returned without the terminator.
    async fn read_line(&mut self) -> Result<Bytes> {
        let transport = self.transport_mut()?;
        loop {
            if let Some(pos) = find_crlf(&transport.read_buf) {
                let line = transport.read_buf.split_to(pos).freeze();
                let _ = transport.read_buf.split_to(2);
                return Ok(line);
            }
            if transport.read_buf.len() > 16 * 1024 {
                return Err(Error::protocol("chunk metadata too large"));
            }
            let n = transport
                .io
                .read_buf(&mut transport.read_buf)
                .await
                .map_err(Error::body)?;
            if n == 0 {
                return Err(Error::body(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                )));
            }
        }
    }
}

impl std::fmt::Debug for Http1Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Codec")
            .field("complete", &self.complete)
            .finish()
    }
}

fn put_request_target(head: &mut BytesMut, uri: &Uri, absolute_form: bool) {
    if absolute_form {
        // Plaintext proxying sends the full target so the proxy can route.
        head.put_slice(uri.to_string().as_bytes());
        return;
    }
    match uri.path_and_query() {
        Some(path) if !path.as_str().is_empty() => head.put_slice(path.as_str().as_bytes()),
        _ => head.put_u8(b'/'),
    }
}

fn put_host(head: &mut BytesMut, uri: &Uri) {
    let host = uri.host().unwrap_or_default();
    head.put_slice(host.as_bytes());
    let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    if let Some(port) = uri.port_u16() {
        if port != default_port {
            head.put_slice(format!(":{port}").as_bytes());
        }
    }
}

fn wants_close(head: &ResponseHead) -> bool {
    let explicit = head
        .headers
        .get_all(CONNECTION)
        .iter()
        .chain(head.headers.get_all("proxy-connection"))
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    if explicit {
        return true;
    }
    // HTTP/1.0 closes unless keep-alive was negotiated.
    head.version == Version::HTTP_10
        && !head
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line).map_err(|_| Error::protocol("bad chunk size"))?;
    // Chunk extensions after ';' are ignored.
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| Error::protocol("bad chunk size"))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
