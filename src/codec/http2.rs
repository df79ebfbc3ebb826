//! The HTTP/2 codec: one stream of a multiplexed engine, dressed up as a
//! request/response exchange.

use bytes::Bytes;
use http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    StatusCode, Uri, Version,
};

use crate::error::{Error, Result};
use crate::http2::connection::H2Connection;
use crate::http2::hpack::Header;
use crate::http2::stream::H2Stream;
use crate::request::Request;
use crate::response::ResponseHead;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct Http2Codec {
    connection: H2Connection,
    stream: Option<H2Stream>,
    is_tls: bool,
    complete: bool,
}

impl Http2Codec {
    pub(crate) fn new(connection: H2Connection, is_tls: bool) -> Http2Codec {
        Http2Codec {
            connection,
            stream: None,
            is_tls,
            complete: false,
        }
    }

    /// The stream id, once the request head was sent.
    pub(crate) fn stream_id(&self) -> Option<u32> {
        self.stream.as_ref().map(|s| s.id())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(stream) = &self.stream {
            stream.cancel();
        }
    }

    fn stream(&self) -> Result<&H2Stream> {
        self.stream
            .as_ref()
            .ok_or_else(|| Error::protocol("stream not open"))
    }

    pub(crate) async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        let headers = request_headers(request, self.is_tls);
        let end_stream = request.body().is_empty();
        let stream = self
            .connection
            .new_stream(&headers, end_stream)
            .await
            .map_err(Error::from)?;
        self.stream = Some(stream);
        Ok(())
    }

    pub(crate) async fn write_request_body(&mut self, body: &Bytes) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        self.stream()?
            .write_data(body, true)
            .await
            .map_err(Error::from)
    }

    pub(crate) async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        loop {
            let headers = self.stream()?.read_headers().await.map_err(Error::from)?;
            let head = response_head(headers)?;
            if head.status.is_informational() {
                continue;
            }
            return Ok(head);
        }
    }

    pub(crate) async fn read_response_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.stream()?.read_data(READ_CHUNK).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.complete = true;
                Ok(None)
            }
            Err(e) => Err(Error::from(e)),
        }
    }
}

impl std::fmt::Debug for Http2Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Codec")
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

/// Hop-by-hop headers never travel on a multiplexed stream.
fn is_forbidden_header(name: &str) -> bool {
    matches!(
        name,
        "connection" | "proxy-connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host"
    )
}

fn request_headers(request: &Request, is_tls: bool) -> Vec<Header> {
    let uri = request.uri();
    let mut headers = Vec::with_capacity(request.headers().len() + 4);
    headers.push(Header::new(":method", request.method().as_str()));
    headers.push(Header::new(":path", request_path(uri)));
    headers.push(Header::new(
        ":scheme",
        if is_tls { "https" } else { "http" },
    ));
    headers.push(Header::new(":authority", &authority(request)));
    for (name, value) in request.headers() {
        let name = name.as_str();
        if is_forbidden_header(name) {
            continue;
        }
        if name == "te" && value.as_bytes() != b"trailers" {
            continue;
        }
        headers.push(Header::new(
            name,
            std::str::from_utf8(value.as_bytes()).unwrap_or_default(),
        ));
    }
    headers
}

fn request_path(uri: &Uri) -> &str {
    match uri.path_and_query() {
        Some(path) if !path.as_str().is_empty() => path.as_str(),
        _ => "/",
    }
}

fn authority(request: &Request) -> String {
    let host = request.uri().host().unwrap_or_default();
    let default_port = if request.is_tls() { 443 } else { 80 };
    match request.uri().port_u16() {
        Some(port) if port != default_port => format!("{host}:{port}"),
        _ => host.to_string(),
    }
}

fn response_head(headers: Vec<Header>) -> Result<ResponseHead> {
    let mut status = None;
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        if header.name.starts_with(b":") {
            if &header.name[..] == b":status" {
                let code = std::str::from_utf8(&header.value)
                    .ok()
                    .and_then(|v| v.parse::<u16>().ok())
                    .ok_or_else(|| Error::protocol("invalid :status"))?;
                status = Some(StatusCode::from_u16(code).map_err(Error::protocol)?);
            }
            continue;
        }
        let name = HeaderName::from_bytes(&header.name).map_err(Error::protocol)?;
        let value = HeaderValue::from_bytes(&header.value).map_err(Error::protocol)?;
        map.append(name, value);
    }
    let status = status.ok_or_else(|| Error::protocol("response without :status"))?;
    Ok(ResponseHead {
        status,
        version: Version::HTTP_2,
        headers: map,
    })
}
