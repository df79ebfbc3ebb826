use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{header::HeaderMap, StatusCode, Version};

use crate::error::Result;
use crate::exchange::Exchange;
use crate::tls::Handshake;

/// Response headers as decoded off the wire, before the body is consumed.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// An HTTP response: status, headers, and a body that streams from the
/// connection.
///
/// Dropping the response before the body is drained releases the exchange;
/// an HTTP/1.1 connection whose body was abandoned cannot be reused and is
/// discarded rather than returned to the pool.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    handshake: Option<Handshake>,
    body: ResponseBody,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, handshake: Option<Handshake>, body: ResponseBody) -> Response {
        Response {
            status: head.status,
            version: head.version,
            headers: head.headers,
            handshake,
            body,
        }
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The negotiated HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The TLS handshake of the connection that produced this response.
    /// `None` on plaintext connections; fields the transport could not
    /// populate stay unset inside.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Stream the body.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Buffer the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A streaming response body bound to its exchange.
pub struct ResponseBody {
    exchange: Exchange,
}

impl ResponseBody {
    pub(crate) fn new(exchange: Exchange) -> ResponseBody {
        ResponseBody { exchange }
    }

    /// The next chunk of the body, or `None` at the end. The terminal
    /// `None` completes the exchange and returns the connection to the
    /// pool.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.exchange.read_body_chunk().await
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody")
    }
}
