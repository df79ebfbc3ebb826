//! Message codecs: one request/response exchange over a carrier.
//!
//! HTTP/1.1 owns the whole transport for the duration of the exchange;
//! HTTP/2 drives one stream of the shared engine. The exchange layer picks
//! the variant off the connection and handles retries, timeouts, and
//! cancellation above this.

pub(crate) mod http1;
pub(crate) mod http2;

use bytes::Bytes;

use crate::error::Result;
use crate::request::Request;
use crate::response::ResponseHead;

pub(crate) use http1::{H1Transport, Http1Codec};
pub(crate) use http2::Http2Codec;

pub(crate) enum Codec {
    Http1(Http1Codec),
    Http2(Http2Codec),
}

impl Codec {
    /// Write the request head. For bodiless requests this also ends the
    /// message.
    pub(crate) async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        match self {
            Codec::Http1(codec) => codec.write_request_headers(request).await,
            Codec::Http2(codec) => codec.write_request_headers(request).await,
        }
    }

    /// Write the whole request body and close the request half.
    pub(crate) async fn write_request_body(&mut self, body: &Bytes) -> Result<()> {
        match self {
            Codec::Http1(codec) => codec.write_request_body(body).await,
            Codec::Http2(codec) => codec.write_request_body(body).await,
        }
    }

    /// Read the response head, skipping informational responses.
    pub(crate) async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        match self {
            Codec::Http1(codec) => codec.read_response_headers().await,
            Codec::Http2(codec) => codec.read_response_headers().await,
        }
    }

    /// The next chunk of response body; `None` when the message is
    /// complete.
    pub(crate) async fn read_response_chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            Codec::Http1(codec) => codec.read_response_chunk().await,
            Codec::Http2(codec) => codec.read_response_chunk().await,
        }
    }

    /// True once the response body was fully delivered and the transport
    /// was handed back for reuse.
    pub(crate) fn is_complete(&self) -> bool {
        match self {
            Codec::Http1(codec) => codec.is_complete(),
            Codec::Http2(codec) => codec.is_complete(),
        }
    }

    /// Abort the exchange from any task. Idempotent. The HTTP/1 transport
    /// is discarded (closing the socket); the HTTP/2 stream is reset with
    /// `CANCEL`.
    pub(crate) fn cancel(&mut self) {
        match self {
            Codec::Http1(codec) => codec.cancel(),
            Codec::Http2(codec) => codec.cancel(),
        }
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Http1(_) => f.write_str("Codec::Http1"),
            Codec::Http2(_) => f.write_str("Codec::Http2"),
        }
    }
}
