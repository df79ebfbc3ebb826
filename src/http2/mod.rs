//! The HTTP/2 framed engine: frame codec, header compression, and the
//! multiplexed connection that carries many concurrent exchanges over one
//! transport.
//!
//! Wire behavior follows the published framing rules verbatim: 9-byte frame
//! headers, SETTINGS identifiers and defaults, canonical error codes, and a
//! symmetric table-based header-compression codec.

pub(crate) mod connection;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod huffman;
pub(crate) mod stream;

use std::{fmt, io};

pub use frame::ErrorCode;

/// Internal error type for the engine. Converted to the public error at the
/// codec boundary.
#[derive(Debug)]
pub(crate) enum H2Error {
    /// Transport I/O failed.
    Io(io::Error),
    /// The peer violated the framing rules: connection error.
    Protocol(String),
    /// A frame exceeded the negotiated size limit.
    FrameSize,
    /// Header decompression failed: connection error.
    Compression,
    /// Our stream was reset by the peer, or locally.
    Reset(ErrorCode),
    /// The connection is shutting down and cannot host this stream.
    Shutdown,
}

impl H2Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> H2Error {
        H2Error::Protocol(msg.into())
    }

    /// The error code to emit if this error tears down the connection.
    pub(crate) fn connection_error_code(&self) -> ErrorCode {
        match self {
            H2Error::Protocol(_) => ErrorCode::PROTOCOL_ERROR,
            H2Error::FrameSize => ErrorCode::FRAME_SIZE_ERROR,
            H2Error::Compression => ErrorCode::COMPRESSION_ERROR,
            _ => ErrorCode::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            H2Error::Io(e) => write!(f, "http2 io error: {e}"),
            H2Error::Protocol(msg) => write!(f, "http2 protocol error: {msg}"),
            H2Error::FrameSize => f.write_str("http2 frame exceeds negotiated size"),
            H2Error::Compression => f.write_str("http2 header compression error"),
            H2Error::Reset(code) => write!(f, "stream reset: {code}"),
            H2Error::Shutdown => f.write_str("connection is shutting down"),
        }
    }
}

impl std::error::Error for H2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            H2Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for H2Error {
    fn from(e: io::Error) -> H2Error {
        H2Error::Io(e)
    }
}

impl From<H2Error> for crate::Error {
    fn from(e: H2Error) -> crate::Error {
        match e {
            H2Error::Io(io) => crate::Error::request(io),
            H2Error::Reset(code) => crate::Error::reset(code),
            H2Error::Shutdown => crate::Error::shutdown(),
            other => crate::Error::protocol(other),
        }
    }
}
