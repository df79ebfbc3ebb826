use std::{error::Error as StdError, fmt, io};

use http::Uri;

use crate::http2::ErrorCode;

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while dispatching a call, planning a route,
/// connecting, or exchanging messages on a connection.
///
/// Note: errors may include the full URI used to make the request. If the
/// URI contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
    // Sibling route failures collected while racing connect attempts. The
    // primary error is `source`; these were observed after it.
    suppressed: Vec<Error>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, Some(Canceled))
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout, Some(TimedOut))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tls, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn reset(code: ErrorCode) -> Error {
        Error::new(Kind::Reset(code), None::<Error>)
    }

    pub(crate) fn shutdown() -> Error {
        Error::new(Kind::Shutdown, None::<Error>)
    }

    pub(crate) fn rejected() -> Error {
        Error::new(Kind::Rejected, None::<Error>)
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Attach a sibling failure observed after this error.
    pub(crate) fn push_suppressed(&mut self, error: Error) {
        self.inner.suppressed.push(error);
    }

    /// Failures from other routes that were attempted alongside the route
    /// that produced this error.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Returns true if the error came from `ClientBuilder` or request
    /// construction.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        if matches!(self.inner.kind, Kind::Canceled) {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<Canceled>() {
                return true;
            }
            source = err.source();
        }
        false
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error was caused by an interrupted operation.
    pub fn is_interrupted(&self) -> bool {
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::Interrupted {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }

    /// Returns true if the error happened while establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error is related to TLS negotiation or
    /// certificate checks.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true for malformed framing, illegal state transitions, and
    /// other fatal protocol violations. These are never retried.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error is related to a request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if a stream was reset by the peer.
    pub fn is_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::Reset(_))
    }

    /// The reset code, if the peer reset our stream.
    pub fn reset_code(&self) -> Option<ErrorCode> {
        match self.inner.kind {
            Kind::Reset(code) => Some(code),
            _ => None,
        }
    }

    /// Returns true if the connection was shut down (GOAWAY or local close)
    /// before this exchange could complete.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    /// Returns true if the dispatcher rejected the call because it was shut
    /// down.
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.kind, Kind::Rejected)
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    pub(crate) fn kind_is_retryable_route_failure(&self) -> bool {
        // Protocol violations, TLS verification failures, and user
        // cancellation are final no matter how many routes remain.
        !matches!(
            self.inner.kind,
            Kind::Protocol | Kind::Tls | Kind::Canceled | Kind::Builder | Kind::Rejected
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        if !self.inner.suppressed.is_empty() {
            builder.field("suppressed", &self.inner.suppressed);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Canceled => f.write_str("call canceled")?,
            Kind::Timeout => f.write_str("call timed out")?,
            Kind::Connect => f.write_str("error connecting")?,
            Kind::Tls => f.write_str("tls error")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Reset(code) => write!(f, "stream reset ({code})")?,
            Kind::Shutdown => f.write_str("connection shut down")?,
            Kind::Rejected => f.write_str("dispatcher rejected call")?,
        };

        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        if !self.inner.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.inner.suppressed.len())?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Builder,
    Request,
    Canceled,
    Timeout,
    Connect,
    Tls,
    Protocol,
    Body,
    Reset(ErrorCode),
    Shutdown,
    Rejected,
}

/// The leaf cause recorded when an operation exceeds its deadline.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

/// The leaf cause recorded when the user cancels a call.
#[derive(Debug)]
pub(crate) struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("canceled")
    }
}

impl StdError for Canceled {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Request, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::request(TimedOut);
        assert!(err.is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::request(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn is_canceled_through_chain() {
        let err = Error::request(Error::canceled());
        assert!(err.is_canceled());
        assert!(!err.is_timeout());
    }

    #[test]
    fn suppressed_accumulation() {
        let mut primary = Error::connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        primary.push_suppressed(Error::timeout());
        primary.push_suppressed(Error::connect("unreachable"));

        assert_eq!(primary.suppressed().len(), 2);
        let rendered = primary.to_string();
        assert!(rendered.contains("+2 suppressed"), "{rendered}");
    }

    #[test]
    fn reset_code_surfaces() {
        let err = Error::reset(ErrorCode::REFUSED_STREAM);
        assert_eq!(err.reset_code(), Some(ErrorCode::REFUSED_STREAM));
        assert!(err.is_reset());
    }

    #[test]
    fn is_connection_reset() {
        let err = Error::request(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.is_connection_reset());
    }
}
