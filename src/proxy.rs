//! Proxy selection and proxy authentication collaborators.
//!
//! The engine never discovers system proxies on its own; a fixed [`Proxy`]
//! or an injected [`ProxySelector`] decides which proxies to try for an
//! address, and an injected [`ProxyAuthenticator`] answers `407` challenges
//! during `CONNECT` tunneling.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header::HeaderValue, Uri};

use crate::route::Route;

/// How to reach an origin for one connect attempt.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy: connect straight to the origin.
    Direct,
    /// An HTTP proxy. Plaintext requests are sent in absolute-form; HTTPS
    /// requests are tunneled with `CONNECT`.
    Http {
        /// Proxy hostname, resolved through the address's DNS.
        host: String,
        /// Proxy port.
        port: u16,
    },
    /// A SOCKS proxy. The wire protocol is the socket factory's concern.
    Socks {
        /// Proxy hostname, resolved through the address's DNS.
        host: String,
        /// Proxy port.
        port: u16,
    },
}

impl Proxy {
    /// Shorthand for an HTTP proxy.
    pub fn http(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Http {
            host: host.into(),
            port,
        }
    }

    /// Shorthand for a SOCKS proxy.
    pub fn socks(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Socks {
            host: host.into(),
            port,
        }
    }

    /// True if this is [`Proxy::Direct`].
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    /// The host the planner must resolve to reach this proxy, if any.
    pub(crate) fn host(&self) -> Option<(&str, u16)> {
        match self {
            Proxy::Direct => None,
            Proxy::Http { host, port } | Proxy::Socks { host, port } => Some((host, *port)),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("Direct"),
            Proxy::Http { host, port } => write!(f, "Http({host}:{port})"),
            Proxy::Socks { host, port } => write!(f, "Socks({host}:{port})"),
        }
    }
}

/// Selects the proxies to attempt for a URI, in order.
///
/// An empty result is treated as `[Proxy::Direct]`.
pub trait ProxySelector: Send + Sync {
    /// Proxies to try for `uri`, most preferred first.
    fn select(&self, uri: &Uri) -> Vec<Proxy>;
}

/// A selector that never proxies.
#[derive(Debug, Default)]
pub(crate) struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _uri: &Uri) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// Answers `407 Proxy Authentication Required` during tunneling.
///
/// Returning `None` means there are no credentials to offer and the tunnel
/// fails. The returned request replaces the pending `CONNECT` request; the
/// implementation typically copies it and adds `Proxy-Authorization`.
///
/// Called outside all engine locks. Implementations must not call back into
/// the client synchronously.
pub trait ProxyAuthenticator: Send + Sync {
    /// Produce an authenticated `CONNECT` request, or `None` to give up.
    fn authenticate(
        &self,
        route: &Route,
        response: &http::Response<()>,
    ) -> Option<http::Request<()>>;
}

/// An authenticator that never has credentials.
#[derive(Debug, Default)]
pub(crate) struct NoAuthentication;

impl ProxyAuthenticator for NoAuthentication {
    fn authenticate(
        &self,
        _route: &Route,
        _response: &http::Response<()>,
    ) -> Option<http::Request<()>> {
        None
    }
}

/// Encode a username and password pair as a `Basic` credential header value.
pub fn encode_basic_auth(username: &str, password: &str) -> HeaderValue {
    let credential = STANDARD.encode(format!("{username}:{password}"));
    let mut value = HeaderValue::try_from(format!("Basic {credential}"))
        .expect("base64 is always a valid header value");
    value.set_sensitive(true);
    value
}
