use std::fmt;

use http::{header::HeaderMap, Method, Uri};

use crate::body::Body;
use crate::error::{Error, Result};

/// A request ready for dispatch: method, target URI, headers, and body.
///
/// The engine treats the URI as opaque beyond scheme, host, port, and
/// path: surface syntax, normalization, and redirects belong to layers
/// above.
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
}

impl Request {
    /// Constructs a new request.
    pub fn new(method: Method, uri: Uri) -> Request {
        Request {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    /// Convenience for a GET request from a URI string.
    pub fn get(uri: &str) -> Result<Request> {
        let uri: Uri = uri.parse().map_err(Error::builder)?;
        Ok(Request::new(Method::GET, uri))
    }

    /// Convenience for a POST request with a body.
    pub fn post(uri: &str, body: impl Into<Body>) -> Result<Request> {
        let uri: Uri = uri.parse().map_err(Error::builder)?;
        let mut request = Request::new(Method::POST, uri);
        request.body = body.into();
        Ok(request)
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replace the request body.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub(crate) fn host(&self) -> Result<&str> {
        self.uri
            .host()
            .ok_or_else(|| Error::builder("request uri has no host"))
    }

    pub(crate) fn port(&self) -> u16 {
        self.uri.port_u16().unwrap_or(match self.uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        })
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.uri.scheme_str() == Some("https")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_follow_scheme() {
        let req = Request::get("http://example.com/a").unwrap();
        assert_eq!(req.port(), 80);
        assert!(!req.is_tls());

        let req = Request::get("https://example.com/a").unwrap();
        assert_eq!(req.port(), 443);
        assert!(req.is_tls());

        let req = Request::get("https://example.com:8443/a").unwrap();
        assert_eq!(req.port(), 8443);
    }

    #[test]
    fn rejects_relative_uris() {
        assert!(Request::get("/just/a/path").unwrap().host().is_err());
    }
}
