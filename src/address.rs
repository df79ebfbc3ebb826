//! The immutable fingerprint of a logical origin.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use http::Uri;

use crate::connect::SocketFactory;
use crate::dns::Resolve;
use crate::proxy::{Proxy, ProxyAuthenticator, ProxySelector};
use crate::tls::{CertificatePinner, ConnectionSpec, HostnameVerifier, Protocol, TlsSocketFactory};

/// A specification for how to reach an origin: host and port plus every
/// collaborator and parameter that affects which connections may serve it.
///
/// Two addresses with the same non-host configuration can share an HTTP/2
/// connection when certificate coverage allows it (coalescing); two
/// addresses that differ in any non-host field never share.
#[derive(Clone)]
pub struct Address {
    uri: Uri,
    host: String,
    port: u16,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls_socket_factory: Option<Arc<dyn TlsSocketFactory>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    certificate_pinner: Option<CertificatePinner>,
    proxy_authenticator: Arc<dyn ProxyAuthenticator>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: String,
        port: u16,
        dns: Arc<dyn Resolve>,
        socket_factory: Arc<dyn SocketFactory>,
        tls_socket_factory: Option<Arc<dyn TlsSocketFactory>>,
        hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
        certificate_pinner: Option<CertificatePinner>,
        proxy_authenticator: Arc<dyn ProxyAuthenticator>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        protocols: Vec<Protocol>,
        connection_specs: Vec<ConnectionSpec>,
    ) -> Address {
        let scheme = if tls_socket_factory.is_some() {
            "https"
        } else {
            "http"
        };
        let uri = Uri::builder()
            .scheme(scheme)
            .authority(format!("{host}:{port}"))
            .path_and_query("/")
            .build()
            .expect("host and port form a valid authority");
        Address {
            uri,
            host,
            port,
            dns,
            socket_factory,
            tls_socket_factory,
            hostname_verifier,
            certificate_pinner,
            proxy_authenticator,
            proxy,
            proxy_selector,
            protocols,
            connection_specs,
        }
    }

    /// A URI of the origin this address reaches: scheme, host, and port
    /// only.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The origin hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True if connections to this address negotiate TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_socket_factory.is_some()
    }

    /// Ordered application protocols to offer.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Ordered TLS profiles to attempt.
    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    /// The fixed proxy, if one was configured.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub(crate) fn dns(&self) -> &Arc<dyn Resolve> {
        &self.dns
    }

    pub(crate) fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub(crate) fn tls_socket_factory(&self) -> Option<&Arc<dyn TlsSocketFactory>> {
        self.tls_socket_factory.as_ref()
    }

    pub(crate) fn hostname_verifier(&self) -> Option<&Arc<dyn HostnameVerifier>> {
        self.hostname_verifier.as_ref()
    }

    pub(crate) fn certificate_pinner(&self) -> Option<&CertificatePinner> {
        self.certificate_pinner.as_ref()
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn ProxyAuthenticator> {
        &self.proxy_authenticator
    }

    pub(crate) fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }

    /// True if every field other than the hostname matches. This governs
    /// whether a pooled connection for `other` may be considered for this
    /// address at all (coalescing still requires certificate coverage).
    pub fn equals_non_host(&self, other: &Address) -> bool {
        self.port == other.port
            && Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.socket_factory, &other.socket_factory)
            && arc_opt_eq(&self.tls_socket_factory, &other.tls_socket_factory)
            && arc_opt_eq(&self.hostname_verifier, &other.hostname_verifier)
            && self.certificate_pinner == other.certificate_pinner
            && Arc::ptr_eq(&self.proxy_authenticator, &other.proxy_authenticator)
            && self.proxy == other.proxy
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
    }
}

fn arc_opt_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.host == other.host && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.proxy.hash(state);
        self.protocols.hash(state);
        (Arc::as_ptr(&self.dns) as *const () as usize).hash(state);
        (Arc::as_ptr(&self.socket_factory) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.is_tls())
            .field("proxy", &self.proxy)
            .field("protocols", &self.protocols)
            .finish()
    }
}
