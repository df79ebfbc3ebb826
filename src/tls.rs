//! TLS as a collaborator.
//!
//! The engine never links a TLS stack. An injected [`TlsSocketFactory`]
//! wraps an established TCP socket and performs the handshake; the engine
//! supplies the [`ConnectionSpec`] to negotiate under and the ordered ALPN
//! [`Protocol`] list, then checks the resulting [`Handshake`] against the
//! address's [`HostnameVerifier`] and [`CertificatePinner`].

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::connect::BoxedIo;
use crate::error::BoxError;

/// An application protocol, in ALPN terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `http/1.1`.
    Http11,
    /// `h2`, negotiated via ALPN over TLS.
    Http2,
    /// `h2` with prior knowledge on a cleartext socket.
    H2PriorKnowledge,
}

impl Protocol {
    /// The ALPN identifier for this protocol.
    pub fn alpn(&self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 | Protocol::H2PriorKnowledge => "h2",
        }
    }

    pub(crate) fn from_alpn(alpn: &str) -> Option<Protocol> {
        match alpn {
            "http/1.1" => Some(Protocol::Http11),
            "h2" => Some(Protocol::Http2),
            _ => None,
        }
    }

    /// True for the multiplexed protocols.
    pub fn is_multiplexed(&self) -> bool {
        !matches!(self, Protocol::Http11)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn())
    }
}

/// A TLS protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0, kept only for the most permissive fallback profile.
    Tls10,
    /// TLS 1.1.
    Tls11,
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// An ordered TLS negotiation profile: enabled protocol versions, an
/// optional cipher-suite allowlist, and whether modern extensions (ALPN,
/// SNI, session tickets) may be used.
///
/// Connect attempts walk the address's spec list in order; a retryable
/// handshake failure under one spec falls back to the next compatible one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    name: &'static str,
    is_tls: bool,
    tls_versions: Vec<TlsVersion>,
    cipher_suites: Option<Vec<String>>,
    supports_tls_extensions: bool,
}

impl ConnectionSpec {
    /// A modern profile: TLS 1.2+ with extensions.
    pub fn modern_tls() -> ConnectionSpec {
        ConnectionSpec {
            name: "modern_tls",
            is_tls: true,
            tls_versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            cipher_suites: None,
            supports_tls_extensions: true,
        }
    }

    /// A backwards-compatible profile for legacy servers: TLS 1.0+.
    pub fn compatible_tls() -> ConnectionSpec {
        ConnectionSpec {
            name: "compatible_tls",
            is_tls: true,
            tls_versions: vec![
                TlsVersion::Tls13,
                TlsVersion::Tls12,
                TlsVersion::Tls11,
                TlsVersion::Tls10,
            ],
            cipher_suites: None,
            supports_tls_extensions: true,
        }
    }

    /// An unencrypted, unauthenticated profile.
    pub fn cleartext() -> ConnectionSpec {
        ConnectionSpec {
            name: "cleartext",
            is_tls: false,
            tls_versions: Vec::new(),
            cipher_suites: None,
            supports_tls_extensions: false,
        }
    }

    /// Restrict the profile to an explicit cipher-suite allowlist.
    pub fn with_cipher_suites(mut self, suites: Vec<String>) -> ConnectionSpec {
        self.cipher_suites = Some(suites);
        self
    }

    /// Whether this profile negotiates TLS at all.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// Enabled TLS versions, most preferred first.
    pub fn tls_versions(&self) -> &[TlsVersion] {
        &self.tls_versions
    }

    /// The cipher-suite allowlist, or `None` for the factory's defaults.
    pub fn cipher_suites(&self) -> Option<&[String]> {
        self.cipher_suites.as_deref()
    }

    /// Whether ALPN/SNI/session tickets may be offered under this profile.
    pub fn supports_tls_extensions(&self) -> bool {
        self.supports_tls_extensions
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The default spec list: modern first, then the compatible fallback.
pub(crate) static DEFAULT_CONNECTION_SPECS: Lazy<Vec<ConnectionSpec>> =
    Lazy::new(|| vec![ConnectionSpec::modern_tls(), ConnectionSpec::compatible_tls()]);

/// A peer certificate as reported by the TLS collaborator.
///
/// The engine treats certificates as opaque: it never parses DER. The
/// factory reports the DNS names the certificate covers so that hostname
/// verification and HTTP/2 coalescing can be decided without a
/// certificate-parsing dependency.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Bytes,
    dns_names: Vec<String>,
}

impl Certificate {
    /// A certificate from its DER encoding and the DNS names it covers.
    pub fn new(der: impl Into<Bytes>, dns_names: Vec<String>) -> Certificate {
        Certificate {
            der: der.into(),
            dns_names,
        }
    }

    /// The DER encoding.
    pub fn der(&self) -> &Bytes {
        &self.der
    }

    /// DNS names covered by this certificate, wildcards included.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// True if this certificate covers `host`, honoring a single
    /// leftmost-label wildcard.
    pub fn covers(&self, host: &str) -> bool {
        self.dns_names.iter().any(|name| host_matches(name, host))
    }

    /// The pin string for this certificate, in `der/<base64>` form.
    pub fn pin(&self) -> String {
        format!("der/{}", STANDARD.encode(&self.der))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("dns_names", &self.dns_names)
            .field("der_len", &self.der.len())
            .finish()
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // One label only: "*.example.com" covers "a.example.com" but not
        // "a.b.example.com" and not "example.com" itself.
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

/// The record of a completed TLS handshake.
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    tls_version: Option<TlsVersion>,
    cipher_suite: Option<String>,
    peer_certificates: Vec<Certificate>,
    alpn_protocol: Option<Protocol>,
}

impl Handshake {
    /// A handshake record. Fields the transport cannot populate stay `None`.
    pub fn new(
        tls_version: Option<TlsVersion>,
        cipher_suite: Option<String>,
        peer_certificates: Vec<Certificate>,
        alpn: Option<&str>,
    ) -> Handshake {
        Handshake {
            tls_version,
            cipher_suite,
            peer_certificates,
            alpn_protocol: alpn.and_then(Protocol::from_alpn),
        }
    }

    /// The negotiated TLS version, if reported.
    pub fn tls_version(&self) -> Option<TlsVersion> {
        self.tls_version
    }

    /// The negotiated cipher suite, if reported.
    pub fn cipher_suite(&self) -> Option<&str> {
        self.cipher_suite.as_deref()
    }

    /// The peer's certificate chain, leaf first.
    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }

    /// The ALPN-negotiated protocol, if any.
    pub fn alpn_protocol(&self) -> Option<Protocol> {
        self.alpn_protocol
    }
}

/// A TLS-wrapped socket plus its handshake record.
pub struct TlsSocket {
    /// The encrypted stream.
    pub io: BoxedIo,
    /// What was negotiated.
    pub handshake: Handshake,
}

impl fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSocket")
            .field("handshake", &self.handshake)
            .finish()
    }
}

/// Why a handshake failed, as classified by the TLS collaborator.
///
/// The category decides whether the engine may retry the route with the
/// next (weaker) [`ConnectionSpec`]: only [`TlsFailure::Handshake`]
/// failures are candidates. A protocol violation, a rejected certificate
/// chain, or an unverified peer would fail identically under every
/// profile, so those are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsFailure {
    /// The peer violated the TLS protocol. Never retried.
    Protocol,
    /// The peer's certificate chain was rejected. Never retried.
    CertificateChain,
    /// The peer's identity could not be verified (pin mismatch and the
    /// like). Never retried.
    PeerUnverified,
    /// Any other negotiation failure, such as no shared cipher suite or a
    /// rejected protocol version. A weaker profile may be tried.
    Handshake,
}

/// A categorized handshake error from a [`TlsSocketFactory`].
pub struct TlsError {
    failure: TlsFailure,
    source: BoxError,
}

impl TlsError {
    /// An error with an explicit category.
    pub fn new(failure: TlsFailure, source: impl Into<BoxError>) -> TlsError {
        TlsError {
            failure,
            source: source.into(),
        }
    }

    /// A TLS protocol violation.
    pub fn protocol(source: impl Into<BoxError>) -> TlsError {
        TlsError::new(TlsFailure::Protocol, source)
    }

    /// A certificate-chain rejection.
    pub fn certificate_chain(source: impl Into<BoxError>) -> TlsError {
        TlsError::new(TlsFailure::CertificateChain, source)
    }

    /// An unverified-peer failure.
    pub fn peer_unverified(source: impl Into<BoxError>) -> TlsError {
        TlsError::new(TlsFailure::PeerUnverified, source)
    }

    /// A generic negotiation failure; the engine may fall back to the next
    /// connection spec.
    pub fn handshake(source: impl Into<BoxError>) -> TlsError {
        TlsError::new(TlsFailure::Handshake, source)
    }

    /// The failure category.
    pub fn failure(&self) -> TlsFailure {
        self.failure
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure {
            TlsFailure::Protocol => f.write_str("tls protocol violation")?,
            TlsFailure::CertificateChain => f.write_str("certificate chain rejected")?,
            TlsFailure::PeerUnverified => f.write_str("peer not verified")?,
            TlsFailure::Handshake => f.write_str("tls handshake failed")?,
        }
        write!(f, ": {}", self.source)
    }
}

impl fmt::Debug for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsError")
            .field("failure", &self.failure)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Alias for the `Future` type returned by a TLS factory.
pub type TlsHandshaking = Pin<Box<dyn Future<Output = Result<TlsSocket, TlsError>> + Send>>;

/// Wraps a connected socket in TLS.
///
/// The factory decides whether `spec` is supported at all; an unsupported
/// spec should fail with [`TlsError::handshake`] so the engine can fall
/// back to the next one. When `spec.supports_tls_extensions()` is true,
/// `alpn` lists the protocols to offer, most preferred first.
pub trait TlsSocketFactory: Send + Sync {
    /// Perform the client handshake over `io` for `host:port`.
    fn handshake(
        &self,
        io: BoxedIo,
        host: &str,
        port: u16,
        spec: &ConnectionSpec,
        alpn: &[Protocol],
    ) -> TlsHandshaking;
}

/// Decides whether a handshake's certificates are acceptable for a host.
///
/// Called outside all engine locks.
pub trait HostnameVerifier: Send + Sync {
    /// True if `handshake`'s peer identity covers `host`.
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

struct StrictHostnameVerifier;

impl HostnameVerifier for StrictHostnameVerifier {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        handshake
            .peer_certificates()
            .first()
            .map(|leaf| leaf.covers(host))
            .unwrap_or(false)
    }
}

/// The strict default verifier. HTTP/2 coalescing requires the address to
/// use exactly this verifier, compared by identity.
pub(crate) static DEFAULT_HOSTNAME_VERIFIER: Lazy<Arc<dyn HostnameVerifier>> =
    Lazy::new(|| Arc::new(StrictHostnameVerifier));

/// Constrains which certificates are accepted for a host, by pin.
///
/// Pins are matched against [`Certificate::pin`]. A host with no configured
/// pins passes trivially. Violations are fatal and never retried.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificatePinner {
    pins: Vec<(String, String)>,
}

impl CertificatePinner {
    /// A pinner with no pins.
    pub fn new() -> CertificatePinner {
        CertificatePinner::default()
    }

    /// Pin `host` (or `*.suffix`) to `pin`.
    pub fn add(mut self, pattern: &str, pin: &str) -> CertificatePinner {
        self.pins.push((pattern.to_string(), pin.to_string()));
        self
    }

    fn pins_for(&self, host: &str) -> Vec<&str> {
        self.pins
            .iter()
            .filter(|(pattern, _)| host_matches(pattern, host))
            .map(|(_, pin)| pin.as_str())
            .collect()
    }

    /// Check `chain` (leaf first) against the pins for `host`.
    pub fn check(&self, host: &str, chain: &[Certificate]) -> Result<(), BoxError> {
        let pins = self.pins_for(host);
        if pins.is_empty() {
            return Ok(());
        }
        for certificate in chain {
            let pin = certificate.pin();
            if pins.iter().any(|p| *p == pin) {
                return Ok(());
            }
        }
        Err(format!("certificate pinning failure for {host}").into())
    }

    /// True if any pin applies to `host`.
    pub fn has_pins_for(&self, host: &str) -> bool {
        !self.pins_for(host).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(names: &[&str]) -> Certificate {
        Certificate::new(
            Bytes::from_static(b"\x30\x82\x01\x00fake"),
            names.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn wildcard_matching_is_single_label() {
        let c = cert(&["*.example.com"]);
        assert!(c.covers("a.example.com"));
        assert!(c.covers("A.EXAMPLE.com"));
        assert!(!c.covers("example.com"));
        assert!(!c.covers("a.b.example.com"));
    }

    #[test]
    fn strict_verifier_checks_leaf_only() {
        let handshake = Handshake::new(
            Some(TlsVersion::Tls13),
            None,
            vec![cert(&["h2.example"]), cert(&["other.example"])],
            Some("h2"),
        );
        assert!(DEFAULT_HOSTNAME_VERIFIER.verify("h2.example", &handshake));
        assert!(!DEFAULT_HOSTNAME_VERIFIER.verify("other.example", &handshake));
    }

    #[test]
    fn pinner_passes_without_pins_and_enforces_with() {
        let leaf = cert(&["pinned.example"]);
        let pinner = CertificatePinner::new();
        assert!(pinner.check("pinned.example", &[leaf.clone()]).is_ok());

        let pinner = CertificatePinner::new().add("pinned.example", &leaf.pin());
        assert!(pinner.check("pinned.example", &[leaf.clone()]).is_ok());

        let wrong = cert(&["pinned.example"]);
        let pinner = CertificatePinner::new().add("pinned.example", &wrong.pin());
        // Same names, different DER: the pin must not match.
        let other = Certificate::new(Bytes::from_static(b"different"), vec![]);
        assert!(pinner.check("pinned.example", &[other]).is_err());
    }

    #[test]
    fn connection_spec_fallback_order() {
        let specs = &*DEFAULT_CONNECTION_SPECS;
        assert!(specs[0].tls_versions().len() < specs[1].tls_versions().len());
        assert!(specs.iter().all(|s| s.is_tls()));
    }
}
