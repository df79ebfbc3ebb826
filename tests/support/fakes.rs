//! Injected collaborator fakes: a pass-through TLS factory and a socket
//! factory with per-address behavior for fallback tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use courier::tls::{
    Certificate, ConnectionSpec, Handshake, Protocol, TlsError, TlsFailure, TlsHandshaking,
    TlsSocket, TlsSocketFactory, TlsVersion,
};
use courier::{BoxedIo, Connecting, SocketFactory};

/// A TLS collaborator that performs no cryptography: the socket passes
/// through unchanged and the handshake reports a scripted identity. This
/// lets `https` flows run against plaintext loopback servers.
pub struct FakeTls {
    alpn_preference: Option<&'static str>,
    dns_names: Vec<String>,
    handshakes: Arc<AtomicUsize>,
    /// Failures served before any handshake succeeds, in order.
    failures: Mutex<Vec<TlsFailure>>,
}

impl FakeTls {
    pub fn new(alpn_preference: Option<&'static str>, dns_names: &[&str]) -> FakeTls {
        FakeTls {
            alpn_preference,
            dns_names: dns_names.iter().map(|s| s.to_string()).collect(),
            handshakes: Arc::new(AtomicUsize::new(0)),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next handshake with `failure`; later handshakes proceed
    /// unless more failures are queued.
    pub fn fail_next(self, failure: TlsFailure) -> FakeTls {
        self.failures.lock().unwrap().push(failure);
        self
    }

    /// Shared counter of attempted handshakes, failures included.
    pub fn handshake_counter(&self) -> Arc<AtomicUsize> {
        self.handshakes.clone()
    }
}

impl TlsSocketFactory for FakeTls {
    fn handshake(
        &self,
        io: BoxedIo,
        _host: &str,
        _port: u16,
        _spec: &ConnectionSpec,
        alpn: &[Protocol],
    ) -> TlsHandshaking {
        self.handshakes.fetch_add(1, Ordering::SeqCst);

        let scripted = {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some(failure) = scripted {
            return Box::pin(std::future::ready(Err(TlsError::new(
                failure,
                "scripted handshake failure",
            ))));
        }

        let negotiated = self
            .alpn_preference
            .filter(|preferred| alpn.iter().any(|p| p.alpn() == *preferred));
        let handshake = Handshake::new(
            Some(TlsVersion::Tls13),
            Some("TLS_AES_128_GCM_SHA256".to_string()),
            vec![Certificate::new(
                b"\x30\x82\x01\x0afake-der".to_vec(),
                self.dns_names.clone(),
            )],
            negotiated,
        );
        Box::pin(std::future::ready(Ok(TlsSocket { io, handshake })))
    }
}

/// What the fallback socket factory does for one resolved IP.
#[derive(Clone, Copy)]
pub enum SocketBehavior {
    /// Connect for real (to the test server).
    Connect,
    /// Accept the attempt but never complete it.
    BlackHole,
    /// Fail immediately.
    Refuse,
    /// Wait, then connect for real.
    DelayThenConnect(Duration),
}

/// A socket factory scripted per destination IP; unknown IPs connect for
/// real. Records attempted addresses.
pub struct ScriptedSocketFactory {
    behaviors: HashMap<IpAddr, SocketBehavior>,
    /// When a scripted IP ultimately connects, it dials this real address
    /// instead (test-net IPs are not routable).
    real_addr: SocketAddr,
    attempts: Arc<Mutex<Vec<SocketAddr>>>,
}

impl ScriptedSocketFactory {
    pub fn new(real_addr: SocketAddr) -> ScriptedSocketFactory {
        ScriptedSocketFactory {
            behaviors: HashMap::new(),
            real_addr,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn behavior(mut self, ip: IpAddr, behavior: SocketBehavior) -> ScriptedSocketFactory {
        self.behaviors.insert(ip, behavior);
        self
    }

    pub fn attempts_log(&self) -> Arc<Mutex<Vec<SocketAddr>>> {
        self.attempts.clone()
    }
}

impl SocketFactory for ScriptedSocketFactory {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> Connecting {
        self.attempts.lock().unwrap().push(addr);
        let behavior = self
            .behaviors
            .get(&addr.ip())
            .copied()
            .unwrap_or(SocketBehavior::Connect);
        let real_addr = self.real_addr;
        Box::pin(async move {
            let attempt = async move {
                match behavior {
                    SocketBehavior::BlackHole => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                    SocketBehavior::Refuse => Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "scripted refusal",
                    )
                    .into()),
                    SocketBehavior::DelayThenConnect(delay) => {
                        tokio::time::sleep(delay).await;
                        let stream = tokio::net::TcpStream::connect(real_addr).await?;
                        stream.set_nodelay(true)?;
                        Ok(Box::new(stream) as BoxedIo)
                    }
                    SocketBehavior::Connect => {
                        let stream = tokio::net::TcpStream::connect(real_addr).await?;
                        stream.set_nodelay(true)?;
                        Ok(Box::new(stream) as BoxedIo)
                    }
                }
            };
            if timeout > Duration::ZERO {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "scripted connect timed out",
                    )
                    .into()),
                }
            } else {
                attempt.await
            }
        })
    }
}

/// Records event hooks in order for assertions.
#[derive(Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        RecordingListener::default()
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.events.clone()
    }

    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

impl courier::EventListener for RecordingListener {
    fn call_start(&self, _uri: &courier::Uri) {
        self.push("call_start");
    }
    fn call_end(&self, _uri: &courier::Uri) {
        self.push("call_end");
    }
    fn call_failed(&self, _uri: &courier::Uri, _error: &courier::Error) {
        self.push("call_failed");
    }
    fn dns_start(&self, _host: &str) {
        self.push("dns_start");
    }
    fn dns_end(&self, _host: &str, _addresses: &[IpAddr]) {
        self.push("dns_end");
    }
    fn connect_start(&self, _route: &courier::Route) {
        self.push("connect_start");
    }
    fn connect_end(&self, _route: &courier::Route, _protocol: Option<Protocol>) {
        self.push("connect_end");
    }
    fn secure_connect_start(&self, _host: &str) {
        self.push("secure_connect_start");
    }
    fn secure_connect_end(&self, _host: &str, _handshake: &Handshake) {
        self.push("secure_connect_end");
    }
    fn request_headers_start(&self, _uri: &courier::Uri) {
        self.push("request_headers_start");
    }
    fn request_headers_end(&self, _uri: &courier::Uri) {
        self.push("request_headers_end");
    }
    fn response_headers_start(&self, _uri: &courier::Uri) {
        self.push("response_headers_start");
    }
    fn response_headers_end(&self, _uri: &courier::Uri, _status: courier::StatusCode) {
        self.push("response_headers_end");
    }
    fn response_body_end(&self, _uri: &courier::Uri, _byte_count: u64) {
        self.push("response_body_end");
    }
    fn connection_acquired(&self, _uri: &courier::Uri, _connection_id: u64) {
        self.push("connection_acquired");
    }
    fn connection_released(&self, _uri: &courier::Uri, _connection_id: u64) {
        self.push("connection_released");
    }
}
