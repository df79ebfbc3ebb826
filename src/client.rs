//! The client: configuration, collaborator wiring, and the call factory.

use std::{fmt, sync::Arc, time::Duration};

use crate::address::Address;
use crate::call::Call;
use crate::connect::{ConnectContext, SocketFactory, TcpSocketFactory};
use crate::dispatcher::Dispatcher;
use crate::dns::{Resolve, SystemResolver};
use crate::error::{Error, Result};
use crate::events::{ConnectionListener, EventListener, NoopListener};
use crate::http2::connection::H2Settings;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::{NoAuthentication, NoProxy, Proxy, ProxyAuthenticator, ProxySelector};
use crate::request::Request;
use crate::route::RouteDatabase;
use crate::tls::{
    CertificatePinner, ConnectionSpec, HostnameVerifier, Protocol, TlsSocketFactory,
    DEFAULT_CONNECTION_SPECS, DEFAULT_HOSTNAME_VERIFIER,
};

/// A client for dispatching HTTP calls over pooled connections.
///
/// Cheap to clone; clones share the dispatcher, the connection pool, and
/// every configured collaborator. Create one and reuse it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) pool: ConnectionPool,
    pub(crate) route_db: Arc<RouteDatabase>,
    pub(crate) connect_ctx: Arc<ConnectContext>,
    pub(crate) events: Arc<dyn EventListener>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) fast_fallback: bool,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls_socket_factory: Option<Arc<dyn TlsSocketFactory>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Option<CertificatePinner>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn ProxyAuthenticator>,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a call for `request`. The call does not execute until
    /// [`Call::execute`] or [`Call::enqueue`].
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request)
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// The call dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The address fingerprint this client uses for `uri`. This is the key
    /// for [`crate::ConnectionPool::set_policy`].
    pub fn address(&self, uri: &http::Uri) -> Result<Address> {
        let request = Request::new(http::Method::GET, uri.clone());
        self.inner.address_for(&request)
    }
}

impl ClientInner {
    /// The address fingerprint for a request: host and port plus every
    /// collaborator that affects connection reuse.
    pub(crate) fn address_for(&self, request: &Request) -> Result<Address> {
        let host = request.host()?.to_string();
        let port = request.port();
        let is_tls = request.is_tls();

        if is_tls && self.tls_socket_factory.is_none() {
            return Err(Error::builder(
                "https requires a tls socket factory; none is configured",
            ));
        }

        let (tls_factory, verifier, pinner, protocols, specs) = if is_tls {
            (
                self.tls_socket_factory.clone(),
                Some(self.hostname_verifier.clone()),
                self.certificate_pinner.clone(),
                self.protocols.clone(),
                self.connection_specs.clone(),
            )
        } else {
            // Cleartext: ALPN does not apply, so HTTP/2 needs prior
            // knowledge to have been configured explicitly.
            let protocols = if self.protocols.contains(&Protocol::H2PriorKnowledge) {
                vec![Protocol::H2PriorKnowledge]
            } else {
                vec![Protocol::Http11]
            };
            (None, None, None, protocols, vec![ConnectionSpec::cleartext()])
        };

        Ok(Address::new(
            host,
            port,
            self.dns.clone(),
            self.socket_factory.clone(),
            tls_factory,
            verifier,
            pinner,
            self.proxy_authenticator.clone(),
            self.proxy.clone(),
            self.proxy_selector.clone(),
            protocols,
            specs,
        ))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    max_requests: usize,
    max_requests_per_host: usize,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    max_idle_connections: usize,
    keep_alive_duration: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    call_timeout: Duration,
    ping_interval: Duration,
    retry_on_connection_failure: bool,
    fast_fallback: bool,
    max_tunnel_attempts: u32,
    dns: Arc<dyn Resolve>,
    socket_factory: Arc<dyn SocketFactory>,
    tls_socket_factory: Option<Arc<dyn TlsSocketFactory>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Option<CertificatePinner>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn ProxyAuthenticator>,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
    event_listener: Arc<dyn EventListener>,
    connection_listener: Arc<dyn ConnectionListener>,
}

impl ClientBuilder {
    fn new() -> ClientBuilder {
        ClientBuilder {
            max_requests: 64,
            max_requests_per_host: 5,
            idle_callback: None,
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            call_timeout: Duration::ZERO,
            ping_interval: Duration::ZERO,
            retry_on_connection_failure: true,
            fast_fallback: true,
            max_tunnel_attempts: 21,
            dns: Arc::new(SystemResolver),
            socket_factory: Arc::new(TcpSocketFactory),
            tls_socket_factory: None,
            hostname_verifier: DEFAULT_HOSTNAME_VERIFIER.clone(),
            certificate_pinner: None,
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
            proxy_authenticator: Arc::new(NoAuthentication),
            protocols: vec![Protocol::Http2, Protocol::Http11],
            connection_specs: DEFAULT_CONNECTION_SPECS.clone(),
            event_listener: Arc::new(NoopListener),
            connection_listener: Arc::new(NoopListener),
        }
    }

    /// Ceiling on concurrently running dispatched calls. Default 64.
    pub fn max_requests(mut self, max: usize) -> ClientBuilder {
        self.max_requests = max;
        self
    }

    /// Per-host ceiling on concurrently running dispatched calls.
    /// Default 5.
    pub fn max_requests_per_host(mut self, max: usize) -> ClientBuilder {
        self.max_requests_per_host = max;
        self
    }

    /// Invoked whenever the dispatcher drains to zero running calls.
    pub fn idle_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> ClientBuilder {
        self.idle_callback = Some(Arc::new(callback));
        self
    }

    /// Idle connections kept per pool. Default 5; zero disables pooling.
    pub fn max_idle_connections(mut self, max: usize) -> ClientBuilder {
        self.max_idle_connections = max;
        self
    }

    /// How long an idle connection is kept. Default 5 minutes.
    pub fn keep_alive_duration(mut self, duration: Duration) -> ClientBuilder {
        self.keep_alive_duration = duration;
        self
    }

    /// TCP connect deadline per attempt. `ZERO` disables. Default 10 s.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = timeout;
        self
    }

    /// Deadline per read phase. `ZERO` disables. Default 10 s.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.read_timeout = timeout;
        self
    }

    /// Deadline per write phase. `ZERO` disables. Default 10 s.
    pub fn write_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.write_timeout = timeout;
        self
    }

    /// Deadline for the whole call. `ZERO` disables. Default unbounded.
    pub fn call_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.call_timeout = timeout;
        self
    }

    /// HTTP/2 keepalive PING cadence. `ZERO` disables. Default disabled.
    pub fn ping_interval(mut self, interval: Duration) -> ClientBuilder {
        self.ping_interval = interval;
        self
    }

    /// Whether to retry a call on a fresh connection after a reused one
    /// failed. Default true.
    pub fn retry_on_connection_failure(mut self, retry: bool) -> ClientBuilder {
        self.retry_on_connection_failure = retry;
        self
    }

    /// Whether to race staggered connect attempts across routes. Default
    /// true.
    pub fn fast_fallback(mut self, enabled: bool) -> ClientBuilder {
        self.fast_fallback = enabled;
        self
    }

    /// Ceiling on proxy `CONNECT` authentication iterations. Default 21.
    pub fn max_tunnel_attempts(mut self, max: u32) -> ClientBuilder {
        self.max_tunnel_attempts = max;
        self
    }

    /// Substitute the DNS collaborator.
    pub fn dns(mut self, dns: impl Resolve + 'static) -> ClientBuilder {
        self.dns = Arc::new(dns);
        self
    }

    /// Substitute the socket factory.
    pub fn socket_factory(mut self, factory: impl SocketFactory + 'static) -> ClientBuilder {
        self.socket_factory = Arc::new(factory);
        self
    }

    /// Install the TLS collaborator; required for `https` targets.
    pub fn tls_socket_factory(
        mut self,
        factory: impl TlsSocketFactory + 'static,
    ) -> ClientBuilder {
        self.tls_socket_factory = Some(Arc::new(factory));
        self
    }

    /// Substitute the hostname verifier. Connections to a non-default
    /// verifier's addresses are never coalesced across hostnames.
    pub fn hostname_verifier(
        mut self,
        verifier: impl HostnameVerifier + 'static,
    ) -> ClientBuilder {
        self.hostname_verifier = Arc::new(verifier);
        self
    }

    /// Constrain accepted certificates by pin.
    pub fn certificate_pinner(mut self, pinner: CertificatePinner) -> ClientBuilder {
        self.certificate_pinner = Some(pinner);
        self
    }

    /// Send every call through one fixed proxy.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxy = Some(proxy);
        self
    }

    /// Consult a selector per target URI instead of a fixed proxy.
    pub fn proxy_selector(mut self, selector: impl ProxySelector + 'static) -> ClientBuilder {
        self.proxy_selector = Arc::new(selector);
        self
    }

    /// Answers proxy authentication challenges during tunneling.
    pub fn proxy_authenticator(
        mut self,
        authenticator: impl ProxyAuthenticator + 'static,
    ) -> ClientBuilder {
        self.proxy_authenticator = Arc::new(authenticator);
        self
    }

    /// Ordered application protocols to offer. Default `[h2, http/1.1]`.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> ClientBuilder {
        self.protocols = protocols;
        self
    }

    /// Ordered TLS profiles to attempt, most preferred first.
    pub fn connection_specs(mut self, specs: Vec<ConnectionSpec>) -> ClientBuilder {
        self.connection_specs = specs;
        self
    }

    /// Observe call lifecycles.
    pub fn event_listener(mut self, listener: impl EventListener + 'static) -> ClientBuilder {
        self.event_listener = Arc::new(listener);
        self
    }

    /// Observe connection lifecycles.
    pub fn connection_listener(
        mut self,
        listener: impl ConnectionListener + 'static,
    ) -> ClientBuilder {
        self.connection_listener = Arc::new(listener);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client> {
        if self.max_requests == 0 {
            return Err(Error::builder("max_requests must be at least 1"));
        }
        if self.max_requests_per_host == 0 {
            return Err(Error::builder("max_requests_per_host must be at least 1"));
        }
        if self.keep_alive_duration == Duration::ZERO {
            return Err(Error::builder("keep_alive_duration must be positive"));
        }
        if self.protocols.is_empty() {
            return Err(Error::builder("at least one protocol is required"));
        }

        let dispatcher = Dispatcher::new(
            self.max_requests,
            self.max_requests_per_host,
            self.idle_callback,
        );
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_connections: self.max_idle_connections,
            keep_alive: self.keep_alive_duration,
        });
        let connect_ctx = Arc::new(ConnectContext {
            events: self.event_listener.clone(),
            connection_listener: self.connection_listener.clone(),
            pool: Arc::downgrade(pool.inner()),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            h2_settings: H2Settings {
                ping_interval: self.ping_interval,
            },
            max_tunnel_attempts: self.max_tunnel_attempts,
        });

        let inner = Arc::new(ClientInner {
            dispatcher,
            pool,
            route_db: Arc::new(RouteDatabase::new()),
            connect_ctx,
            events: self.event_listener,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            call_timeout: self.call_timeout,
            retry_on_connection_failure: self.retry_on_connection_failure,
            fast_fallback: self.fast_fallback,
            dns: self.dns,
            socket_factory: self.socket_factory,
            tls_socket_factory: self.tls_socket_factory,
            hostname_verifier: self.hostname_verifier,
            certificate_pinner: self.certificate_pinner,
            proxy: self.proxy,
            proxy_selector: self.proxy_selector,
            proxy_authenticator: self.proxy_authenticator,
            protocols: self.protocols,
            connection_specs: self.connection_specs,
        });

        // The pool's replenishment tasks warm connections by running an
        // exchange-less finder through the client's own machinery.
        let warm_client = Arc::downgrade(&inner);
        inner
            .pool
            .inner()
            .set_warm_connector(Arc::new(move |address: Address| {
                let warm_client = warm_client.clone();
                Box::pin(async move {
                    let Some(client) = warm_client.upgrade() else {
                        return Err(Error::request("client was dropped"));
                    };
                    warm_connect(client, address).await
                })
            }));

        Ok(Client { inner })
    }
}

/// Build one warm connection to `address` and park it in the pool.
async fn warm_connect(client: Arc<ClientInner>, address: Address) -> Result<()> {
    use crate::finder::ConnectionFinder;
    use crate::planner::RoutePlanner;

    let request = Request::new(http::Method::GET, address.uri().clone());
    let call = Call::new(client.clone(), request);
    let call_inner = call.inner_arc();
    let address = Arc::new(address);

    let planner = RoutePlanner::new(
        address.clone(),
        call_inner.clone(),
        client.pool.inner().clone(),
        client.route_db.clone(),
        client.connect_ctx.clone(),
        false,
    );
    let mut finder = ConnectionFinder::new(planner, client.route_db.clone(), client.fast_fallback);
    let found = finder.find().await?;

    if found.from_pool {
        // Claimed during planning; the warm-up call has no exchange, so
        // give it straight back.
        release_warm(&client, &found.connection, &call_inner);
        return Ok(());
    }

    client.pool.inner().put(found.connection.clone());
    release_warm(&client, &found.connection, &call_inner);
    Ok(())
}

fn release_warm(
    client: &Arc<ClientInner>,
    connection: &Arc<crate::connection::Connection>,
    call: &Arc<crate::call::CallInner>,
) {
    if connection.release(call) {
        let pool = client.pool.inner().clone();
        if pool.connection_became_idle(connection) {
            connection.close();
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("max_requests", &self.max_requests)
            .field("max_requests_per_host", &self.max_requests_per_host)
            .field("protocols", &self.protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::BoxedIo;
    use crate::http2::frame::{Frame, FrameReader, FrameWriter, Settings, CONNECTION_PREFACE};
    use crate::http2::hpack::Header;
    use crate::http2::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncReadExt;

    #[test]
    fn builder_validates_limits() {
        assert!(Client::builder().max_requests(0).build().is_err());
        assert!(Client::builder().max_requests_per_host(0).build().is_err());
        assert!(Client::builder()
            .keep_alive_duration(Duration::ZERO)
            .build()
            .is_err());
        assert!(Client::builder().protocols(Vec::new()).build().is_err());
        assert!(Client::builder().build().is_ok());
    }

    #[test]
    fn https_without_tls_factory_is_a_builder_error() {
        let client = Client::builder().build().unwrap();
        let request = Request::get("https://secure.example/").unwrap();
        let err = client.inner.address_for(&request).unwrap_err();
        assert!(err.is_builder());
    }

    /// A scripted prior-knowledge HTTP/2 origin. `refuse_at` lists, per
    /// accepted connection, the 0-based stream ordinals to refuse.
    fn h2c_origin(
        refuse_at: Vec<Vec<usize>>,
        body: &'static [u8],
    ) -> (
        std::net::SocketAddr,
        Arc<AtomicUsize>,
        Arc<StdMutex<Vec<u32>>>,
    ) {
        let accepted = Arc::new(AtomicUsize::new(0));
        let stream_ids = Arc::new(StdMutex::new(Vec::new()));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted_srv = accepted.clone();
        let ids_srv = stream_ids.clone();

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let conn_index = accepted_srv.fetch_add(1, Ordering::SeqCst);
                let refusals = refuse_at.get(conn_index).cloned().unwrap_or_default();
                let ids = ids_srv.clone();
                tokio::spawn(async move {
                    let mut magic = [0u8; CONNECTION_PREFACE.len()];
                    sock.read_exact(&mut magic).await.unwrap();
                    assert_eq!(&magic[..], CONNECTION_PREFACE);

                    let (read_half, write_half) =
                        tokio::io::split(Box::new(sock) as BoxedIo);
                    let mut reader = FrameReader::new(read_half);
                    let mut writer = FrameWriter::new(write_half);
                    writer
                        .settings(&Settings {
                            max_concurrent_streams: Some(100),
                            ..Default::default()
                        })
                        .await
                        .unwrap();
                    writer.flush().await.unwrap();

                    let mut ordinal = 0usize;
                    loop {
                        match reader.read_frame().await {
                            Ok(Frame::Headers {
                                stream_id, block, ..
                            }) => {
                                reader.hpack_mut().decode(&block).unwrap();
                                ids.lock().unwrap().push(stream_id);
                                let refuse = refusals.contains(&ordinal);
                                ordinal += 1;
                                if refuse {
                                    writer
                                        .rst_stream(stream_id, ErrorCode::REFUSED_STREAM)
                                        .await
                                        .unwrap();
                                    writer.flush().await.unwrap();
                                    continue;
                                }
                                writer
                                    .headers(stream_id, &[Header::new(":status", "200")], false)
                                    .await
                                    .unwrap();
                                writer.data(stream_id, true, body).await.unwrap();
                                writer.flush().await.unwrap();
                            }
                            Ok(Frame::Settings { ack: false, .. }) => {
                                writer.settings_ack().await.unwrap();
                                writer.flush().await.unwrap();
                            }
                            Ok(_) => {}
                            Err(_) => return,
                        }
                    }
                });
            }
        });

        (addr, accepted, stream_ids)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multiplexes_concurrent_calls_on_one_connection() {
        let (addr, accepted, stream_ids) = h2c_origin(vec![], b"hello");

        let client = Client::builder()
            .protocols(vec![Protocol::H2PriorKnowledge])
            .build()
            .unwrap();
        let uri = format!("http://{addr}/");

        let bodies = futures_util::future::join_all((0..8).map(|_| {
            let client = client.clone();
            let uri = uri.clone();
            async move {
                let response = client
                    .new_call(Request::get(&uri).unwrap())
                    .execute()
                    .await
                    .unwrap();
                assert_eq!(response.status(), http::StatusCode::OK);
                assert_eq!(response.version(), http::Version::HTTP_2);
                response.bytes().await.unwrap()
            }
        }))
        .await;

        for body in bodies {
            assert_eq!(&body[..], b"hello");
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool().connection_count(), 1);

        let mut ids = stream_ids.lock().unwrap().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 5, 7, 9, 11, 13, 15]);
    }

    #[tokio::test]
    async fn refused_stream_retries_on_a_fresh_connection() {
        // The first connection serves one stream, then refuses the next;
        // the second connection serves everything.
        let (addr, accepted, _ids) = h2c_origin(vec![vec![1], vec![]], b"ok");

        let client = Client::builder()
            .protocols(vec![Protocol::H2PriorKnowledge])
            .build()
            .unwrap();
        let uri = format!("http://{addr}/");

        let first = client
            .new_call(Request::get(&uri).unwrap())
            .execute()
            .await
            .unwrap();
        assert_eq!(first.bytes().await.unwrap(), &b"ok"[..]);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // The pooled connection refuses this call's stream; the retry
        // lands on a fresh connection and succeeds with exactly one
        // response.
        let second = client
            .new_call(Request::get(&uri).unwrap())
            .execute()
            .await
            .unwrap();
        assert_eq!(second.status(), http::StatusCode::OK);
        assert_eq!(second.bytes().await.unwrap(), &b"ok"[..]);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }
}
