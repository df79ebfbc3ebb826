//! The carrier: an established transport usable for one or more exchanges.
//!
//! Bookkeeping lives under the carrier's own lock. A carrier is claimed
//! (eligibility check plus call registration) atomically under that lock;
//! health checking happens after the claim, outside it.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::address::Address;
use crate::call::CallInner;
use crate::codec::{Codec, H1Transport, Http1Codec, Http2Codec};
use crate::error::{Error, Result};
use crate::events::ConnectionListener;
use crate::http2::connection::H2Connection;
use crate::proxy::Proxy;
use crate::route::Route;
use crate::sync::Mutex;
use crate::tls::{Handshake, Protocol, DEFAULT_HOSTNAME_VERIFIER};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Idle age beyond which an acquire runs the extensive health check.
pub(crate) const EXTENSIVE_HEALTH_CHECK_AFTER: Duration = Duration::from_secs(10);

pub(crate) enum Transport {
    Http1(tokio::sync::Mutex<Option<H1Transport>>),
    Http2(H2Connection),
}

pub(crate) struct Connection {
    id: u64,
    route: Route,
    handshake: Option<Handshake>,
    protocol: Protocol,
    transport: Transport,
    listener: Arc<dyn ConnectionListener>,
    /// Concurrent-exchange ceiling: 1 for HTTP/1.1, the peer's advertised
    /// `MAX_CONCURRENT_STREAMS` for HTTP/2. Shared with the engine's
    /// SETTINGS hook.
    allocation_limit: Arc<AtomicU32>,
    state: Mutex<State>,
}

struct State {
    no_new_exchanges: bool,
    no_coalesced_connections: bool,
    route_failure_count: u32,
    success_count: u64,
    refused_stream_count: u32,
    calls: Vec<Weak<CallInner>>,
    idle_since: Instant,
}

impl Connection {
    pub(crate) fn new_http1(
        route: Route,
        handshake: Option<Handshake>,
        transport: H1Transport,
        listener: Arc<dyn ConnectionListener>,
    ) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            handshake,
            protocol: Protocol::Http11,
            transport: Transport::Http1(tokio::sync::Mutex::new(Some(transport))),
            listener,
            allocation_limit: Arc::new(AtomicU32::new(1)),
            state: Mutex::new(State::new()),
        }
    }

    pub(crate) fn new_http2(
        route: Route,
        handshake: Option<Handshake>,
        engine: H2Connection,
        allocation_limit: Arc<AtomicU32>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            handshake,
            protocol: Protocol::Http2,
            transport: Transport::Http2(engine),
            listener,
            allocation_limit,
            state: Mutex::new(State::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        matches!(self.transport, Transport::Http2(_))
    }

    pub(crate) fn listener(&self) -> &Arc<dyn ConnectionListener> {
        &self.listener
    }

    /// Atomically check eligibility for `address` and register `call` as a
    /// user. Returns false without side effects when ineligible.
    pub(crate) fn try_claim(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        call: &Arc<CallInner>,
    ) -> bool {
        let mut state = self.state.lock();
        if !self.is_eligible_locked(&state, address, routes, require_multiplexed) {
            return false;
        }
        state.calls.push(Arc::downgrade(call));
        true
    }

    fn is_eligible_locked(
        &self,
        state: &State,
        address: &Address,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> bool {
        if require_multiplexed && !self.is_multiplexed() {
            return false;
        }
        if state.no_new_exchanges {
            return false;
        }
        if state.calls.len() >= self.allocation_limit.load(Ordering::Relaxed) as usize {
            return false;
        }
        if !address.equals_non_host(self.route.address()) {
            return false;
        }
        if address.host() == self.route.address().host() {
            return true;
        }

        // Host mismatch: only a coalesced multiplexed connection will do.
        if !self.is_multiplexed() || state.no_coalesced_connections {
            return false;
        }
        let Some(routes) = routes else {
            return false;
        };
        let shares_socket = matches!(self.route.proxy(), Proxy::Direct)
            && routes
                .iter()
                .any(|r| r.proxy().is_direct() && r.socket_addr() == self.route.socket_addr());
        if !shares_socket {
            return false;
        }
        match address.hostname_verifier() {
            Some(verifier) if Arc::ptr_eq(verifier, &DEFAULT_HOSTNAME_VERIFIER) => {}
            _ => return false,
        }
        let Some(handshake) = &self.handshake else {
            return false;
        };
        let covered = handshake
            .peer_certificates()
            .first()
            .map(|leaf| leaf.covers(address.host()))
            .unwrap_or(false);
        if !covered {
            return false;
        }
        if let Some(pinner) = address.certificate_pinner() {
            if pinner
                .check(address.host(), handshake.peer_certificates())
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Eligibility without claiming, for pool accounting (policy
    /// reservations, replenishment counting).
    pub(crate) fn is_eligible_for(&self, address: &Address) -> bool {
        let state = self.state.lock();
        self.is_eligible_locked(&state, address, None, false)
    }

    /// Deregister a call. Returns true if the carrier became idle.
    pub(crate) fn release(&self, call: &Arc<CallInner>) -> bool {
        let mut state = self.state.lock();
        let target = Arc::as_ptr(call);
        state.calls.retain(|weak| weak.as_ptr() != target);
        if state.calls.is_empty() {
            state.idle_since = Instant::now();
            true
        } else {
            false
        }
    }

    /// Forbid new exchanges. Sticky; never cleared.
    pub(crate) fn no_new_exchanges(&self) {
        let newly = {
            let mut state = self.state.lock();
            let newly = !state.no_new_exchanges;
            state.no_new_exchanges = true;
            newly
        };
        if newly {
            self.listener.no_new_exchanges(self.id);
        }
    }

    pub(crate) fn is_no_new_exchanges(&self) -> bool {
        self.state.lock().no_new_exchanges
    }

    /// Stop offering this connection for coalesced hosts.
    pub(crate) fn no_coalesced_connections(&self) {
        self.state.lock().no_coalesced_connections = true;
    }

    /// Live calls, with dead references pruned. A dead reference means a
    /// call was dropped without releasing its carrier; that is a leak.
    pub(crate) fn call_count(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.calls.len();
        state.calls.retain(|weak| weak.strong_count() > 0);
        if state.calls.len() < before {
            warn!(
                "connection {} leaked {} call(s); a call was dropped without release",
                self.id,
                before - state.calls.len()
            );
        }
        state.calls.len()
    }

    pub(crate) fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().idle_since)
    }

    pub(crate) fn success_count(&self) -> u64 {
        self.state.lock().success_count
    }

    pub(crate) fn exchange_succeeded(&self) {
        let mut state = self.state.lock();
        state.success_count += 1;
        state.refused_stream_count = 0;
    }

    pub(crate) fn note_route_failure(&self) {
        self.state.lock().route_failure_count += 1;
    }

    /// A stream was refused. The second refusal in a row retires the
    /// carrier.
    pub(crate) fn note_refused_stream(&self) {
        let retire = {
            let mut state = self.state.lock();
            state.refused_stream_count += 1;
            state.refused_stream_count > 1
        };
        if retire {
            self.no_new_exchanges();
        }
    }

    /// Health checking. The passive form is cheap; the extensive form
    /// probes an idle HTTP/1.1 socket for a stale FIN or reset.
    pub(crate) async fn is_healthy(&self, extensive: bool) -> bool {
        if self.is_no_new_exchanges() {
            return false;
        }
        match &self.transport {
            Transport::Http2(engine) => engine.is_healthy(),
            Transport::Http1(slot) => {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    // Transport consumed and never returned: the previous
                    // exchange could not hand it back.
                    None => false,
                    Some(transport) => {
                        if !extensive {
                            return true;
                        }
                        probe_socket(transport).await
                    }
                }
            }
        }
    }

    /// Produce the codec for one exchange on this carrier.
    pub(crate) async fn acquire_codec(&self) -> Result<Codec> {
        match &self.transport {
            Transport::Http1(slot) => {
                let transport = slot
                    .lock()
                    .await
                    .take()
                    .ok_or_else(|| Error::request("connection transport unavailable"))?;
                let absolute_form = matches!(self.route.proxy(), Proxy::Http { .. })
                    && !self.route.address().is_tls();
                Ok(Codec::Http1(Http1Codec::new(transport, absolute_form)))
            }
            Transport::Http2(engine) => Ok(Codec::Http2(Http2Codec::new(
                engine.clone(),
                self.route.address().is_tls(),
            ))),
        }
    }

    /// Return an HTTP/1.1 transport after its exchange. `None` means the
    /// exchange could not hand it back; the carrier is retired.
    pub(crate) async fn release_transport(&self, transport: Option<H1Transport>) {
        match (&self.transport, transport) {
            (Transport::Http1(slot), Some(transport)) => {
                *slot.lock().await = Some(transport);
            }
            (Transport::Http1(_), None) => {
                debug!("connection {} not reusable after exchange", self.id);
                self.no_new_exchanges();
            }
            (Transport::Http2(_), _) => {}
        }
    }

    /// Close the transport. Safe to call repeatedly.
    pub(crate) fn close(&self) {
        self.no_new_exchanges();
        match &self.transport {
            Transport::Http1(slot) => {
                if let Ok(mut guard) = slot.try_lock() {
                    *guard = None;
                }
            }
            Transport::Http2(engine) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let engine = engine.clone();
                    handle.spawn(async move {
                        engine.shutdown(crate::http2::ErrorCode::NO_ERROR).await;
                        engine.close().await;
                    });
                }
            }
        }
        self.listener.connection_closed(self.id);
    }
}

impl State {
    fn new() -> State {
        State {
            no_new_exchanges: false,
            no_coalesced_connections: false,
            route_failure_count: 0,
            success_count: 0,
            refused_stream_count: 0,
            calls: Vec::new(),
            idle_since: Instant::now(),
        }
    }
}

async fn probe_socket(transport: &mut H1Transport) -> bool {
    if !transport.read_buf.is_empty() {
        // Bytes arrived outside any exchange: the peer is confused.
        return false;
    }
    let mut byte = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(1), transport.io.read(&mut byte)).await {
        // Nothing readable within the probe window: the socket is quiet
        // and alive.
        Err(_elapsed) => true,
        // EOF, unsolicited data, or an error: stale.
        Ok(_) => false,
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}
