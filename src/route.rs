//! Concrete routes and the blacklist of routes that recently failed.

use std::{collections::HashSet, fmt, net::SocketAddr, sync::Arc};

use crate::address::Address;
use crate::proxy::Proxy;
use crate::sync::Mutex;

/// One concrete way to reach an origin: the address, the proxy to go
/// through, and the resolved socket address to dial.
///
/// When connecting through an HTTP or SOCKS proxy the socket address is the
/// proxy's; otherwise it is the origin's.
#[derive(Clone)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Arc<Address>, proxy: Proxy, socket_addr: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_addr,
        }
    }

    /// The address this route reaches.
    pub fn address(&self) -> &Arc<Address> {
        &self.address
    }

    /// The proxy this route goes through.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The socket address this route dials.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// True if this route tunnels HTTPS through an HTTP proxy with
    /// `CONNECT`.
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_tls() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Route) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl Eq for Route {}

impl std::hash::Hash for Route {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.proxy.hash(state);
        self.socket_addr.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} via {:?} at {}",
            self.address.host(),
            self.address.port(),
            self.proxy,
            self.socket_addr
        )
    }
}

/// Routes that recently failed to connect.
///
/// Used only as an ordering hint: the planner moves blacklisted routes to
/// the back of the attempt list so that fresh routes are preferred, but a
/// blacklisted route is still attempted when nothing else works.
#[derive(Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub(crate) fn new() -> RouteDatabase {
        RouteDatabase::default()
    }

    /// Record a connect failure on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().insert(route.clone());
    }

    /// Record that `route` connected; it is no longer deprioritized.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().remove(route);
    }

    /// True if attempts on `route` should be postponed behind fresh routes.
    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }
}

impl fmt::Debug for RouteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDatabase")
            .field("failed", &self.failed.lock().len())
            .finish()
    }
}
