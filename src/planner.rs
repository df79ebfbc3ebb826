//! Route planning: expands an address into an ordered stream of connect
//! plans, preferring pooled multiplexed carriers, deferred fallback plans,
//! and fresh routes in that order.

use std::{collections::VecDeque, sync::Arc};

use log::trace;

use crate::address::Address;
use crate::call::CallInner;
use crate::connect::{ConnectContext, ConnectPlan};
use crate::connection::Connection;
use crate::dns::Name;
use crate::error::{Error, Result};
use crate::pool::PoolInner;
use crate::proxy::Proxy;
use crate::route::{Route, RouteDatabase};

pub(crate) enum Plan {
    /// An existing carrier claimed from the pool.
    Pooled(Arc<Connection>),
    /// A connect attempt to drive.
    Connect(ConnectPlan),
}

pub(crate) struct RoutePlanner {
    address: Arc<Address>,
    call: Arc<CallInner>,
    pool: Arc<PoolInner>,
    route_db: Arc<RouteDatabase>,
    ctx: Arc<ConnectContext>,
    extensive_health: bool,
    /// Remaining proxies to expand, or `None` before the first expansion.
    proxies: Option<std::vec::IntoIter<Proxy>>,
    /// Routes for the proxy currently being consumed.
    routes: VecDeque<Route>,
    /// Every route produced so far; offered to the pool for coalescing.
    planned_routes: Vec<Route>,
    /// Fallback plans pushed back by failed attempts; tried before any
    /// fresh route.
    deferred: VecDeque<ConnectPlan>,
}

impl RoutePlanner {
    pub(crate) fn new(
        address: Arc<Address>,
        call: Arc<CallInner>,
        pool: Arc<PoolInner>,
        route_db: Arc<RouteDatabase>,
        ctx: Arc<ConnectContext>,
        extensive_health: bool,
    ) -> RoutePlanner {
        RoutePlanner {
            address,
            call,
            pool,
            route_db,
            ctx,
            extensive_health,
            proxies: None,
            routes: VecDeque::new(),
            planned_routes: Vec::new(),
            deferred: VecDeque::new(),
        }
    }

    /// The next plan to try, or an error once every proxy, route, and
    /// deferred fallback is spent.
    pub(crate) async fn plan(&mut self) -> Result<Plan> {
        // Another call may have built a coalescible multiplexed carrier
        // since we last looked; reusing it beats dialing.
        if let Some(connection) = self
            .pool
            .acquire(
                &self.address,
                Some(&self.planned_routes),
                true,
                self.extensive_health,
                &self.call,
            )
            .await
        {
            trace!("found pooled multiplexed carrier for {}", self.address.host());
            return Ok(Plan::Pooled(connection));
        }

        if let Some(plan) = self.deferred.pop_front() {
            return Ok(Plan::Connect(plan));
        }

        let route = self.next_route().await?;
        self.planned_routes.push(route.clone());
        Ok(Plan::Connect(ConnectPlan::new(route, self.ctx.clone())))
    }

    /// A failed attempt produced a follow-up (next connection spec or a
    /// fresh-socket tunnel retry); it goes ahead of any fresh route.
    pub(crate) fn push_deferred(&mut self, plan: ConnectPlan) {
        self.deferred.push_front(plan);
    }

    /// Monotone: once false it stays false until a deferred plan is pushed
    /// back.
    pub(crate) fn has_next(&self) -> bool {
        if !self.deferred.is_empty() || !self.routes.is_empty() {
            return true;
        }
        match &self.proxies {
            None => true,
            Some(remaining) => remaining.len() > 0,
        }
    }

    async fn next_route(&mut self) -> Result<Route> {
        loop {
            if let Some(route) = self.routes.pop_front() {
                return Ok(route);
            }
            let proxy = self.next_proxy()?;
            self.routes = self.resolve_routes(proxy).await?;
        }
    }

    fn next_proxy(&mut self) -> Result<Proxy> {
        let proxies = match &mut self.proxies {
            Some(proxies) => proxies,
            None => {
                let mut list = match self.address.proxy() {
                    Some(fixed) => vec![fixed.clone()],
                    None => self
                        .address
                        .proxy_selector()
                        .select(self.address.uri()),
                };
                if list.is_empty() {
                    list.push(Proxy::Direct);
                }
                self.proxies = Some(list.into_iter());
                self.proxies.as_mut().expect("just set")
            }
        };
        proxies
            .next()
            .ok_or_else(|| Error::connect("exhausted all routes"))
    }

    /// Resolve the routes for one proxy: the origin's host for DIRECT, the
    /// proxy's own host otherwise. Provider order is preserved, except that
    /// routes that recently failed move to the back.
    async fn resolve_routes(&mut self, proxy: Proxy) -> Result<VecDeque<Route>> {
        let (host, port) = match proxy.host() {
            None => (self.address.host().to_string(), self.address.port()),
            Some((host, port)) => (host.to_string(), port),
        };

        self.ctx.events.dns_start(&host);
        let addresses = self
            .address
            .dns()
            .resolve(Name::from(host.as_str()))
            .await
            .map_err(Error::connect)?;
        self.ctx.events.dns_end(&host, &addresses);

        let mut fresh = VecDeque::with_capacity(addresses.len());
        let mut postponed = Vec::new();
        for ip in addresses {
            let route = Route::new(
                self.address.clone(),
                proxy.clone(),
                std::net::SocketAddr::new(ip, port),
            );
            if self.route_db.should_postpone(&route) {
                postponed.push(route);
            } else {
                fresh.push_back(route);
            }
        }
        fresh.extend(postponed);
        if fresh.is_empty() {
            return Err(Error::connect(format!("no routes to {host}")));
        }
        Ok(fresh)
    }
}

impl std::fmt::Debug for RoutePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePlanner")
            .field("address", &self.address)
            .field("deferred", &self.deferred.len())
            .field("routes", &self.routes.len())
            .finish()
    }
}
