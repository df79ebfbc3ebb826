//! The connection pool: shares carriers across calls, evicts the idle, and
//! keeps configured addresses warm.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use log::{debug, trace};
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::address::Address;
use crate::call::CallInner;
use crate::connection::{Connection, EXTENSIVE_HEALTH_CHECK_AFTER};
use crate::error::Result;
use crate::route::Route;
use crate::sync::Mutex;

/// Keeps a minimum number of warm connections to one address.
#[derive(Clone, Debug)]
pub struct AddressPolicy {
    /// How many concurrent calls the address should be able to carry
    /// without a fresh connect. One multiplexed connection satisfies any
    /// minimum.
    pub minimum_concurrent_calls: usize,
    /// Delay before retrying after a failed warm-up connect.
    pub backoff_delay_millis: u64,
    /// Random jitter applied to the backoff delay.
    pub backoff_jitter_millis: u64,
}

impl Default for AddressPolicy {
    fn default() -> AddressPolicy {
        AddressPolicy {
            minimum_concurrent_calls: 0,
            backoff_delay_millis: 60_000,
            backoff_jitter_millis: 100,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolConfig {
    pub max_idle_connections: usize,
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// Synthesizes a warm connection to an address, on behalf of a policy.
pub(crate) type WarmConnector =
    Arc<dyn Fn(Address) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// The pool of live connections. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    policies: Mutex<HashMap<Address, AddressPolicy>>,
    replenishing: Mutex<Vec<Address>>,
    cleanup_running: AtomicBool,
    cleanup_notify: Notify,
    /// Addresses with a multiplexed-only connect in flight. At most one
    /// such connect runs per address; siblings wait and re-check the pool.
    connecting: Mutex<std::collections::HashSet<Address>>,
    connecting_notify: Notify,
    warm_connector: Mutex<Option<WarmConnector>>,
}

/// Releases the per-address connecting slot when the attempt settles.
pub(crate) struct ConnectingGuard {
    pool: Weak<PoolInner>,
    address: Address,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.connecting.lock().remove(&self.address);
            pool.connecting_notify.notify_waiters();
        }
    }
}

enum CleanupDelay {
    /// Run again after this long (zero means immediately).
    After(Duration),
    /// Nothing left to watch.
    Cancel,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(Vec::new()),
                policies: Mutex::new(HashMap::new()),
                replenishing: Mutex::new(Vec::new()),
                cleanup_running: AtomicBool::new(false),
                cleanup_notify: Notify::new(),
                connecting: Mutex::new(std::collections::HashSet::new()),
                connecting_notify: Notify::new(),
                warm_connector: Mutex::new(None),
            }),
        }
    }

    /// Connections currently carrying no calls.
    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.call_count() == 0)
            .count()
    }

    /// All connections in the pool.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Close and remove every connection that has no active calls.
    pub fn evict_all(&self) {
        let victims: Vec<Arc<Connection>> = {
            let mut connections = self.inner.connections.lock();
            let (keep, evict) = std::mem::take(&mut *connections)
                .into_iter()
                .partition(|c| c.call_count() > 0);
            *connections = keep;
            evict
        };
        for connection in victims {
            debug!("evicting connection {}", connection.id());
            connection.close();
        }
    }

    /// Keep `address` warm according to `policy`. Upserts and (re)starts
    /// the replenishment task.
    pub fn set_policy(&self, address: Address, policy: AddressPolicy) {
        self.inner
            .policies
            .lock()
            .insert(address.clone(), policy);
        self.inner.ensure_replenish_task(address);
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }
}

impl PoolInner {
    /// Install the connector the replenishment tasks use. Done once by the
    /// client after its route/connect machinery exists.
    pub(crate) fn set_warm_connector(&self, connector: WarmConnector) {
        *self.warm_connector.lock() = Some(connector);
    }

    /// Find a healthy pooled connection for `address` and claim it for
    /// `call`. Eligibility and claiming are atomic under each carrier's
    /// lock; the health check runs after, and a failed check retires the
    /// carrier and moves on.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        address: &Address,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        extensive_health: bool,
        call: &Arc<CallInner>,
    ) -> Option<Arc<Connection>> {
        let candidates: Vec<Arc<Connection>> = self.connections.lock().clone();
        let now = Instant::now();
        for connection in candidates {
            if !connection.try_claim(address, routes, require_multiplexed, call) {
                continue;
            }
            let extensive =
                extensive_health && connection.idle_duration(now) >= EXTENSIVE_HEALTH_CHECK_AFTER;
            if connection.is_healthy(extensive).await {
                trace!("reusing connection {} for {}", connection.id(), address.host());
                return Some(connection);
            }
            debug!("pooled connection {} failed health check", connection.id());
            if connection.is_multiplexed() {
                // Other hosts must stop coalescing onto it as well.
                connection.no_coalesced_connections();
            }
            connection.no_new_exchanges();
            connection.release(call);
            if connection.call_count() == 0 {
                self.remove(&connection);
                connection.close();
            }
        }
        None
    }

    /// Register a fresh connection. The caller has already claimed it for
    /// the connecting call.
    pub(crate) fn put(self: &Arc<Self>, connection: Arc<Connection>) {
        self.connections.lock().push(connection);
        self.ensure_cleanup_task();
    }

    /// A call released its carrier and the carrier now has no users.
    /// Returns true if the pool relinquished it: the caller must close it.
    pub(crate) fn connection_became_idle(self: &Arc<Self>, connection: &Arc<Connection>) -> bool {
        if connection.is_no_new_exchanges() || self.config.max_idle_connections == 0 {
            self.remove(connection);
            true
        } else {
            self.cleanup_notify.notify_one();
            false
        }
    }

    /// Take the per-address connecting slot, or `None` if another task
    /// holds it. Used for addresses whose connections are known to be
    /// multiplexed, where a second connect would only be torn down again.
    pub(crate) fn try_start_connecting(
        self: &Arc<Self>,
        address: &Address,
    ) -> Option<ConnectingGuard> {
        let mut connecting = self.connecting.lock();
        if connecting.contains(address) {
            return None;
        }
        connecting.insert(address.clone());
        Some(ConnectingGuard {
            pool: Arc::downgrade(self),
            address: address.clone(),
        })
    }

    /// Wait until some connecting slot is released.
    pub(crate) async fn wait_connecting(&self) {
        self.connecting_notify.notified().await;
    }

    /// SETTINGS changed a carrier's stream ceiling: a lower limit may need
    /// sibling connections, a higher one may leave some evictable.
    pub(crate) fn on_allocation_limit_changed(self: &Arc<Self>) {
        self.cleanup_notify.notify_one();
    }

    fn remove(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, connection));
    }

    pub(crate) fn count_eligible(&self, address: &Address) -> (usize, bool) {
        let connections = self.connections.lock();
        let mut count = 0;
        let mut multiplexed = false;
        for connection in connections.iter() {
            if connection.is_eligible_for(address) {
                count += 1;
                multiplexed |= connection.is_multiplexed();
            }
        }
        (count, multiplexed)
    }

    fn ensure_cleanup_task(self: &Arc<Self>) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            cleanup_loop(pool).await;
        });
    }

    /// One cleanup pass: pick the single longest-idle evictable
    /// connection; evict it if it outlived the keep-alive or the idle
    /// budget is exceeded. Returns when to run again.
    fn cleanup_pass(self: &Arc<Self>, now: Instant) -> CleanupDelay {
        let connections: Vec<Arc<Connection>> = self.connections.lock().clone();
        if connections.is_empty() {
            return CleanupDelay::Cancel;
        }

        // Reserve idle connections a policy wants kept warm.
        let mut reservations: HashMap<Address, usize> = self
            .policies
            .lock()
            .iter()
            .filter(|(_, p)| p.minimum_concurrent_calls > 0)
            .map(|(a, p)| (a.clone(), p.minimum_concurrent_calls))
            .collect();

        let mut in_use = 0usize;
        let mut evictable: Vec<(Arc<Connection>, Duration)> = Vec::new();
        for connection in connections {
            if connection.call_count() > 0 {
                in_use += 1;
                continue;
            }
            let reserved = reservations.iter_mut().find_map(|(address, quota)| {
                (*quota > 0 && connection.is_eligible_for(address)).then(|| quota)
            });
            if let Some(quota) = reserved {
                *quota -= 1;
                continue;
            }
            let idle_for = connection.idle_duration(now);
            evictable.push((connection, idle_for));
        }

        let Some((victim, longest_idle)) = evictable
            .iter()
            .max_by_key(|(_, idle)| *idle)
            .map(|(c, d)| (c.clone(), *d))
        else {
            return if in_use > 0 {
                CleanupDelay::After(self.config.keep_alive)
            } else {
                CleanupDelay::Cancel
            };
        };

        if longest_idle >= self.config.keep_alive
            || evictable.len() > self.config.max_idle_connections
        {
            debug!(
                "evicting connection {} idle for {:?}",
                victim.id(),
                longest_idle
            );
            self.remove(&victim);
            victim.close();
            return CleanupDelay::After(Duration::ZERO);
        }

        CleanupDelay::After(self.config.keep_alive - longest_idle)
    }

    fn ensure_replenish_task(self: &Arc<Self>, address: Address) {
        {
            let mut replenishing = self.replenishing.lock();
            if replenishing.contains(&address) {
                return;
            }
            replenishing.push(address.clone());
        }
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            replenish_loop(pool, address).await;
        });
    }

    fn policy_satisfied(&self, address: &Address, minimum: usize) -> bool {
        let (count, multiplexed) = self.count_eligible(address);
        multiplexed || count >= minimum
    }
}

async fn cleanup_loop(pool: Weak<PoolInner>) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        match pool.cleanup_pass(Instant::now()) {
            CleanupDelay::Cancel => {
                pool.cleanup_running.store(false, Ordering::SeqCst);
                // A connection added between the pass and the flag store
                // must not be left unwatched.
                if !pool.connections.lock().is_empty() {
                    pool.ensure_cleanup_task();
                }
                return;
            }
            CleanupDelay::After(delay) => {
                let notified = pool.cleanup_notify.notified();
                if delay > Duration::ZERO {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notified => {}
                    }
                }
            }
        }
    }
}

async fn replenish_loop(pool: Weak<PoolInner>, address: Address) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        let Some(policy) = pool.policies.lock().get(&address).cloned() else {
            pool.replenishing.lock().retain(|a| a != &address);
            return;
        };

        let backoff = Duration::from_millis(jittered(
            policy.backoff_delay_millis,
            policy.backoff_jitter_millis,
        ));

        if policy.minimum_concurrent_calls == 0
            || pool.policy_satisfied(&address, policy.minimum_concurrent_calls)
        {
            drop(pool);
            tokio::time::sleep(backoff).await;
            continue;
        }

        let Some(connector) = pool.warm_connector.lock().clone() else {
            pool.replenishing.lock().retain(|a| a != &address);
            return;
        };
        drop(pool);

        match connector(address.clone()).await {
            Ok(()) => {
                trace!("warmed a connection for {}", address.host());
            }
            Err(e) => {
                debug!("warm-up connect for {} failed: {e}", address.host());
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn jittered(delay_millis: u64, jitter_millis: u64) -> u64 {
    if jitter_millis == 0 {
        return delay_millis;
    }
    let jitter = rand::rng().random_range(0..=2 * jitter_millis) as i64 - jitter_millis as i64;
    delay_millis.saturating_add_signed(jitter)
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}
