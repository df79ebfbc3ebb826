//! Finding a carrier for an exchange: either drive connect plans one at a
//! time, or race them with a staggered start so one slow route (an IPv6
//! black hole, typically) does not stall the call.

use std::{sync::Arc, time::Duration};

use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::connect::{BoxedIo, ConnectPlan};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::planner::{Plan, RoutePlanner};
use crate::route::RouteDatabase;

/// How long a launched TCP attempt gets before the next route is also
/// launched.
pub(crate) const FAST_FALLBACK_DELAY: Duration = Duration::from_millis(250);

/// What the finder produced: a carrier, and whether it was already
/// claimed from the pool (pooled plans claim during planning; fresh
/// connections are claimed by the exchange afterwards).
pub(crate) struct FoundConnection {
    pub connection: Arc<Connection>,
    pub from_pool: bool,
}

pub(crate) struct ConnectionFinder {
    planner: RoutePlanner,
    route_db: Arc<RouteDatabase>,
    fast_fallback: bool,
}

impl ConnectionFinder {
    pub(crate) fn new(
        planner: RoutePlanner,
        route_db: Arc<RouteDatabase>,
        fast_fallback: bool,
    ) -> ConnectionFinder {
        ConnectionFinder {
            planner,
            route_db,
            fast_fallback,
        }
    }

    /// Produce a connected carrier, or the accumulated failure once every
    /// route is spent. The first failure is primary; later ones ride along
    /// as suppressed causes.
    pub(crate) async fn find(&mut self) -> Result<FoundConnection> {
        if self.fast_fallback {
            self.find_fast_fallback().await
        } else {
            self.find_sequential().await
        }
    }

    async fn find_sequential(&mut self) -> Result<FoundConnection> {
        let mut failure: Option<Error> = None;
        loop {
            let plan = match self.planner.plan().await {
                Ok(plan) => plan,
                Err(e) => return Err(conclude(failure, e)),
            };
            let plan = match plan {
                Plan::Pooled(connection) => {
                    return Ok(FoundConnection {
                        connection,
                        from_pool: true,
                    })
                }
                Plan::Connect(plan) => plan,
            };

            let route = plan.route().clone();
            let io = match plan.connect_tcp().await {
                Ok(io) => io,
                Err(e) => {
                    self.route_db.failed(&route);
                    if !e.kind_is_retryable_route_failure() {
                        return Err(conclude(failure, e));
                    }
                    accumulate(&mut failure, e);
                    continue;
                }
            };

            match plan.connect_tls_etc(io).await {
                Ok(connection) => {
                    self.route_db.connected(&route);
                    return Ok(FoundConnection {
                        connection,
                        from_pool: false,
                    });
                }
                Err((next_plan, e)) => {
                    self.route_db.failed(&route);
                    if !e.kind_is_retryable_route_failure() && next_plan.is_none() {
                        return Err(conclude(failure, e));
                    }
                    if let Some(next_plan) = next_plan {
                        self.planner.push_deferred(next_plan);
                    }
                    accumulate(&mut failure, e);
                }
            }
        }
    }

    async fn find_fast_fallback(&mut self) -> Result<FoundConnection> {
        let mut failure: Option<Error> = None;
        let mut in_flight: FuturesUnordered<JoinHandle<(ConnectPlan, Result<BoxedIo>)>> =
            FuturesUnordered::new();
        // Aborting a task drops its socket; the guard also fires if this
        // future itself is dropped (call canceled or timed out).
        let mut aborts = AbortGuard::default();
        // The first launch happens immediately; each one pushes the next
        // out by the fallback delay.
        let mut next_launch = Instant::now();

        loop {
            let now = Instant::now();
            if (now >= next_launch || in_flight.is_empty()) && self.planner.has_next() {
                match self.planner.plan().await {
                    Ok(Plan::Pooled(connection)) => {
                        aborts.abort_all();
                        return Ok(FoundConnection {
                            connection,
                            from_pool: true,
                        });
                    }
                    Ok(Plan::Connect(plan)) => {
                        trace!("launching connect attempt: {:?}", plan.route());
                        let handle = tokio::spawn(drive_tcp(plan));
                        aborts.handles.push(handle.abort_handle());
                        in_flight.push(handle);
                        next_launch = Instant::now() + FAST_FALLBACK_DELAY;
                        continue;
                    }
                    Err(e) => {
                        if in_flight.is_empty() {
                            return Err(conclude(failure, e));
                        }
                        accumulate(&mut failure, e);
                    }
                }
            }

            if in_flight.is_empty() {
                // Nothing launched, nothing launchable.
                let exhausted = Error::connect("exhausted all routes");
                return Err(conclude(failure, exhausted));
            }

            let completed = tokio::select! {
                result = in_flight.next() => result,
                _ = tokio::time::sleep_until(next_launch), if self.planner.has_next() => continue,
            };

            let (plan, tcp) = match completed {
                // A loser we aborted; its socket is already closed.
                Some(Err(join_error)) if join_error.is_cancelled() => continue,
                Some(Err(join_error)) => return Err(Error::request(join_error)),
                Some(Ok(result)) => result,
                None => continue,
            };

            match tcp {
                Ok(io) => {
                    // First TCP winner: every other in-flight attempt is
                    // canceled, closing its socket.
                    aborts.abort_all();
                    in_flight = FuturesUnordered::new();

                    let route = plan.route().clone();
                    match plan.connect_tls_etc(io).await {
                        Ok(connection) => {
                            self.route_db.connected(&route);
                            return Ok(FoundConnection {
                                connection,
                                from_pool: false,
                            });
                        }
                        Err((next_plan, e)) => {
                            debug!("winner failed after tcp: {e}");
                            self.route_db.failed(&route);
                            if !e.kind_is_retryable_route_failure() && next_plan.is_none() {
                                return Err(conclude(failure, e));
                            }
                            if let Some(next_plan) = next_plan {
                                self.planner.push_deferred(next_plan);
                            }
                            accumulate(&mut failure, e);
                            next_launch = Instant::now();
                        }
                    }
                }
                Err(e) => {
                    self.route_db.failed(plan.route());
                    if !e.kind_is_retryable_route_failure() {
                        aborts.abort_all();
                        return Err(conclude(failure, e));
                    }
                    accumulate(&mut failure, e);
                }
            }
        }
    }
}

async fn drive_tcp(plan: ConnectPlan) -> (ConnectPlan, Result<BoxedIo>) {
    let result = plan.connect_tcp().await;
    (plan, result)
}

#[derive(Default)]
struct AbortGuard {
    handles: Vec<AbortHandle>,
}

impl AbortGuard {
    fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn accumulate(failure: &mut Option<Error>, error: Error) {
    match failure {
        None => *failure = Some(error),
        Some(primary) => primary.push_suppressed(error),
    }
}

fn conclude(failure: Option<Error>, last: Error) -> Error {
    match failure {
        Some(mut primary) => {
            primary.push_suppressed(last);
            primary
        }
        None => last,
    }
}

impl std::fmt::Debug for ConnectionFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFinder")
            .field("fast_fallback", &self.fast_fallback)
            .finish()
    }
}
