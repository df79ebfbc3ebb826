//! Observability hooks.
//!
//! Both listeners are invoked outside every engine lock. A listener must
//! not call back into the client synchronously on the thread that invoked
//! it while the originating call is still active; doing so can deadlock
//! against the dispatcher.

use std::net::IpAddr;

use http::{StatusCode, Uri};

use crate::error::Error;
use crate::route::Route;
use crate::tls::{Handshake, Protocol};

/// Call-scoped lifecycle hooks. All methods default to no-ops.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    /// A call was started via `execute` or `enqueue`.
    fn call_start(&self, uri: &Uri) {}
    /// The call finished successfully.
    fn call_end(&self, uri: &Uri) {}
    /// The call failed permanently.
    fn call_failed(&self, uri: &Uri, error: &Error) {}
    /// The call was canceled. May be reported in addition to the terminal
    /// failure hook.
    fn canceled(&self, uri: &Uri) {}

    /// DNS resolution started for `host`.
    fn dns_start(&self, host: &str) {}
    /// DNS resolution finished.
    fn dns_end(&self, host: &str, addresses: &[IpAddr]) {}

    /// A TCP connect attempt started on `route`.
    fn connect_start(&self, route: &Route) {}
    /// The attempt produced a usable transport.
    fn connect_end(&self, route: &Route, protocol: Option<Protocol>) {}
    /// The attempt failed. Sibling attempts may still be in flight.
    fn connect_failed(&self, route: &Route, error: &Error) {}

    /// The TLS handshake started.
    fn secure_connect_start(&self, host: &str) {}
    /// The TLS handshake completed.
    fn secure_connect_end(&self, host: &str, handshake: &Handshake) {}

    /// Request headers are about to be written.
    fn request_headers_start(&self, uri: &Uri) {}
    /// Request headers were written.
    fn request_headers_end(&self, uri: &Uri) {}
    /// A request body is about to be written.
    fn request_body_start(&self, uri: &Uri) {}
    /// The request body was fully written.
    fn request_body_end(&self, uri: &Uri, byte_count: u64) {}

    /// Waiting for response headers.
    fn response_headers_start(&self, uri: &Uri) {}
    /// Response headers arrived.
    fn response_headers_end(&self, uri: &Uri, status: StatusCode) {}
    /// The response body is being read.
    fn response_body_start(&self, uri: &Uri) {}
    /// The response body completed.
    fn response_body_end(&self, uri: &Uri, byte_count: u64) {}

    /// The call was attached to a pooled or fresh connection.
    fn connection_acquired(&self, uri: &Uri, connection_id: u64) {}
    /// The call released its connection.
    fn connection_released(&self, uri: &Uri, connection_id: u64) {}
}

/// Connection-scoped lifecycle hooks. All methods default to no-ops.
#[allow(unused_variables)]
pub trait ConnectionListener: Send + Sync {
    /// A connect attempt started on `route`.
    fn connect_start(&self, route: &Route) {}
    /// The attempt completed and the connection entered service.
    fn connect_end(&self, route: &Route) {}
    /// The attempt failed.
    fn connect_failed(&self, route: &Route, error: &Error) {}
    /// An exchange claimed the connection.
    fn connection_acquired(&self, connection_id: u64) {}
    /// The connection stopped accepting new exchanges. Sticky.
    fn no_new_exchanges(&self, connection_id: u64) {}
    /// An exchange released the connection.
    fn connection_released(&self, connection_id: u64) {}
    /// The connection's socket was closed.
    fn connection_closed(&self, connection_id: u64) {}
}

/// The default listener: observes nothing.
#[derive(Debug, Default)]
pub(crate) struct NoopListener;

impl EventListener for NoopListener {}

impl ConnectionListener for NoopListener {}
