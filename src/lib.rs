#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # courier
//!
//! A connection-carrying HTTP/1.1 and HTTP/2 transport engine.
//!
//! `courier` is the layer of an HTTP client that produces, reuses, and
//! retires transport connections. It owns call admission, route planning,
//! racing connect attempts, the connection pool, and an in-tree HTTP/2
//! multiplexed stream engine. It deliberately does *not* own HTTP semantics:
//! redirects, cookies, caching, content decoding, URL surface syntax,
//! certificate verification, and DNS engines are collaborator concerns,
//! injected through the traits in [`dns`], [`tls`], and [`proxy`].
//!
//! ## Making a call
//!
//! ```rust,no_run
//! use courier::{Client, Request};
//!
//! # async fn run() -> Result<(), courier::Error> {
//! let client = Client::builder().build()?;
//!
//! let request = Request::get("http://example.com/")?;
//! let response = client.new_call(request).execute().await?;
//!
//! println!("status = {}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, create one [`Client`]
//! and reuse it, taking advantage of keep-alive connection pooling and
//! HTTP/2 multiplexing.
//!
//! ## Asynchronous dispatch
//!
//! [`Call::enqueue`] hands the call to the [`Dispatcher`], which bounds the
//! number of concurrently running calls globally and per host. Exactly one
//! of the callback's completion hooks is invoked per call.
//!
//! ## Connections
//!
//! Established connections live in the [`ConnectionPool`]. An HTTP/1.1
//! connection carries one exchange at a time; an HTTP/2 connection carries
//! as many as the peer's `MAX_CONCURRENT_STREAMS` allows, and can be
//! coalesced across hostnames when the peer's certificate covers them.
//! [`ConnectionPool::set_policy`] keeps a minimum number of warm
//! connections to an address.

pub use http::{header, Method, StatusCode, Uri, Version};

pub use self::address::Address;
pub use self::body::Body;
pub use self::call::{Call, Callback};
pub use self::client::{Client, ClientBuilder};
pub use self::dispatcher::Dispatcher;
pub use self::error::{Error, Result};
pub use self::events::{ConnectionListener, EventListener};
pub use self::http2::ErrorCode;
pub use self::pool::{AddressPolicy, ConnectionPool};
pub use self::proxy::{encode_basic_auth, Proxy, ProxyAuthenticator, ProxySelector};
pub use self::request::Request;
pub use self::response::{Response, ResponseBody};
pub use self::route::Route;
pub use self::tls::{
    Certificate, CertificatePinner, ConnectionSpec, Handshake, HostnameVerifier, Protocol,
    TlsSocketFactory, TlsVersion,
};

pub use self::connect::{BoxedIo, Connecting, Io, SocketFactory};

mod address;
mod body;
mod call;
mod client;
mod codec;
mod connect;
mod connection;
mod dispatcher;
pub mod dns;
mod error;
mod events;
mod exchange;
mod finder;
mod http2;
mod planner;
mod pool;
mod proxy;
mod request;
mod response;
mod route;
mod sync;
pub mod tls;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    fn assert_clone<T: Clone>() {}

    assert_send::<Client>();
    assert_sync::<Client>();
    assert_clone::<Client>();

    assert_send::<Request>();
    assert_send::<Response>();

    assert_send::<Error>();
    assert_sync::<Error>();
}
