//! One request/response pair over one carrier: finds the connection,
//! obtains the codec, carries per-phase timeouts and cancellation, and
//! settles the carrier's fate when the message ends.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use http::Method;
use log::debug;

use crate::call::CallInner;
use crate::codec::Codec;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::finder::ConnectionFinder;
use crate::http2::ErrorCode;
use crate::planner::RoutePlanner;
use crate::response::{Response, ResponseBody};
use crate::sync::Mutex;

/// Whether a failed exchange may be retried, and on what terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Recover {
    /// Terminal: surface the error.
    No,
    /// Retry on a fresh carrier if retries are enabled.
    OnFreshConnection,
    /// The peer refused the stream outright; one retry is allowed.
    RefusedStream,
}

#[derive(Clone)]
pub(crate) struct Exchange {
    inner: Arc<ExchangeInner>,
}

pub(crate) struct ExchangeInner {
    call: Arc<CallInner>,
    connection: Mutex<Option<Arc<Connection>>>,
    codec: tokio::sync::Mutex<Option<Codec>>,
    reused_connection: AtomicBool,
    request_done: AtomicBool,
    response_started: AtomicBool,
    response_done: AtomicBool,
    settled: AtomicBool,
    response_bytes: AtomicU64,
}

enum Op<T> {
    Done(Result<T>),
    Canceled,
    TimedOut,
}

/// Run one codec operation under the phase timeout, watching for
/// cancellation. On cancellation or timeout the codec is aborted, which
/// closes the HTTP/1 socket or resets the HTTP/2 stream.
macro_rules! codec_op {
    ($exchange:expr, $timeout:expr, $codec:ident => $op:expr) => {{
        let mut guard = $exchange.inner.codec.lock().await;
        let $codec = guard.as_mut().ok_or_else(Error::canceled)?;

        let outcome = {
            let fut = $op;
            tokio::pin!(fut);
            tokio::select! {
                result = run_with_timeout($timeout, &mut fut) => result,
                _ = $exchange.inner.call.wait_canceled() => Op::Canceled,
            }
        };

        match outcome {
            Op::Done(result) => result,
            Op::Canceled => {
                $codec.cancel();
                Err(Error::canceled())
            }
            Op::TimedOut => {
                $codec.cancel();
                Err(Error::timeout())
            }
        }
    }};
}

impl Exchange {
    pub(crate) fn new(call: Arc<CallInner>) -> Exchange {
        Exchange {
            inner: Arc::new(ExchangeInner {
                call,
                connection: Mutex::new(None),
                codec: tokio::sync::Mutex::new(None),
                reused_connection: AtomicBool::new(false),
                request_done: AtomicBool::new(false),
                response_started: AtomicBool::new(false),
                response_done: AtomicBool::new(false),
                settled: AtomicBool::new(false),
                response_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Drive the exchange to response headers. The body streams afterwards
    /// through [`Exchange::read_body_chunk`].
    pub(crate) async fn send(&self) -> Result<Response> {
        let client = self.inner.call.client();
        let request = self.inner.call.request().clone();
        let uri = request.uri().clone();

        let connection = match self.find_connection().await {
            Ok(connection) => connection,
            Err(e) => return Err(e.with_uri(uri)),
        };
        client
            .events
            .connection_acquired(request.uri(), connection.id());
        connection.listener().connection_acquired(connection.id());

        let codec = match connection.acquire_codec().await {
            Ok(codec) => codec,
            Err(e) => {
                self.settle_failure(&e);
                return Err(e.with_uri(uri));
            }
        };
        {
            *self.inner.codec.lock().await = Some(codec);
        }

        // Request headers.
        client.events.request_headers_start(request.uri());
        let wrote: Result<()> =
            codec_op!(self, client.write_timeout, codec => codec.write_request_headers(&request));
        if let Err(e) = wrote {
            self.settle_failure(&e);
            return Err(e.with_uri(uri));
        }
        client.events.request_headers_end(request.uri());

        // Request body. The response may legally arrive while this write
        // is still in flight; with buffered bodies the sequencing below is
        // equivalent.
        if let Some(body) = request.body().as_bytes() {
            client.events.request_body_start(request.uri());
            let len = body.len() as u64;
            let wrote: Result<()> =
                codec_op!(self, client.write_timeout, codec => codec.write_request_body(body));
            if let Err(e) = wrote {
                self.settle_failure(&e);
                return Err(e.with_uri(uri));
            }
            client.events.request_body_end(request.uri(), len);
        }
        self.inner.request_done.store(true, Ordering::SeqCst);

        // Response headers.
        client.events.response_headers_start(request.uri());
        let head: Result<crate::response::ResponseHead> =
            codec_op!(self, client.read_timeout, codec => codec.read_response_headers());
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                self.settle_failure(&e);
                return Err(e.with_uri(uri));
            }
        };
        self.inner.response_started.store(true, Ordering::SeqCst);
        client
            .events
            .response_headers_end(request.uri(), head.status);

        let handshake = connection.handshake().cloned();
        client.events.response_body_start(request.uri());
        Ok(Response::new(
            head,
            handshake,
            ResponseBody::new(self.clone()),
        ))
    }

    /// The next body chunk. The terminal `None` completes the exchange:
    /// the carrier's success count rises and it returns to the pool.
    pub(crate) async fn read_body_chunk(&self) -> Result<Option<Bytes>> {
        if self.inner.response_done.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let client = self.inner.call.client();
        let chunk: Result<Option<Bytes>> =
            codec_op!(self, client.read_timeout, codec => codec.read_response_chunk());
        match chunk {
            Ok(Some(chunk)) => {
                self.inner
                    .response_bytes
                    .fetch_add(chunk.len() as u64, Ordering::SeqCst);
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.inner.response_done.store(true, Ordering::SeqCst);
                self.settle_success().await;
                Ok(None)
            }
            Err(e) => {
                // A cancellation observed after headers were delivered
                // fails the body read without invalidating the headers.
                self.settle_failure(&e);
                Err(e)
            }
        }
    }

    /// Classify a failure for the call's retry loop.
    pub(crate) fn recoverability(&self, error: &Error) -> Recover {
        if error.is_canceled()
            || error.is_timeout()
            || error.is_protocol()
            || error.is_tls()
            || error.is_rejected()
            || error.is_builder()
        {
            return Recover::No;
        }
        if error.reset_code() == Some(ErrorCode::REFUSED_STREAM) {
            return Recover::RefusedStream;
        }
        if error.is_shutdown() {
            return Recover::OnFreshConnection;
        }
        // Plain I/O failures are only worth retrying when the carrier was
        // pooled (it may have gone stale) and the response never started.
        if self.inner.reused_connection.load(Ordering::SeqCst)
            && !self.inner.response_started.load(Ordering::SeqCst)
        {
            return Recover::OnFreshConnection;
        }
        Recover::No
    }

    async fn find_connection(&self) -> Result<Arc<Connection>> {
        let client = self.inner.call.client();
        let request = self.inner.call.request();
        let address = Arc::new(client.address_for(request)?);
        let extensive = *request.method() != Method::GET;
        // Every connection to an H2-prior-knowledge address multiplexes,
        // so a second concurrent connect would just be torn down again:
        // one attempt runs at a time and siblings re-check the pool.
        let multiplexed_only = matches!(
            address.protocols(),
            [p] if *p == crate::tls::Protocol::H2PriorKnowledge
        );

        loop {
            if let Some(connection) = client
                .pool
                .inner()
                .acquire(&address, None, false, extensive, &self.inner.call)
                .await
            {
                self.inner.reused_connection.store(true, Ordering::SeqCst);
                *self.inner.connection.lock() = Some(connection.clone());
                return Ok(connection);
            }

            let _connecting_guard = if multiplexed_only {
                match client.pool.inner().try_start_connecting(&address) {
                    Some(guard) => Some(guard),
                    None => {
                        // The periodic re-check covers a slot released
                        // between the pool miss and this wait.
                        tokio::select! {
                            _ = client.pool.inner().wait_connecting() => {}
                            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                            _ = self.inner.call.wait_canceled() => {
                                return Err(Error::canceled());
                            }
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            let planner = RoutePlanner::new(
                address.clone(),
                self.inner.call.clone(),
                client.pool.inner().clone(),
                client.route_db.clone(),
                client.connect_ctx.clone(),
                extensive,
            );
            let mut finder =
                ConnectionFinder::new(planner, client.route_db.clone(), client.fast_fallback);

            let found = {
                let find = finder.find();
                tokio::pin!(find);
                tokio::select! {
                    result = &mut find => result?,
                    _ = self.inner.call.wait_canceled() => return Err(Error::canceled()),
                }
            };

            if found.from_pool {
                self.inner.reused_connection.store(true, Ordering::SeqCst);
                *self.inner.connection.lock() = Some(found.connection.clone());
                return Ok(found.connection);
            }

            // A racing call may have pooled a coalescible multiplexed
            // carrier while this one was connecting; prefer it and discard
            // the duplicate before it enters the pool.
            if found.connection.is_multiplexed() {
                let routes = [found.connection.route().clone()];
                if let Some(pooled) = client
                    .pool
                    .inner()
                    .acquire(&address, Some(&routes), true, false, &self.inner.call)
                    .await
                {
                    debug!(
                        "discarding duplicate connection {} for pooled {}",
                        found.connection.id(),
                        pooled.id()
                    );
                    found.connection.close();
                    self.inner.reused_connection.store(true, Ordering::SeqCst);
                    *self.inner.connection.lock() = Some(pooled.clone());
                    return Ok(pooled);
                }
            }

            // Freshly connected: claim it for this call and register it.
            if !found
                .connection
                .try_claim(&address, None, false, &self.inner.call)
            {
                return Err(Error::request("fresh connection rejected its first call"));
            }
            client.pool.inner().put(found.connection.clone());
            *self.inner.connection.lock() = Some(found.connection.clone());
            return Ok(found.connection);
        }
    }

    /// The message completed cleanly: count the success, hand the
    /// transport back, and release the carrier.
    async fn settle_success(&self) {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.inner.call.client();
        let connection = self.inner.connection.lock().take();
        let Some(connection) = connection else { return };

        connection.exchange_succeeded();

        let transport = {
            let mut guard = self.inner.codec.lock().await;
            match guard.as_mut() {
                Some(Codec::Http1(codec)) => Some(codec.into_reusable_transport()),
                _ => None,
            }
        };
        if let Some(transport) = transport {
            connection.release_transport(transport).await;
        }

        client.events.response_body_end(
            self.inner.call.request().uri(),
            self.inner.response_bytes.load(Ordering::SeqCst),
        );
        self.release_connection(&connection);
        client.events.call_end(self.inner.call.request().uri());
    }

    /// The exchange failed: retire the carrier unless the failure was
    /// benign, then release it.
    fn settle_failure(&self, error: &Error) {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = self.inner.connection.lock().take();
        let Some(connection) = connection else { return };

        let benign_cancel =
            error.reset_code() == Some(ErrorCode::CANCEL) && self.inner.call.is_canceled();

        if error.reset_code() == Some(ErrorCode::REFUSED_STREAM) {
            connection.note_refused_stream();
            if self.inner.reused_connection.load(Ordering::SeqCst) {
                // A pooled carrier that refuses work is done serving; the
                // retry must land on a fresh one.
                connection.no_new_exchanges();
            }
        } else if !benign_cancel {
            connection.no_new_exchanges();
            if connection.success_count() == 0 {
                // This carrier never produced a response; its route is
                // suspect.
                connection.note_route_failure();
                self.inner
                    .call
                    .client()
                    .route_db
                    .failed(connection.route());
            }
        }

        debug!(
            "exchange failed on connection {}: {error}",
            connection.id()
        );
        self.release_connection(&connection);
    }

    fn release_connection(&self, connection: &Arc<Connection>) {
        let client = self.inner.call.client();
        connection.listener().connection_released(connection.id());
        client.events.connection_released(
            self.inner.call.request().uri(),
            connection.id(),
        );
        if connection.release(&self.inner.call) {
            let pool = client.pool.inner();
            if pool.connection_became_idle(connection) {
                connection.close();
            }
        }
    }
}

async fn run_with_timeout<T>(
    phase_timeout: Duration,
    fut: &mut (impl Future<Output = Result<T>> + Unpin),
) -> Op<T> {
    if phase_timeout > Duration::ZERO {
        match tokio::time::timeout(phase_timeout, fut).await {
            Ok(result) => Op::Done(result),
            Err(_) => Op::TimedOut,
        }
    } else {
        Op::Done(fut.await)
    }
}

impl Drop for ExchangeInner {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        // The response was abandoned before the body finished. The codec
        // aborts (closing the socket or resetting the stream) and the
        // carrier is retired.
        if let Ok(mut guard) = self.codec.try_lock() {
            if let Some(codec) = guard.as_mut() {
                codec.cancel();
            }
        }
        if let Some(connection) = self.connection.lock().take() {
            connection.no_new_exchanges();
            let released = connection.release(&self.call);
            connection.listener().connection_released(connection.id());
            if released {
                let pool = self.call.client().pool.inner().clone();
                if pool.connection_became_idle(&connection) {
                    connection.close();
                }
            }
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request_done", &self.inner.request_done.load(Ordering::SeqCst))
            .field(
                "response_done",
                &self.inner.response_done.load(Ordering::SeqCst),
            )
            .finish()
    }
}
