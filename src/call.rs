//! The application-level call handle: synchronous execution, asynchronous
//! dispatch, cancellation, and the retry loop over exchanges.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::trace;
use tokio::sync::Notify;

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, Recover};
use crate::request::Request;
use crate::response::Response;
use crate::sync::Mutex;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Successive recoveries one call will attempt before giving up.
const MAX_RECOVERIES: u32 = 20;

/// Receives the terminal outcome of an enqueued call. Exactly one of the
/// two hooks is invoked, once.
pub trait Callback: Send + Sync + 'static {
    /// The call produced a response. The body has not been consumed yet.
    fn on_response(&self, call: Call, response: Response);
    /// The call failed permanently.
    fn on_failure(&self, call: Call, error: Error);
}

/// A request scheduled for execution, at most once.
///
/// Cheap to clone; all clones address the same underlying call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

pub(crate) struct CallInner {
    id: u64,
    client: Arc<ClientInner>,
    request: Request,
    executed: AtomicBool,
    canceled: AtomicBool,
    cancel_notify: Notify,
    // At most one exchange is live per call; retries replace it.
    current_exchange: Mutex<Option<Exchange>>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientInner>, request: Request) -> Call {
        Call {
            inner: Arc::new(CallInner {
                id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
                client,
                request,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                current_exchange: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn inner_arc(&self) -> Arc<CallInner> {
        self.inner.clone()
    }

    /// The request this call was created with.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Execute the call on the current task and wait for the response.
    pub async fn execute(&self) -> Result<Response> {
        self.mark_executed()?;
        self.inner.client.events.call_start(self.inner.request.uri());
        self.inner.client.dispatcher.executed(self);
        let result = self.run_attempts().await;
        self.inner.client.dispatcher.finished_sync(self);
        result
    }

    /// Hand the call to the dispatcher; `callback` receives the outcome.
    pub fn enqueue(&self, callback: impl Callback) {
        if self.mark_executed().is_err() {
            callback.on_failure(
                self.clone(),
                Error::builder("call was already executed"),
            );
            return;
        }
        self.inner.client.events.call_start(self.inner.request.uri());
        self.inner
            .client
            .dispatcher
            .enqueue(self.clone(), Arc::new(callback));
    }

    fn mark_executed(&self) -> Result<()> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::builder("call was already executed"));
        }
        Ok(())
    }

    /// Cancel the call. Idempotent, callable from any task: a connect in
    /// progress closes its sockets; a live exchange aborts its codec; a
    /// response already delivered keeps its headers, and only the body
    /// read fails.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("canceling call {}", self.inner.id);
        self.inner.cancel_notify.notify_waiters();
        self.inner
            .client
            .events
            .canceled(self.inner.request.uri());
    }

    /// True once [`Call::cancel`] was invoked.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// True once the call was executed or enqueued.
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// The overall call timeout (`ZERO` = unbounded).
    pub fn timeout(&self) -> Duration {
        self.inner.client.call_timeout
    }

    /// The retry loop: runs exchanges until one completes, fails
    /// terminally, or the recovery budget is spent. Used by both the
    /// synchronous and the dispatched paths.
    pub(crate) async fn run_attempts(&self) -> Result<Response> {
        let call_timeout = self.inner.client.call_timeout;
        let result = if call_timeout > Duration::ZERO {
            match tokio::time::timeout(call_timeout, self.attempt_loop()).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // The deadline covers the entire call; whatever phase
                    // is in flight gets torn down.
                    self.cancel();
                    Err(Error::timeout().with_uri(self.inner.request.uri().clone()))
                }
            }
        } else {
            self.attempt_loop().await
        };

        match &result {
            Ok(_) => {}
            Err(e) => self
                .inner
                .client
                .events
                .call_failed(self.inner.request.uri(), e),
        }
        result
    }

    async fn attempt_loop(&self) -> Result<Response> {
        let mut refused_stream_retried = false;
        let mut recoveries = 0u32;

        loop {
            if self.is_canceled() {
                return Err(Error::canceled().with_uri(self.inner.request.uri().clone()));
            }

            let exchange = Exchange::new(self.inner.clone());
            *self.inner.current_exchange.lock() = Some(exchange.clone());

            match exchange.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    self.inner.current_exchange.lock().take();
                    match exchange.recoverability(&e) {
                        Recover::No => return Err(e),
                        Recover::RefusedStream => {
                            if refused_stream_retried {
                                return Err(e);
                            }
                            refused_stream_retried = true;
                            trace!("retrying refused stream on a fresh carrier");
                        }
                        Recover::OnFreshConnection => {
                            if !self.inner.client.retry_on_connection_failure
                                || recoveries >= MAX_RECOVERIES
                            {
                                return Err(e);
                            }
                            recoveries += 1;
                            trace!("recovering call {} ({recoveries})", self.inner.id);
                        }
                    }
                }
            }
        }
    }
}

impl CallInner {
    pub(crate) fn client(&self) -> &Arc<ClientInner> {
        &self.client
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the call is canceled; never resolves otherwise.
    pub(crate) async fn wait_canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("uri", self.inner.request.uri())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
