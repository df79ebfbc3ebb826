//! Admission control for calls: a global in-flight ceiling, a per-host
//! ceiling shared by the asynchronous calls of one host, and an idle
//! callback that fires when the last running call completes.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use log::trace;

use crate::call::{Call, Callback};
use crate::error::Error;
use crate::sync::Mutex;

/// Schedules asynchronous calls and accounts for synchronous ones.
///
/// Promotion happens under the dispatcher lock; execution is submitted to
/// the runtime outside it.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    max_requests: usize,
    max_requests_per_host: usize,
    shutdown: AtomicBool,
    state: Mutex<DispatchState>,
}

struct DispatchState {
    ready_async: VecDeque<AsyncCall>,
    running_async: Vec<AsyncCall>,
    running_sync: Vec<u64>,
    per_host: HashMap<String, Arc<AtomicUsize>>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct AsyncCall {
    call: Call,
    callback: Arc<dyn Callback>,
    host: String,
    per_host: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub(crate) fn new(
        max_requests: usize,
        max_requests_per_host: usize,
        idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                max_requests,
                max_requests_per_host,
                shutdown: AtomicBool::new(false),
                state: Mutex::new(DispatchState {
                    ready_async: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                    per_host: HashMap::new(),
                    idle_callback,
                }),
            }),
        }
    }

    /// The ceiling on concurrently running async calls.
    pub fn max_requests(&self) -> usize {
        self.inner.max_requests
    }

    /// The per-host ceiling on concurrently running async calls.
    pub fn max_requests_per_host(&self) -> usize {
        self.inner.max_requests_per_host
    }

    /// Calls currently executing (async and sync).
    pub fn running_calls_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.running_async.len() + state.running_sync.len()
    }

    /// Async calls admitted but not yet running.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.state.lock().ready_async.len()
    }

    /// Refuse all future work. Queued calls fail with a rejection error;
    /// running calls complete normally.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let rejected: Vec<AsyncCall> = {
            let mut state = self.inner.state.lock();
            state.ready_async.drain(..).collect()
        };
        for async_call in rejected {
            async_call
                .callback
                .on_failure(async_call.call.clone(), Error::rejected());
        }
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Arc<dyn Callback>) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            callback.on_failure(call, Error::rejected());
            return;
        }
        let host = call.request().uri().host().unwrap_or_default().to_string();
        {
            let mut state = self.inner.state.lock();
            let per_host = state
                .per_host
                .entry(host.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            state.ready_async.push_back(AsyncCall {
                call,
                callback,
                host,
                per_host,
            });
        }
        self.promote_and_execute();
    }

    /// Move ready calls that fit both limits into the running set, then
    /// submit them to the runtime. Calls blocked only by their host limit
    /// stay queued in order.
    fn promote_and_execute(&self) {
        let executable: Vec<AsyncCall> = {
            let mut state = self.inner.state.lock();
            let mut executable = Vec::new();
            let mut index = 0;
            while index < state.ready_async.len() {
                if state.running_async.len() + executable.len() >= self.inner.max_requests {
                    break;
                }
                let candidate = &state.ready_async[index];
                if candidate.per_host.load(Ordering::SeqCst) >= self.inner.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let async_call = state.ready_async.remove(index).expect("index in range");
                async_call.per_host.fetch_add(1, Ordering::SeqCst);
                executable.push(async_call);
            }
            for async_call in &executable {
                state.running_async.push(AsyncCall {
                    call: async_call.call.clone(),
                    callback: async_call.callback.clone(),
                    host: async_call.host.clone(),
                    per_host: async_call.per_host.clone(),
                });
            }
            executable
        };

        for async_call in executable {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                self.finished_async(&async_call.call);
                async_call
                    .callback
                    .on_failure(async_call.call.clone(), Error::rejected());
                continue;
            }
            let dispatcher = self.clone();
            trace!("executing call to {}", async_call.host);
            tokio::spawn(async move {
                let result = async_call.call.run_attempts().await;
                dispatcher.finished_async(&async_call.call);
                match result {
                    Ok(response) => async_call.callback.on_response(async_call.call.clone(), response),
                    Err(error) => async_call.callback.on_failure(async_call.call.clone(), error),
                }
            });
        }
    }

    fn finished_async(&self, call: &Call) {
        {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state
                .running_async
                .iter()
                .position(|ac| ac.call.id() == call.id())
            {
                let async_call = state.running_async.swap_remove(pos);
                async_call.per_host.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.promote_and_execute();
        self.fire_idle_callback();
    }

    /// A synchronous call started executing.
    pub(crate) fn executed(&self, call: &Call) {
        self.inner.state.lock().running_sync.push(call.id());
    }

    /// A synchronous call finished.
    pub(crate) fn finished_sync(&self, call: &Call) {
        {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.running_sync.iter().position(|id| *id == call.id()) {
                state.running_sync.swap_remove(pos);
            }
        }
        self.promote_and_execute();
        self.fire_idle_callback();
    }

    /// The idle callback fires only when a completion leaves both running
    /// queues empty, after the promote pass had its chance to refill them.
    fn fire_idle_callback(&self) {
        let idle_callback = {
            let state = self.inner.state.lock();
            idle_callback_if_drained(&state)
        };
        if let Some(callback) = idle_callback {
            callback();
        }
    }
}

fn idle_callback_if_drained(state: &DispatchState) -> Option<Arc<dyn Fn() + Send + Sync>> {
    if state.running_async.is_empty() && state.running_sync.is_empty() {
        state.idle_callback.clone()
    } else {
        None
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Dispatcher")
            .field("ready", &state.ready_async.len())
            .field("running_async", &state.running_async.len())
            .field("running_sync", &state.running_sync.len())
            .finish()
    }
}
