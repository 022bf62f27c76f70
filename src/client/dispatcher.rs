//! Schedules asynchronous calls: bounded in-flight totals, bounded
//! per-host concurrency, FIFO promotion as slots free up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::client::call::Call;
use crate::error::Result;
use crate::response::Response;

pub(crate) type Callback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// The shared scheduler behind `Call::enqueue`.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<DispatchState>,
    max_requests: usize,
    max_requests_per_host: usize,
}

struct DispatchState {
    running: usize,
    per_host: HashMap<String, usize>,
    ready: VecDeque<QueuedCall>,
}

struct QueuedCall {
    call: Call,
    host: String,
    callback: Callback,
}

impl Dispatcher {
    pub(crate) fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatchState {
                    running: 0,
                    per_host: HashMap::new(),
                    ready: VecDeque::new(),
                }),
                max_requests: max_requests.max(1),
                max_requests_per_host: max_requests_per_host.max(1),
            }),
        }
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Callback) {
        let host = call.request().url().host().to_string();
        {
            let mut state = self.lock();
            state.ready.push_back(QueuedCall {
                call,
                host,
                callback,
            });
        }
        self.promote_and_execute();
    }

    /// The number of calls currently executing.
    pub(crate) fn running_calls_count(&self) -> usize {
        self.lock().running
    }

    /// The number of calls awaiting a slot.
    pub(crate) fn queued_calls_count(&self) -> usize {
        self.lock().ready.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.inner.state.lock().expect("dispatcher lock")
    }

    /// Moves queued calls into the running set while capacity remains, then
    /// spawns them.
    fn promote_and_execute(&self) {
        let mut promoted = Vec::new();
        {
            let mut state = self.lock();
            let mut i = 0;
            while i < state.ready.len() {
                if state.running >= self.inner.max_requests {
                    break;
                }
                let host_count = state
                    .per_host
                    .get(&state.ready[i].host)
                    .copied()
                    .unwrap_or(0);
                if host_count >= self.inner.max_requests_per_host {
                    i += 1;
                    continue;
                }
                let queued = state.ready.remove(i).expect("indexed queue entry");
                state.running += 1;
                *state.per_host.entry(queued.host.clone()).or_insert(0) += 1;
                promoted.push(queued);
            }
        }

        for queued in promoted {
            trace!("dispatching call for {}", queued.host);
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let result = queued.call.execute_inner().await;
                dispatcher.finished(&queued.host);
                (queued.callback)(result);
            });
        }
    }

    fn finished(&self, host: &str) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            if let Some(count) = state.per_host.get_mut(host) {
                *count -= 1;
                if *count == 0 {
                    state.per_host.remove(host);
                }
            }
        }
        self.promote_and_execute();
    }

    /// Fails every queued (not yet running) call with a cancellation.
    pub(crate) fn cancel_all_queued(&self) {
        let drained: Vec<QueuedCall> = {
            let mut state = self.lock();
            state.ready.drain(..).collect()
        };
        for queued in drained {
            queued.call.cancel();
            (queued.callback)(Err(crate::error::Error::new_canceled()));
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("running", &state.running)
            .field("queued", &state.ready.len())
            .finish()
    }
}
