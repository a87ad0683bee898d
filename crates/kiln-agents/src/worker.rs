//! Cooperative worker framework.
//!
//! Every long-running worker is one tokio task driven by this loop:
//!
//! - [`WorkerHandle::trigger`] is safe from any task and enqueues exactly
//!   one wakeup; triggers landing while an iteration runs coalesce into one
//!   pending wakeup.
//! - Each iteration runs [`Worker::work`] to completion, then the task
//!   blocks until the next wakeup. A worker schedules its own future wakeup
//!   with [`WorkerCtx::reschedule`], a one-shot timer that survives
//!   intervening triggered iterations.
//! - [`WorkerHandle::cancel`] surfaces as the in-flight `work` future being
//!   dropped at its next suspension point; [`Worker::cleanup`] then runs and
//!   the task exits.
//! - [`WorkerHandle::try_pause`] / [`WorkerHandle::resume`] let tests hold
//!   the iteration lock and so observe the worker between iterations;
//!   [`WorkerHandle::query`] runs a closure against the worker state on the
//!   worker's own task.
//!
//! A `work` error is logged and the worker waits for its next wakeup; a
//! worker never dies from a single bad iteration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One worker's iteration body and cleanup hook.
#[async_trait]
pub trait Worker: Send + 'static {
    type Payload: Send + 'static;

    /// Name used in log records.
    const NAME: &'static str;

    /// Run one iteration. The future is dropped at its next suspension
    /// point when the worker is cancelled, so `self` must stay consistent
    /// across every `await`.
    async fn work(
        &mut self,
        ctx: &WorkerCtx<Self::Payload>,
        payload: Option<Self::Payload>,
    ) -> anyhow::Result<()>;

    /// Runs exactly once when the worker is cancelled.
    async fn cleanup(&mut self) {}
}

type Query<W> = Box<dyn FnOnce(&mut W) + Send>;

struct Shared<P> {
    notify: Notify,
    pending: StdMutex<VecDeque<P>>,
    /// Held while an iteration runs; `try_pause` parks the worker by
    /// acquiring it between iterations.
    iteration: Arc<Mutex<()>>,
}

impl<P> Shared<P> {
    fn pop_payload(&self) -> Option<P> {
        self.pending.lock().expect("payload queue lock").pop_front()
    }

    fn push_payload(&self, payload: P) {
        self.pending
            .lock()
            .expect("payload queue lock")
            .push_back(payload);
    }

    fn has_payload(&self) -> bool {
        !self.pending.lock().expect("payload queue lock").is_empty()
    }
}

/// Handed to every iteration; schedules future wakeups of the same worker.
pub struct WorkerCtx<P> {
    shared: Arc<Shared<P>>,
    cancel: CancellationToken,
}

impl<P: Send + 'static> WorkerCtx<P> {
    /// Wake the worker after `delay`, optionally with a payload. One-shot;
    /// cancelled with the worker.
    pub fn reschedule(&self, delay: Duration, payload: Option<P>) {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(payload) = payload {
                        shared.push_payload(payload);
                    }
                    shared.notify.notify_one();
                }
            }
        });
    }
}

/// Shared control surface of a spawned worker.
pub struct WorkerHandle<W: Worker> {
    shared: Arc<Shared<W::Payload>>,
    queries: mpsc::UnboundedSender<Query<W>>,
    cancel: CancellationToken,
    pause_guard: Arc<StdMutex<Option<OwnedMutexGuard<()>>>>,
}

impl<W: Worker> Clone for WorkerHandle<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            queries: self.queries.clone(),
            cancel: self.cancel.clone(),
            pause_guard: Arc::clone(&self.pause_guard),
        }
    }
}

impl<W: Worker> WorkerHandle<W> {
    /// Enqueue one wakeup, optionally carrying a payload. Multiple triggers
    /// while the worker is busy coalesce into one pending wakeup; payloads
    /// are queued individually and consumed one per iteration.
    pub fn trigger(&self, payload: Option<W::Payload>) {
        if let Some(payload) = payload {
            self.shared.push_payload(payload);
        }
        self.shared.notify.notify_one();
    }

    /// Cancel the worker: the in-flight iteration is dropped at its next
    /// suspension point, `cleanup` runs, the task exits. Also releases a
    /// test pause so the loop can observe the cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.resume();
    }

    /// Block until the worker is between iterations, or give up after
    /// `timeout`. The worker stays parked until [`resume`](Self::resume).
    pub async fn try_pause(&self, timeout: Duration) -> bool {
        let lock = Arc::clone(&self.shared.iteration);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                *self.pause_guard.lock().expect("pause guard lock") = Some(guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Release a pause taken with [`try_pause`](Self::try_pause).
    pub fn resume(&self) {
        self.pause_guard.lock().expect("pause guard lock").take();
    }

    /// Run `f` against the worker state on the worker's own task, between
    /// iterations. Returns `None` when the worker has exited.
    pub async fn query<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut W) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: Query<W> = Box::new(move |worker| {
            let _ = tx.send(f(worker));
        });
        if self.queries.send(boxed).is_err() {
            return None;
        }
        rx.await.ok()
    }
}

/// Wiring point for the latency-only nudge between workers. Targets are
/// connected after all workers are spawned; an unconnected nudge is logged
/// and dropped, never an error.
#[derive(Clone, Default)]
pub struct Nudge {
    target: Arc<StdMutex<Option<Box<dyn Fn() + Send + Sync>>>>,
}

impl Nudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, target: impl Fn() + Send + Sync + 'static) {
        *self.target.lock().expect("nudge lock") = Some(Box::new(target));
    }

    pub fn send(&self) {
        match &*self.target.lock().expect("nudge lock") {
            Some(target) => target(),
            None => debug!("nudge target not connected"),
        }
    }
}

/// Spawn `worker` onto the current runtime. The handle controls it; the
/// join handle resolves when it has exited after a cancel.
pub fn spawn<W: Worker>(worker: W) -> (WorkerHandle<W>, JoinHandle<()>) {
    let shared = Arc::new(Shared {
        notify: Notify::new(),
        pending: StdMutex::new(VecDeque::new()),
        iteration: Arc::new(Mutex::new(())),
    });
    let (query_tx, query_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handle = WorkerHandle {
        shared: Arc::clone(&shared),
        queries: query_tx,
        cancel: cancel.clone(),
        pause_guard: Arc::new(StdMutex::new(None)),
    };
    let join = tokio::spawn(run(worker, shared, query_rx, cancel));
    (handle, join)
}

async fn run<W: Worker>(
    mut worker: W,
    shared: Arc<Shared<W::Payload>>,
    mut queries: mpsc::UnboundedReceiver<Query<W>>,
    cancel: CancellationToken,
) {
    info!(worker = W::NAME, "worker started");
    let ctx = WorkerCtx {
        shared: Arc::clone(&shared),
        cancel: cancel.clone(),
    };

    'main: loop {
        // One iteration, under the iteration lock.
        let payload = shared.pop_payload();
        {
            let lock = Arc::clone(&shared.iteration);
            let guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'main,
                guard = lock.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'main,
                result = worker.work(&ctx, payload) => {
                    if let Err(err) = result {
                        error!(worker = W::NAME, error = %err, "iteration failed");
                    }
                }
            }
            drop(guard);
        }

        // A payload queued during the iteration starts the next one
        // immediately; a stored notify permit is left for it to consume.
        if shared.has_payload() {
            continue;
        }

        // Wait for a trigger or a scheduled wakeup, serving queries.
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'main,
                Some(query) = queries.recv() => {
                    query(&mut worker);
                }
                _ = shared.notify.notified() => continue 'main,
            }
        }
    }

    worker.cleanup().await;
    info!(worker = W::NAME, "worker stopped");
}
