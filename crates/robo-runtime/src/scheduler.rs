//! # Scheduler and Execution Pools
//!
//! A system owns three execution resources:
//!
//! * the **general scheduler** ([`Scheduler`]): one-shot tasks, delayed tasks, fixed-rate
//!   periodic tasks, attribute reads, and message dispatch for units with
//!   [`DeliveryPolicy::System`](crate::DeliveryPolicy::System);
//! * the **work pool**: message dispatch for units with `DeliveryPolicy::Work`;
//! * the **blocking pool**: message dispatch for units with `DeliveryPolicy::Blocking`.
//!
//! Each pool is a dedicated multi-thread Tokio runtime with a fixed number of threads.
//! Unit code is synchronous; a dispatched task simply calls into the unit on a pool
//! thread. The blocking pool runs its tasks on the runtime's blocking section, capped
//! at its configured size.
//!
//! ## Queues
//!
//! Queues are unbounded. Submission never blocks and never fails because a queue is
//! full, which means there is no backpressure: a sender that outpaces a unit grows
//! memory without limit. Callers that need bounds must apply them before sending.
//!
//! ## Termination
//!
//! Closing a pool stops it from accepting new tasks while already-queued tasks drain.
//! [`ExecutorPool::await_termination`] waits for the drain with a deadline, and
//! releasing a pool tears its runtime down in the background.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::SystemError;
use crate::reference::{DeliveryPolicy, Reference};

/// How a pool runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Tasks run on the runtime's worker threads.
    Worker,
    /// Tasks run on the runtime's blocking threads.
    Blocking,
}

/// A named, fixed-size pool backed by its own Tokio runtime.
pub struct ExecutorPool {
    name: &'static str,
    kind: PoolKind,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    tracker: TaskTracker,
}

impl ExecutorPool {
    /// Creates a pool with `threads` threads (at least one). Threads are named after
    /// the pool.
    pub fn new(name: &'static str, threads: usize, kind: PoolKind) -> Result<Self, SystemError> {
        let threads = threads.max(1);
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.thread_name(name).enable_all();
        match kind {
            PoolKind::Worker => builder.worker_threads(threads),
            PoolKind::Blocking => builder.worker_threads(1).max_blocking_threads(threads),
        };
        let runtime = builder
            .build()
            .map_err(|source| SystemError::Pool { name, source })?;
        let handle = runtime.handle().clone();
        debug!(pool = name, threads, ?kind, "Pool created");

        Ok(Self {
            name,
            kind,
            runtime: Mutex::new(Some(runtime)),
            handle,
            tracker: TaskTracker::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Queues `task`. Returns `false`, dropping the task, once the pool is closed.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!(pool = self.name, "Pool is closed, task dropped");
            return false;
        }
        match self.kind {
            PoolKind::Worker => {
                self.tracker.spawn_on(async move { task() }, &self.handle);
            }
            PoolKind::Blocking => {
                self.tracker.spawn_blocking_on(task, &self.handle);
            }
        }
        true
    }

    /// Runs an async task on the pool's workers. `None` once the pool is closed.
    pub(crate) fn spawn<F>(&self, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!(pool = self.name, "Pool is closed, task dropped");
            return None;
        }
        Some(self.tracker.spawn_on(future, &self.handle).abort_handle())
    }

    /// Stops accepting tasks. Queued and running tasks are not interrupted.
    pub fn close(&self) {
        if self.tracker.close() {
            debug!(pool = self.name, "Pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Closes the pool and blocks until every queued task has finished or `deadline`
    /// passes. Returns whether the pool drained in time.
    pub fn await_termination(&self, deadline: Instant) -> bool {
        self.close();
        if self.tracker.is_empty() {
            return true;
        }

        let (tx, rx) = mpsc::channel();
        let tracker = self.tracker.clone();
        self.handle.spawn(async move {
            tracker.wait().await;
            let _ = tx.send(());
        });

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => true,
            Err(mpsc::RecvTimeoutError::Disconnected) => self.tracker.is_empty(),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                trace!(pool = self.name, pending = self.tracker.len(), "Pool drain timed out");
                false
            }
        }
    }

    /// Tears the runtime down without waiting for its threads.
    pub(crate) fn release(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(pool = self.name, "Pool released");
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; shutdown_background never blocks.
        self.release();
    }
}

impl fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("closed", &self.tracker.is_closed())
            .field("pending", &self.tracker.len())
            .finish()
    }
}

/// Handle to a delayed or periodic task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    abort: Option<AbortHandle>,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    fn spawned(abort: Option<AbortHandle>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(abort.is_none())),
            abort,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task will not run again.
    pub fn is_finished(&self) -> bool {
        self.is_cancelled() || self.abort.as_ref().map_or(true, AbortHandle::is_finished)
    }
}

/// Blocks the current thread until `rx` resolves.
///
/// On a worker of a multi-thread runtime, which is where unit code usually runs,
/// the worker first hands its queue to another thread so the pool keeps serving
/// tasks (including the one this wait depends on). Panics if called from within a
/// current-thread runtime's `block_on`; `.await` the reply there.
pub(crate) fn wait_for_reply<T>(
    rx: oneshot::Receiver<T>,
) -> Result<T, oneshot::error::RecvError> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(rx))
        }
        _ => rx.blocking_recv(),
    }
}

/// Pending result of [`Scheduler::submit`].
pub struct TaskResult<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> TaskResult<R> {
    /// Blocks the current thread for the result. `None` if the task never ran or
    /// panicked. Safe to call from unit code running on a pool thread.
    pub fn wait(self) -> Option<R> {
        wait_for_reply(self.rx).ok()
    }
}

impl<R> Future for TaskResult<R> {
    type Output = Option<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

struct SchedulerInner {
    pool: ExecutorPool,
    periodic: Mutex<Vec<ScheduledTask>>,
}

/// The general scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(name: &'static str, threads: usize) -> Result<Self, SystemError> {
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                pool: ExecutorPool::new(name, threads, PoolKind::Worker)?,
                periodic: Mutex::new(Vec::new()),
            }),
        })
    }

    pub(crate) fn pool(&self) -> &ExecutorPool {
        &self.inner.pool
    }

    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.pool.execute(task)
    }

    pub fn submit<F, R>(&self, task: F) -> TaskResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.pool.execute(move || {
            let _ = tx.send(task());
        });
        TaskResult { rx }
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let abort = self.inner.pool.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask::spawned(abort)
    }

    /// Runs `task` every `period`, starting after `initial_delay`, until cancelled or
    /// the scheduler shuts down. Missed ticks are caught up. A panic in `task` ends
    /// the schedule.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let abort = self.inner.pool.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                task();
            }
        });
        self.track(ScheduledTask::spawned(abort))
    }

    /// Sends `message` to `reference` every `period` after `initial_delay`.
    ///
    /// With `invocations` set, the schedule ends on its own after that many sends.
    pub fn schedule_message<M>(
        &self,
        reference: &Reference<M>,
        message: M,
        initial_delay: Duration,
        period: Duration,
        invocations: Option<u64>,
    ) -> ScheduledTask
    where
        M: Clone + Send + Sync + 'static,
    {
        self.schedule_message_with(reference, message, initial_delay, period, invocations, || {})
    }

    /// Like [`schedule_message`](Self::schedule_message), calling `on_final` right after
    /// the last of `invocations` sends.
    pub fn schedule_message_with<M, F>(
        &self,
        reference: &Reference<M>,
        message: M,
        initial_delay: Duration,
        period: Duration,
        invocations: Option<u64>,
        on_final: F,
    ) -> ScheduledTask
    where
        M: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let reference = reference.clone();
        let period = period.max(Duration::from_millis(1));
        let abort = self.inner.pool.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            let mut sent = 0u64;
            loop {
                interval.tick().await;
                reference.send_message(message.clone());
                sent += 1;
                if invocations.is_some_and(|limit| sent >= limit) {
                    trace!(unit = %reference.id(), sent, "Scheduled message finished");
                    on_final();
                    break;
                }
            }
        });
        self.track(ScheduledTask::spawned(abort))
    }

    fn track(&self, task: ScheduledTask) -> ScheduledTask {
        let mut periodic = self.inner.periodic.lock();
        periodic.retain(|t| !t.is_finished());
        periodic.push(task.clone());
        task
    }

    /// Cancels periodic tasks, lets queued one-shot tasks drain and waits at most
    /// `timeout` for them. Returns whether the scheduler terminated in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown_until(Instant::now() + timeout)
    }

    pub(crate) fn shutdown_until(&self, deadline: Instant) -> bool {
        for task in self.inner.periodic.lock().drain(..) {
            task.cancel();
        }
        self.inner.pool.await_termination(deadline)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.is_closed()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool", &self.inner.pool)
            .field("periodic", &self.inner.periodic.lock().len())
            .finish()
    }
}

/// Pool sizes for a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub scheduler: usize,
    pub work: usize,
    pub blocking: usize,
}

/// The three execution resources of one system.
#[derive(Debug)]
pub(crate) struct Pools {
    pub(crate) scheduler: Scheduler,
    pub(crate) work: ExecutorPool,
    pub(crate) blocking: ExecutorPool,
}

impl Pools {
    pub(crate) fn new(sizes: PoolSizes) -> Result<Self, SystemError> {
        Ok(Self {
            scheduler: Scheduler::new("robo-scheduler", sizes.scheduler)?,
            work: ExecutorPool::new("robo-worker", sizes.work, PoolKind::Worker)?,
            blocking: ExecutorPool::new("robo-blocking", sizes.blocking, PoolKind::Blocking)?,
        })
    }

    pub(crate) fn for_delivery(&self, policy: DeliveryPolicy) -> &ExecutorPool {
        match policy {
            DeliveryPolicy::System => self.scheduler.pool(),
            DeliveryPolicy::Work => &self.work,
            DeliveryPolicy::Blocking => &self.blocking,
        }
    }

    pub(crate) fn release(&self) {
        self.scheduler.pool().release();
        self.work.release();
        self.blocking.release();
    }
}
