use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info};
use vmsched_core::{SchedulerConfig, SchedulerError};

use crate::scheduler::allocation::AllocationSampler;
use crate::scheduler::clock::{nanos, Clock};
use crate::scheduler::executor::ExecutorImpl;
use crate::scheduler::metrics::MetricsObserver;
use crate::scheduler::queue::ReadyQueue;
use crate::scheduler::task::{ComputerScheduler, Executor, Worker};
use crate::scheduler::timeout::ManagedTimeoutState;
use crate::scheduler::types::SchedulerState;

use super::worker::WorkerThread;

/// Runs computers on a fixed pool of worker threads, sharing time between
/// them fairly and timing them out when they run for too long.
///
/// Each computer has an [`Executor`], which is queued whenever the computer
/// has work to do. Worker threads take the executor with the smallest
/// virtual runtime from the queue and run it. The virtual runtime
/// approximates the time a computer would have used on a machine which shared
/// work evenly between every running computer, in the style of the Linux CFS
/// scheduler.
///
/// A separate monitor thread watches running computers. It marks a computer
/// as paused once it has used its slice and other computers are waiting, soft
/// and then hard aborts it once it passes its timeout, and finally abandons
/// and replaces its worker thread if it still refuses to stop.
///
/// Worker and monitor threads are only started once work is first queued.
pub struct ComputerThread {
    pub(super) inner: Arc<Inner>,
}

/// Builds a [`ComputerThread`] with optional collaborators.
pub struct ComputerThreadBuilder {
    config: SchedulerConfig,
    sampler: Option<Arc<dyn AllocationSampler>>,
}

/// Point-in-time view of the scheduler, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Size of the worker pool.
    pub worker_threads: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    pub queued: usize,
    pub minimum_virtual_runtime: i64,
    /// Worker threads abandoned by the monitor because their task would not
    /// stop.
    pub replaced_workers: u64,
}

/// State shared between the scheduler handle, its executors and its threads.
pub(crate) struct Inner {
    pub(super) config: SchedulerConfig,
    pub(super) clock: Clock,
    state: AtomicU8,

    /// Guards the ready queue and virtual runtime bookkeeping.
    pub(super) computer: Mutex<ComputerQueue>,
    /// Signalled when new work is queued or the scheduler begins stopping.
    pub(super) worker_wakeup: Condvar,
    /// Signalled when the monitor should re-check its sleep interval.
    pub(super) monitor_wakeup: Condvar,

    /// Guards the worker slots and monitor handle. Always taken after
    /// `computer` when both are needed.
    pub(super) threads: Mutex<ThreadPool>,
    /// Signalled when the last worker thread exits.
    pub(super) shutdown: Condvar,

    /// Mirrors of counters guarded by the locks above, readable without them.
    pub(super) queued: Arc<AtomicUsize>,
    pub(super) idle_workers: AtomicUsize,
    pub(super) live_workers: AtomicUsize,
    pub(super) replaced_workers: AtomicU64,
    /// When each worker slot last logged a timeout report. Kept per slot so
    /// the debounce survives the slot's thread being replaced.
    pub(super) last_reports: Vec<AtomicI64>,

    next_id: AtomicU64,
    /// Scaled target latency, in nanoseconds.
    pub(super) latency: i64,
    /// Scaled minimum slice, in nanoseconds.
    pub(super) min_period: i64,
    pub(super) sampler: Option<Arc<dyn AllocationSampler>>,
}

pub(crate) struct ComputerQueue {
    pub(super) queue: ReadyQueue<Arc<ExecutorImpl>>,
    /// Smallest virtual runtime of all queued and running executors. Only
    /// ever increases.
    pub(super) minimum_virtual_runtime: i64,
}

pub(crate) struct ThreadPool {
    pub(super) workers: Vec<Option<Arc<WorkerThread>>>,
    /// Number of workers started and not yet finished.
    pub(super) count: usize,
    pub(super) monitor: Option<JoinHandle<()>>,
}

impl ComputerThread {
    /// Create a scheduler. No threads are started until work is queued.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::builder(config).build()
    }

    /// Create a scheduler with default tunables and `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::with_threads(threads))
    }

    pub fn builder(config: SchedulerConfig) -> ComputerThreadBuilder {
        ComputerThreadBuilder { config, sampler: None }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Create the executor for a single computer.
    pub fn create_executor(&self, worker: Arc<dyn Worker>, metrics: Arc<dyn MetricsObserver>) -> Arc<dyn Executor> {
        self.inner.create_executor(worker, metrics)
    }

    /// Stop the scheduler.
    ///
    /// Running computers are hard aborted and queued ones are drained. Each
    /// computer which is running or queued is unloaded exactly once. The
    /// call blocks until every worker thread has finished or `timeout`
    /// elapses. Returns `false` on timeout; the scheduler then stays in the
    /// stopping state.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.inner.stop(timeout)
    }

    /// Whether any computers are waiting to run.
    pub fn has_pending_work(&self) -> bool {
        self.inner.has_pending_work()
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    pub fn status(&self) -> SchedulerStatus {
        let minimum_virtual_runtime = self.inner.computer.lock().minimum_virtual_runtime;
        SchedulerStatus {
            state: self.inner.state(),
            worker_threads: self.inner.config.resolved_worker_threads(),
            live_workers: self.inner.live_workers.load(Ordering::Acquire),
            idle_workers: self.inner.idle_workers.load(Ordering::Acquire),
            queued: self.inner.queued.load(Ordering::Acquire),
            minimum_virtual_runtime,
            replaced_workers: self.inner.replaced_workers.load(Ordering::Acquire),
        }
    }
}

impl ComputerScheduler for ComputerThread {
    fn create_executor(&self, worker: Arc<dyn Worker>, metrics: Arc<dyn MetricsObserver>) -> Arc<dyn Executor> {
        ComputerThread::create_executor(self, worker, metrics)
    }

    fn stop(&self, timeout: Duration) -> bool {
        ComputerThread::stop(self, timeout)
    }
}

impl Drop for ComputerThread {
    /// Begin shutting down without waiting. Threads exit once the queue has
    /// drained.
    fn drop(&mut self) {
        if self.inner.state() == SchedulerState::Running {
            debug!("Computer thread dropped while running, stopping");
        }
        self.inner.begin_stop();
        let _computer = self.inner.computer.lock();
        self.inner.monitor_wakeup.notify_one();
    }
}

impl ComputerThreadBuilder {
    /// Sample per-thread allocation counters, reported as
    /// [`Metric::ThreadAllocation`](crate::scheduler::metrics::Metric::ThreadAllocation).
    pub fn allocation_sampler(mut self, sampler: Arc<dyn AllocationSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn build(self) -> Result<ComputerThread, SchedulerError> {
        self.config.validate()?;
        let threads = self.config.resolved_worker_threads();
        let queued = Arc::new(AtomicUsize::new(0));

        info!(
            threads,
            latency = ?self.config.latency(),
            min_period = ?self.config.min_period(),
            "Created computer thread"
        );

        let inner = Inner {
            clock: Clock::new(),
            state: AtomicU8::new(SchedulerState::Running as u8),
            computer: Mutex::new(ComputerQueue {
                queue: ReadyQueue::new(Arc::clone(&queued)),
                minimum_virtual_runtime: 0,
            }),
            worker_wakeup: Condvar::new(),
            monitor_wakeup: Condvar::new(),
            threads: Mutex::new(ThreadPool {
                workers: vec![None; threads],
                count: 0,
                monitor: None,
            }),
            shutdown: Condvar::new(),
            queued,
            idle_workers: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            replaced_workers: AtomicU64::new(0),
            last_reports: (0..threads).map(|_| AtomicI64::new(i64::MIN)).collect(),
            next_id: AtomicU64::new(1),
            latency: nanos(self.config.latency()),
            min_period: nanos(self.config.min_period()),
            sampler: self.sampler,
            config: self.config,
        };

        Ok(ComputerThread { inner: Arc::new(inner) })
    }
}

impl Inner {
    pub(super) fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the lifecycle forward to `new_state`. Never moves it backwards.
    pub(super) fn advance_state(&self, new_state: SchedulerState) {
        self.state.fetch_max(new_state as u8, Ordering::AcqRel);
    }

    pub(super) fn create_executor(
        self: &Arc<Self>,
        worker: Arc<dyn Worker>,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Arc<ExecutorImpl> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = ManagedTimeoutState::new(self.clock, self.config.timeout(), self.config.abort_timeout());
        ExecutorImpl::new(id, worker, metrics, timeout, Arc::downgrade(self))
    }

    /// Enter STOPPING, hard abort everything running and wake the workers.
    fn begin_stop(&self) {
        self.advance_state(SchedulerState::Stopping);

        // Collected first so timeout listeners never run under the thread lock.
        let running: Vec<_> = {
            let threads = self.threads.lock();
            threads
                .workers
                .iter()
                .flatten()
                .filter_map(|worker| Some((Arc::clone(worker), worker.current()?)))
                .collect()
        };
        for (worker, executor) in running {
            // Skip executors which finished since the snapshot.
            if worker.is_running(&executor) {
                executor.timeout.hard_abort();
            }
        }

        let _computer = self.computer.lock();
        self.worker_wakeup.notify_all();
    }

    fn stop(&self, timeout: Duration) -> bool {
        debug!(?timeout, "Stopping computer thread");
        self.begin_stop();

        let deadline = Instant::now().checked_add(timeout);
        {
            let mut threads = self.threads.lock();
            while threads.count > 0 {
                match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            debug!(remaining = threads.count, "Timed out waiting for worker threads");
                            return false;
                        }
                        self.shutdown.wait_until(&mut threads, deadline);
                    }
                    None => self.shutdown.wait(&mut threads),
                }
            }
        }

        self.advance_state(SchedulerState::Closed);

        // Signal the monitor to finish, but don't wait for it.
        let _computer = self.computer.lock();
        self.monitor_wakeup.notify_one();
        debug!("Computer thread stopped");
        true
    }
}
