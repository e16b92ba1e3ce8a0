use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{error, warn};
use vmsched_core::SchedulerError;

use super::allocation::{AllocationSampler, ThreadAllocation};
use super::metrics::{Metric, MetricsObserver};
use super::queue::QueueKey;
use super::runner::{panic_message, Inner};
use super::task::{Executor, Worker};
use super::timeout::{ManagedTimeoutState, TimeoutState};
use super::types::{AtomicExecutorState, ExecutorState};

/// The scheduler's record of one computer.
///
/// `state` is only changed through atomic transitions, so exactly one worker
/// thread can hold an executor in the running states at a time. The virtual
/// runtime fields are only written with the scheduler's queue lock held, or
/// by the owning worker thread before it publishes the executor as running.
pub(crate) struct ExecutorImpl {
    id: u64,
    pub(crate) worker: Arc<dyn Worker>,
    metrics: Arc<dyn MetricsObserver>,
    pub(crate) timeout: ManagedTimeoutState,
    state: AtomicExecutorState,
    /// Time used on a theoretical machine which shares work evenly amongst
    /// computers.
    virtual_runtime: AtomicI64,
    /// When `virtual_runtime` was last brought up to date.
    vruntime_start: AtomicI64,
    /// Allocation counter of the executing thread when work began, refreshed
    /// by the monitor.
    thread_allocation: Mutex<Option<ThreadAllocation>>,
    /// Set once [`Worker::unload`] has been called during shutdown.
    unloaded: AtomicBool,
    this: Weak<ExecutorImpl>,
    scheduler: Weak<Inner>,
}

impl ExecutorImpl {
    pub(crate) fn new(
        id: u64,
        worker: Arc<dyn Worker>,
        metrics: Arc<dyn MetricsObserver>,
        timeout: ManagedTimeoutState,
        scheduler: Weak<Inner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            worker,
            metrics,
            timeout,
            state: AtomicExecutorState::new(ExecutorState::Idle),
            virtual_runtime: AtomicI64::new(0),
            vruntime_start: AtomicI64::new(0),
            thread_allocation: Mutex::new(None),
            unloaded: AtomicBool::new(false),
            this: this.clone(),
            scheduler,
        })
    }

    pub(crate) fn key(&self) -> QueueKey {
        QueueKey { virtual_runtime: self.virtual_runtime(), id: self.id }
    }

    /// Move a dequeued executor to RUNNING. Fails if another thread already
    /// claimed it.
    pub(crate) fn claim(&self) -> bool {
        self.state.compare_and_set(ExecutorState::OnQueue, ExecutorState::Running)
    }

    /// Undo a submit whose enqueue failed.
    pub(crate) fn unqueue(&self) {
        self.state.compare_and_set(ExecutorState::OnQueue, ExecutorState::Idle);
    }

    /// Unload the worker unless that already happened. Returns whether this
    /// call did it.
    ///
    /// A panicking `unload` is logged and swallowed. It runs outside the
    /// worker's own panic handling, where unwinding would strand the
    /// executor.
    pub(crate) fn unload_once(&self) -> bool {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.worker.unload())) {
            error!(
                computer = self.worker.computer_id(),
                "Unloading computer panicked: {}",
                panic_message(&*payload)
            );
        }
        true
    }

    pub(crate) fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Raise the virtual runtime to at least `floor`. Never lowers it.
    pub(crate) fn raise_virtual_runtime(&self, floor: i64) {
        self.virtual_runtime.fetch_max(floor, Ordering::AcqRel);
    }

    /// Charge the time since the last update, shared between `tasks`
    /// concurrently active tasks. Returns the new virtual runtime.
    pub(crate) fn advance_virtual_runtime(&self, now: i64, tasks: i64) -> i64 {
        let start = self.vruntime_start.swap(now, Ordering::AcqRel);
        let delta = now.wrapping_sub(start).max(0) / tasks.max(1);
        self.virtual_runtime.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Called before running [`Worker::work`], setting up timers.
    pub(crate) fn before_work(&self, now: i64, pause_budget: i64, sampler: Option<&dyn AllocationSampler>) {
        self.vruntime_start.store(now, Ordering::Release);
        self.timeout.start_timer_at(now, pause_budget);

        if let Some(sampler) = sampler {
            let current = thread::current().id();
            *self.thread_allocation.lock() = sampler.allocated_bytes(current).map(|bytes| ThreadAllocation {
                thread: current,
                allocated_bytes: bytes,
                time: now,
            });
        }
    }

    /// Called after running [`Worker::work`]. Returns whether there is more
    /// work to do, in which case the executor is now ON_QUEUE and the caller
    /// must enqueue it.
    pub(crate) fn after_work(&self, sampler: Option<&dyn AllocationSampler>) -> bool {
        self.timeout.reset();
        self.metrics.observe(
            Metric::ComputerTasks,
            u64::try_from(self.timeout.execution_nanos()).unwrap_or(0),
        );

        let info = self.thread_allocation.lock().take();
        if let (Some(sampler), Some(info)) = (sampler, info) {
            // After an abandoned thread the monitor finishes the executor, and
            // its own counter says nothing about the task.
            let current = thread::current().id();
            if info.thread == current {
                if let Some(total) = sampler.allocated_bytes(current) {
                    let allocated = total as i128 - info.allocated_bytes as i128;
                    if allocated > 0 {
                        self.metrics.observe(Metric::ThreadAllocation, allocated as u64);
                    } else if allocated < 0 {
                        warn!(
                            allocated = allocated as i64,
                            previous = info.allocated_bytes,
                            previous_time = info.time,
                            current = total,
                            "Allocated a negative number of bytes"
                        );
                    }
                }
            }
        }

        let state = self.state.get_and_update(ExecutorState::requeue);
        state == ExecutorState::Repeat
    }

    /// Record a fresh allocation sample from the monitor.
    pub(crate) fn update_allocations(&self, allocation: ThreadAllocation) {
        let allocated = {
            let mut current = self.thread_allocation.lock();
            // Absent or on another thread: the worker has already finished
            // and this sample is stale.
            let Some(previous) = *current else { return };
            if previous.thread != allocation.thread || allocation.allocated_bytes <= previous.allocated_bytes {
                return;
            }
            *current = Some(allocation);
            allocation.allocated_bytes - previous.allocated_bytes
        };

        self.metrics.observe(Metric::ThreadAllocation, allocated);
    }
}

impl Executor for ExecutorImpl {
    fn submit(&self) -> Result<(), SchedulerError> {
        let state = self.state.get_and_update(ExecutorState::enqueue);
        if state != ExecutorState::Idle {
            return Ok(());
        }

        let queued = match (self.scheduler.upgrade(), self.this.upgrade()) {
            (Some(scheduler), Some(this)) => scheduler.queue(this),
            _ => Err(SchedulerError::Closed),
        };
        if queued.is_err() {
            self.unqueue();
        }
        queued
    }

    fn timeout_state(&self) -> &TimeoutState {
        &self.timeout
    }

    fn remaining_nanos(&self) -> i64 {
        self.timeout.remaining_nanos()
    }

    fn set_remaining_nanos(&self, remaining: i64) {
        self.timeout.set_remaining_nanos(remaining);
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ExecutorState {
        self.state.load()
    }

    fn virtual_runtime(&self) -> i64 {
        self.virtual_runtime.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ExecutorImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorImpl")
            .field("id", &self.id)
            .field("computer", &self.worker.computer_id())
            .field("state", &self.state.load())
            .field("virtual_runtime", &self.virtual_runtime())
            .finish()
    }
}
