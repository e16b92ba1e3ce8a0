use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::Mutex;
use tracing::{error, trace, warn, Level};
use vmsched_core::SchedulerError;

use crate::scheduler::clock::nanos;
use crate::scheduler::executor::ExecutorImpl;
use crate::scheduler::interrupt::InterruptFlag;
use crate::scheduler::types::SchedulerState;

use super::core::{Inner, ThreadPool};

/// Log target for timeout reports, so they can be filtered separately.
pub const TIMEOUT_TARGET: &str = "vmsched::timeout";

/// One slot's worker thread. Pulls executors off the queue and runs them.
pub(crate) struct WorkerThread {
    pub(super) index: usize,
    /// Cleared when this worker exits, or when the monitor abandons it.
    running: AtomicBool,
    current: Mutex<Option<Arc<ExecutorImpl>>>,
    /// Set by the thread itself once it starts.
    interrupt: OnceLock<Arc<InterruptFlag>>,
}

impl WorkerThread {
    fn new(index: usize) -> Self {
        Self {
            index,
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            interrupt: OnceLock::new(),
        }
    }

    /// The executor this worker is running, if any.
    pub(super) fn current(&self) -> Option<Arc<ExecutorImpl>> {
        self.current.lock().clone()
    }

    pub(super) fn thread(&self) -> Option<&thread::Thread> {
        self.interrupt.get().map(|flag| flag.thread())
    }

    /// Whether this worker is still running `executor`, rather than having
    /// finished it since the caller looked.
    pub(super) fn is_running(&self, executor: &Arc<ExecutorImpl>) -> bool {
        holds(&self.current.lock(), executor)
    }

    /// Interrupt the underlying thread, waking it from any interruptible
    /// sleep. Does nothing once the thread has moved on from `executor`, so
    /// the interrupt never lands on the next computer.
    pub(super) fn interrupt(&self, executor: &Arc<ExecutorImpl>) -> bool {
        // Held while raising: the worker takes `current` before clearing the
        // flag for its next executor.
        let current = self.current.lock();
        if !holds(&current, executor) {
            return false;
        }
        if let Some(flag) = self.interrupt.get() {
            flag.interrupt();
        }
        true
    }

    /// Give up on this worker's thread while it is still stuck in
    /// `executor`. The caller then owns finishing the executor. Returns
    /// `false` if the thread finished the executor first, or was already
    /// retired.
    pub(super) fn abandon(&self, executor: &Arc<ExecutorImpl>) -> bool {
        let mut current = self.current.lock();
        if !holds(&current, executor) {
            return false;
        }
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        *current = None;
        true
    }

    fn run(&self, inner: &Inner, flag: &InterruptFlag) {
        while self.running.load(Ordering::Acquire) {
            // Wait for an executor to run.
            let executor = {
                let mut computer = inner.computer.lock();
                inner.idle_workers.fetch_add(1, Ordering::AcqRel);
                let next = loop {
                    if let Some(executor) = computer.queue.pop_first() {
                        break Some(executor);
                    }
                    if inner.state() >= SchedulerState::Stopping {
                        break None;
                    }
                    inner.worker_wakeup.wait(&mut computer);
                };
                inner.idle_workers.fetch_sub(1, Ordering::AcqRel);
                match next {
                    Some(executor) => executor,
                    None => return,
                }
            };

            let computer_id = executor.worker.computer_id();
            if !executor.claim() {
                error!(
                    computer = computer_id,
                    worker = self.index,
                    "Computer is already running on another thread. This is a serious scheduler bug"
                );
                debug_assert!(false, "computer #{computer_id} claimed by two workers");
            }

            // While stopping, the only thing this computer should do is shut down.
            if inner.state() >= SchedulerState::Stopping {
                executor.unload_once();
            }

            flag.clear();
            executor.before_work(inner.clock.nano_time(), inner.scaled_period(), inner.sampler.as_deref());

            // Published after the timers are reset, so the monitor never sees
            // stale deadlines.
            *self.current.lock() = Some(Arc::clone(&executor));

            match panic::catch_unwind(AssertUnwindSafe(|| executor.worker.work())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(computer = computer_id, "Error running task: {e}");
                    // There's no guarantee the computer is well-behaved from now on.
                    executor.worker.abort_with_error();
                }
                Err(payload) => {
                    error!(computer = computer_id, "Task panicked: {}", panic_message(&*payload));
                    executor.worker.abort_with_error();
                }
            }

            // The monitor takes the executor itself if it abandoned this thread.
            let finished = self.current.lock().take();
            if let Some(executor) = finished {
                inner.after_work(executor);
            }
        }
    }

    /// Log a diagnostic for a computer which will not stop. At most one
    /// report per worker slot per debounce interval, however often the slot's
    /// thread is replaced.
    pub(super) fn report_timeout(&self, inner: &Inner, executor: &ExecutorImpl, remaining: i64) {
        if !tracing::enabled!(target: TIMEOUT_TARGET, Level::WARN) {
            return;
        }

        let Some(last_report) = inner.last_reports.get(self.index) else { return };
        let now = inner.clock.nano_time();
        let then = last_report.load(Ordering::Acquire);
        let debounce = nanos(inner.config.report_debounce());
        if then != i64::MIN && now.wrapping_sub(then).wrapping_sub(debounce) <= 0 {
            return;
        }
        if last_report
            .compare_exchange(then, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let computer_id = executor.worker.computer_id();
        let mut report = format!(
            "Terminating computer #{computer_id} due to timeout (ran over by {:.3} seconds). \
             This is NOT a bug, but may mean a computer is misbehaving.\n",
            remaining as f64 * -1e-9
        );
        match self.thread() {
            Some(thread) => report.push_str(&format!(
                "Thread {} ({:?}) has been running this task for {:.3} seconds\n",
                thread.name().unwrap_or("<unnamed>"),
                thread.id(),
                executor.timeout.execution_nanos() as f64 * 1e-9
            )),
            None => report.push_str("Thread has not started\n"),
        }
        executor.worker.write_state(&mut report);

        warn!(target: TIMEOUT_TARGET, computer = computer_id, worker = self.index, "{report}");
    }
}

/// Calls [`Inner::worker_finished`] however the run loop exits.
struct FinishGuard<'a> {
    inner: &'a Arc<Inner>,
    worker: &'a Arc<WorkerThread>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.inner.worker_finished(self.worker);
    }
}

impl Inner {
    /// Spawn a worker thread into slot `index`. Called with the thread lock
    /// held.
    pub(super) fn add_worker(self: &Arc<Self>, threads: &mut ThreadPool, index: usize) -> Result<(), SchedulerError> {
        trace!(worker = index, "Spawning new worker");

        let worker = Arc::new(WorkerThread::new(index));
        let name = format!("Computer-Worker-{index}");
        let inner = Arc::clone(self);
        let thread_worker = Arc::clone(&worker);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let flag = InterruptFlag::install();
                let _ = thread_worker.interrupt.set(Arc::clone(&flag));
                let _guard = FinishGuard { inner: &inner, worker: &thread_worker };
                thread_worker.run(&inner, &flag);
            })
            .map_err(|source| SchedulerError::Spawn { name, source })?;

        threads.workers[index] = Some(worker);
        threads.count += 1;
        self.live_workers.store(threads.count, Ordering::Release);
        Ok(())
    }

    /// Retire a worker whose thread has exited. Returns `false` if the
    /// monitor already abandoned it.
    pub(super) fn worker_finished(self: &Arc<Self>, worker: &Arc<WorkerThread>) -> bool {
        // A worker which was abandoned and later exits normally must only be
        // retired once.
        if !worker.running.swap(false, Ordering::AcqRel) {
            return false;
        }

        trace!(worker = worker.index, "Worker finished");
        let executor = worker.current.lock().take();
        self.retire_worker(worker, executor);
        true
    }

    /// Abandon a worker whose thread is stuck in `executor`, finishing the
    /// executor here instead. Returns `false` if the thread got there first.
    pub(super) fn abandon_worker(self: &Arc<Self>, worker: &Arc<WorkerThread>, executor: &Arc<ExecutorImpl>) -> bool {
        if !worker.abandon(executor) {
            return false;
        }
        trace!(worker = worker.index, "Worker abandoned");
        self.retire_worker(worker, Some(Arc::clone(executor)));
        true
    }

    /// Finish the worker's executor, if any, and respawn the slot while there
    /// is still work to do.
    fn retire_worker(self: &Arc<Self>, worker: &Arc<WorkerThread>, executor: Option<Arc<ExecutorImpl>>) {
        if let Some(executor) = executor {
            self.after_work(executor);
        }

        let mut threads = self.threads.lock();
        threads.count -= 1;

        let is_current = matches!(&threads.workers[worker.index], Some(slot) if Arc::ptr_eq(slot, worker));
        let state = self.state();
        if !is_current {
            error!(worker = worker.index, "Worker closed, but a new worker has been spawned in its slot");
            debug_assert!(false, "worker {} finished twice", worker.index);
        } else if state == SchedulerState::Running || (state == SchedulerState::Stopping && self.has_pending_work()) {
            if let Err(e) = self.add_worker(&mut threads, worker.index) {
                error!(worker = worker.index, "Failed to respawn worker: {e}");
                threads.workers[worker.index] = None;
            }
        } else {
            threads.workers[worker.index] = None;
        }

        self.live_workers.store(threads.count, Ordering::Release);
        if threads.count == 0 {
            self.shutdown.notify_all();
        }
    }
}

fn holds(current: &Option<Arc<ExecutorImpl>>, executor: &Arc<ExecutorImpl>) -> bool {
    current.as_ref().is_some_and(|current| Arc::ptr_eq(current, executor))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}
