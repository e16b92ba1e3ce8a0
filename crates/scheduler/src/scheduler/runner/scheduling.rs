use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, trace};
use vmsched_core::SchedulerError;

use crate::scheduler::executor::ExecutorImpl;
use crate::scheduler::task::Executor;
use crate::scheduler::types::SchedulerState;

use super::core::{ComputerQueue, Inner};

impl Inner {
    /// Put an executor which has just been submitted onto the queue.
    ///
    /// The executor must already be ON_QUEUE. Its virtual runtime is first
    /// raised to the minimum so a computer which has slept cannot claim the
    /// time it was idle.
    pub(crate) fn queue(self: &Arc<Self>, executor: Arc<ExecutorImpl>) -> Result<(), SchedulerError> {
        let mut computer = self.computer.lock();
        if self.state() != SchedulerState::Running {
            return Err(SchedulerError::NotRunning);
        }

        self.ensure_running()?;
        self.update_runtimes(&mut computer, None);

        let minimum = computer.minimum_virtual_runtime;
        let floor = if executor.virtual_runtime() == 0 {
            // Slow down new computers a little bit.
            let penalty = i64::from(self.config.new_executor_penalty_periods);
            minimum.saturating_add(self.scaled_period().saturating_mul(penalty))
        } else {
            // Give a small boost to computers which have slept a little.
            let divisor = self.config.sleeper_bonus_divisor.max(1) as i64;
            minimum.saturating_sub(self.latency / divisor)
        };
        executor.raise_virtual_runtime(floor);

        let was_busy = self.is_busy();
        Self::push(&mut computer, executor);
        self.worker_wakeup.notify_one();

        // Once contended, the monitor should poll at the slice length rather
        // than its idle cadence.
        if !was_busy && self.is_busy() {
            self.monitor_wakeup.notify_one();
        }
        Ok(())
    }

    /// Finish an execution: bring runtimes up to date and requeue the
    /// executor if it was submitted while running.
    ///
    /// While stopping, every computer which ran is unloaded exactly once: a
    /// resubmitted one goes round once more and is unloaded when dequeued,
    /// anything else is unloaded here. After that it is not run again.
    pub(super) fn after_work(&self, executor: Arc<ExecutorImpl>) {
        let stopping = {
            let mut computer = self.computer.lock();
            self.update_runtimes(&mut computer, Some(&executor));

            let requeue = executor.after_work(self.sampler.as_deref());
            let stopping = self.state() != SchedulerState::Running;
            if requeue {
                if stopping && executor.is_unloaded() {
                    executor.unqueue();
                } else {
                    Self::push(&mut computer, executor);
                    self.worker_wakeup.notify_one();
                    return;
                }
            }
            stopping
        };

        // Outside the queue lock, as unloading calls into the computer.
        if stopping {
            executor.unload_once();
        }
    }

    /// Advance the virtual runtime of every running executor (and `current`,
    /// which has just stopped running), then raise the minimum virtual
    /// runtime to match.
    ///
    /// Elapsed wall time is shared evenly between the running task and
    /// everything waiting on the queue.
    pub(super) fn update_runtimes(&self, computer: &mut ComputerQueue, current: Option<&ExecutorImpl>) {
        let mut min_runtime = computer.queue.first_key().map_or(i64::MAX, |key| key.virtual_runtime);

        let now = self.clock.nano_time();
        let tasks = 1 + computer.queue.len() as i64;
        for executor in self.running_executors() {
            min_runtime = min_runtime.min(executor.advance_virtual_runtime(now, tasks));
        }
        if let Some(current) = current {
            min_runtime = min_runtime.min(current.advance_virtual_runtime(now, tasks));
        }

        if min_runtime > computer.minimum_virtual_runtime && min_runtime < i64::MAX {
            computer.minimum_virtual_runtime = min_runtime;
        }
    }

    /// The slice given to one call of `work()`: the latency shared between
    /// the running task and everything queued, but never below the minimum
    /// period.
    pub(super) fn scaled_period(&self) -> i64 {
        let count = 1 + self.queued.load(Ordering::Acquire) as i64;
        (self.latency / count).max(self.min_period)
    }

    pub(super) fn has_pending_work(&self) -> bool {
        self.queued.load(Ordering::Acquire) > 0
    }

    /// Whether more computers are waiting than there are idle workers.
    pub(super) fn is_busy(&self) -> bool {
        self.queued.load(Ordering::Acquire) > self.idle_workers.load(Ordering::Acquire)
    }

    /// Start the monitor and another worker if needed. Called with the
    /// computer lock held.
    fn ensure_running(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let idle = self.idle_workers.load(Ordering::Acquire);
        let mut threads = self.threads.lock();

        let monitor_alive = threads.monitor.as_ref().is_some_and(|monitor| !monitor.is_finished());
        let pool_full = threads.count == threads.workers.len();
        if monitor_alive && (idle > 0 || pool_full) {
            return Ok(());
        }

        trace!("Possibly spawning a worker or monitor");
        if !monitor_alive {
            threads.monitor = Some(self.spawn_monitor()?);
        }

        if idle == 0 && !pool_full {
            if let Some(index) = threads.workers.iter().position(Option::is_none) {
                if let Err(e) = self.add_worker(&mut threads, index) {
                    // Existing workers will still get to the queue eventually.
                    if threads.count == 0 {
                        return Err(e);
                    }
                    error!(worker = index, "Failed to spawn worker: {e}");
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the executors currently assigned to worker slots.
    fn running_executors(&self) -> Vec<Arc<ExecutorImpl>> {
        let threads = self.threads.lock();
        threads.workers.iter().flatten().filter_map(|worker| worker.current()).collect()
    }

    fn push(computer: &mut ComputerQueue, executor: Arc<ExecutorImpl>) {
        let key = executor.key();
        if !computer.queue.push(key, executor) {
            error!(executor = key.id, "Executor is already on the queue");
            debug_assert!(false, "executor {} queued twice", key.id);
        }
    }
}
