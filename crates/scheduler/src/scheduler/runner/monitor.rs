use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};
use vmsched_core::SchedulerError;

use crate::scheduler::allocation::ThreadAllocation;
use crate::scheduler::types::SchedulerState;

use super::core::Inner;

impl Inner {
    pub(super) fn spawn_monitor(self: &Arc<Self>) -> Result<JoinHandle<()>, SchedulerError> {
        let name = "Computer-Monitor".to_string();
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.run_monitor())
            .map_err(|source| SchedulerError::Spawn { name, source })
    }

    /// Watches running computers and terminates their tasks once they pass
    /// the hard abort limit.
    fn run_monitor(self: Arc<Self>) {
        trace!("Monitor starting");

        loop {
            let state = self.state();
            let drained = state == SchedulerState::Stopping && self.live_workers.load(Ordering::Acquire) == 0;
            if state >= SchedulerState::Closed || drained {
                break;
            }

            {
                let mut computer = self.computer.lock();
                // With more work than capacity a task will need pausing soon,
                // so sleep for a single slice. Otherwise only the abort flags
                // need setting, which are far less granular.
                let wait = if self.is_busy() {
                    Duration::from_nanos(self.scaled_period().max(0) as u64)
                } else {
                    self.config.monitor_wakeup()
                };
                self.monitor_wakeup.wait_for(&mut computer, wait);
            }

            self.check_runners();
        }

        trace!(state = ?self.state(), "Monitor shutting down");
    }

    fn check_runners(self: &Arc<Self>) {
        let runners: Vec<_> = self.threads.lock().workers.iter().flatten().cloned().collect();
        let allocation_time = self.clock.nano_time();

        for runner in runners {
            let Some(executor) = runner.current() else { continue };

            // Sets the pause and soft/hard abort flags as appropriate.
            executor.timeout.refresh(|| self.has_pending_work());

            if let (Some(sampler), Some(thread)) = (self.sampler.as_deref(), runner.thread()) {
                let thread = thread.id();
                if let Some(allocated_bytes) = sampler.allocated_bytes(thread) {
                    executor.update_allocations(ThreadAllocation { thread, allocated_bytes, time: allocation_time });
                }
            }

            // remaining > 0: executing normally.
            // remaining > -abort: soft aborted, within the grace period.
            // Otherwise we are `-remaining - abort` past the hard abort.
            let remaining = executor.timeout.remaining_nanos();
            let abort = executor.timeout.abort_timeout_nanos();
            let after_hard_abort = remaining.saturating_neg().saturating_sub(abort);
            if after_hard_abort < 0 {
                continue;
            }

            // The worker may have finished this executor since the snapshot,
            // and possibly started it again elsewhere.
            if !runner.is_running(&executor) {
                continue;
            }
            executor.timeout.hard_abort();
            executor.worker.abort_with_timeout();
            if !runner.interrupt(&executor) {
                continue;
            }

            if after_hard_abort >= abort {
                // Hard aborted and interrupted, and still not dead. Give up on
                // the thread, finish off the task and spawn a new worker.
                runner.report_timeout(self, &executor, remaining);
                if self.abandon_worker(&runner, &executor) {
                    self.replaced_workers.fetch_add(1, Ordering::AcqRel);
                    debug!(
                        computer = executor.worker.computer_id(),
                        worker = runner.index,
                        "Abandoned worker thread"
                    );
                }
            }
        }
    }
}
