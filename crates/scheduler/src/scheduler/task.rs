use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use vmsched_core::SchedulerError;

use super::metrics::MetricsObserver;
use super::timeout::TimeoutState;
use super::types::ExecutorState;

/// Error type for a single [`Worker::work`] invocation.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Task interrupted")]
    Interrupted,
    #[error("Task failed: {0}")]
    Failed(String),
}

/// The computer side of the scheduler: something with work to run.
///
/// Implemented by the caller, one instance per computer. The scheduler never
/// runs [`work`](Self::work) concurrently with itself for the same worker.
pub trait Worker: Send + Sync {
    /// Perform any work the computer needs to do: turning on, shutting down,
    /// or running code. To run again straight away, call
    /// [`Executor::submit`] from within this method.
    ///
    /// Returning an error (or panicking) tears down the computer through
    /// [`abort_with_error`](Self::abort_with_error).
    fn work(&self) -> Result<(), WorkError>;

    /// The ID of this computer, used in log messages.
    fn computer_id(&self) -> i32;

    /// Write debugging information about this computer. Included in the log
    /// message when it has run for too long.
    fn write_state(&self, output: &mut dyn Write) {
        let _ = output;
    }

    /// Abort this whole computer due to a timeout.
    fn abort_with_timeout(&self);

    /// Abort this whole computer due to an internal error.
    fn abort_with_error(&self);

    /// Shut this computer down and prevent it from running again. Called when
    /// the scheduler is stopped.
    fn unload(&self);
}

/// The scheduler's record of a [`Worker`], used to schedule it and to control
/// its timeout.
pub trait Executor: Send + Sync {
    /// Mark the worker as having work. Idempotent: if the executor is
    /// already queued, or already flagged to run again, nothing happens.
    fn submit(&self) -> Result<(), SchedulerError>;

    /// The flags the running task should poll.
    fn timeout_state(&self) -> &TimeoutState;

    /// Nanoseconds this task may still run before being soft aborted.
    fn remaining_nanos(&self) -> i64;

    /// Set the time this task may run before being soft aborted, typically a
    /// previous [`remaining_nanos`](Self::remaining_nanos) when resuming a
    /// paused computer.
    fn set_remaining_nanos(&self, remaining: i64);

    /// Identity used to break virtual runtime ties.
    fn id(&self) -> u64;

    /// Current scheduling state.
    fn state(&self) -> ExecutorState;

    /// Virtual runtime in nanoseconds. Never decreases.
    fn virtual_runtime(&self) -> i64;
}

/// Executes computers on a pool of threads, timing them out as needed.
pub trait ComputerScheduler {
    fn create_executor(
        &self,
        worker: Arc<dyn Worker>,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Arc<dyn Executor>;

    /// Stop the scheduler, waiting up to `timeout` for every worker thread to
    /// finish. Returns `false` if they did not finish in time.
    fn stop(&self, timeout: Duration) -> bool;
}
