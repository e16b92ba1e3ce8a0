//! Fair, preemptive scheduler for sandboxed computers.
//!
//! Every computer owns an [`Executor`], created by a [`ComputerThread`] for
//! the computer's [`Worker`]. Calling [`Executor::submit`] queues the
//! computer; a pool of worker threads runs queued computers in order of
//! virtual runtime, and a monitor thread pauses, aborts and eventually
//! replaces the threads of computers which run for too long.
//!
//! Workloads cooperate through the [`TimeoutState`] flags and the
//! [`interrupt`] helpers.

pub mod allocation;
pub mod clock;
pub(crate) mod executor;
pub mod interrupt;
pub mod metrics;
pub(crate) mod queue;
pub mod runner;
pub mod task;
pub mod timeout;
pub mod types;

pub use allocation::{AllocationSampler, ThreadAllocation};
pub use metrics::{AggregateMetrics, Metric, MetricSummary, MetricsObserver, NoopMetrics};
pub use runner::{ComputerThread, ComputerThreadBuilder, SchedulerStatus, TIMEOUT_TARGET};
pub use task::{ComputerScheduler, Executor, WorkError, Worker};
pub use timeout::{ManagedTimeoutState, TimeoutState, ABORT_MESSAGE};
pub use types::{ExecutorState, SchedulerState};
