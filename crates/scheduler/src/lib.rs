pub mod scheduler;

pub use scheduler::{
    AggregateMetrics, AllocationSampler, ComputerScheduler, ComputerThread, ComputerThreadBuilder, Executor,
    ExecutorState, Metric, MetricsObserver, NoopMetrics, SchedulerState, SchedulerStatus, TimeoutState, WorkError,
    Worker, ABORT_MESSAGE,
};
pub use vmsched_core::{SchedulerConfig, SchedulerError};
