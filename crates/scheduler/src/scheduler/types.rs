use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use tracing::error;

/// The scheduling state of a single executor.
///
/// Executors are either enqueued (have more work to do) or not, and working
/// or not. The four combinations give the following transitions:
///
/// ```text
///            submit()            after_work()
///      IDLE ---------> ON_QUEUE <------------ REPEAT
///       ^                  |                    ^
///       |                  | dequeued           |
///       |                  V                    |
///       +---------------RUNNING-----------------+
///   after_work()                  submit()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ExecutorState {
    /// Not queued, not running.
    Idle = 0,
    /// On the ready queue, waiting for a worker.
    OnQueue = 1,
    /// Running, and will become idle afterwards.
    Running = 2,
    /// Running, and should run again once this task finishes.
    Repeat = 3,
}

impl ExecutorState {
    /// The state after `submit()`.
    pub fn enqueue(self) -> Self {
        match self {
            Self::Idle | Self::OnQueue => Self::OnQueue,
            Self::Running | Self::Repeat => Self::Repeat,
        }
    }

    /// The state after a worker finishes executing.
    pub fn requeue(self) -> Self {
        match self {
            Self::Idle | Self::OnQueue => {
                error!(state = ?self, "Impossible state after executing");
                debug_assert!(false, "requeue called on {self:?}");
                self
            }
            Self::Running => Self::Idle,
            Self::Repeat => Self::OnQueue,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::OnQueue,
            2 => Self::Running,
            _ => Self::Repeat,
        }
    }
}

/// Lock-free cell holding an [`ExecutorState`].
#[derive(Debug)]
pub(crate) struct AtomicExecutorState(AtomicU8);

impl AtomicExecutorState {
    pub(crate) fn new(state: ExecutorState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `f` atomically, returning the previous state.
    pub(crate) fn get_and_update(&self, f: impl Fn(ExecutorState) -> ExecutorState) -> ExecutorState {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(f(ExecutorState::from_u8(v)) as u8)
            })
            .unwrap_or_else(|v| v);
        ExecutorState::from_u8(prev)
    }

    pub(crate) fn compare_and_set(&self, current: ExecutorState, new: ExecutorState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Lifecycle of the whole scheduler. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum SchedulerState {
    Running = 0,
    Stopping = 1,
    Closed = 2,
}

impl SchedulerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Closed,
        }
    }
}
