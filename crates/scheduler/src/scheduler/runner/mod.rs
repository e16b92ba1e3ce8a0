//! The computer thread: worker pool, ready queue and watchdog.
//!
//! Split into focused submodules:
//! - `core`: `ComputerThread`, its builder, shared state and shutdown
//! - `scheduling`: queueing, virtual runtime bookkeeping and slice length
//! - `worker`: worker threads, their run loop and retirement
//! - `monitor`: the watchdog which pauses, aborts and replaces workers

mod core;
mod monitor;
mod scheduling;
mod worker;

pub(crate) use self::core::Inner;
pub(crate) use self::worker::panic_message;
pub use self::core::{ComputerThread, ComputerThreadBuilder, SchedulerStatus};
pub use self::worker::TIMEOUT_TARGET;
