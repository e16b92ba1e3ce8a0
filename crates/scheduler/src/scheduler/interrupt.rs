//! Cooperative thread interruption for worker threads.
//!
//! Rust threads cannot be interrupted asynchronously. Instead every worker
//! thread owns an [`InterruptFlag`] which the monitor raises (and unparks the
//! thread) once a task has ignored its hard abort. Workloads observe it
//! through [`is_interrupted`], [`check`] and [`sleep`], which behave like an
//! interruptible blocking call: they return [`WorkError::Interrupted`] as soon
//! as the flag is raised.
//!
//! On threads not owned by a scheduler these functions never report an
//! interrupt.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use super::task::WorkError;

thread_local! {
    static CURRENT: RefCell<Option<Arc<InterruptFlag>>> = const { RefCell::new(None) };
}

/// The interrupt flag of one worker thread.
#[derive(Debug)]
pub(crate) struct InterruptFlag {
    raised: AtomicBool,
    thread: Thread,
}

impl InterruptFlag {
    /// Create a flag bound to the calling thread and install it as that
    /// thread's current flag.
    pub(crate) fn install() -> Arc<Self> {
        let flag = Arc::new(Self {
            raised: AtomicBool::new(false),
            thread: thread::current(),
        });
        CURRENT.with(|current| *current.borrow_mut() = Some(flag.clone()));
        flag
    }

    pub(crate) fn interrupt(&self) {
        self.raised.store(true, Ordering::Release);
        self.thread.unpark();
    }

    pub(crate) fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub(crate) fn thread(&self) -> &Thread {
        &self.thread
    }
}

/// Whether the current worker thread has been interrupted.
pub fn is_interrupted() -> bool {
    CURRENT.with(|current| current.borrow().as_ref().is_some_and(|f| f.is_raised()))
}

/// Fail with [`WorkError::Interrupted`] if the current thread was interrupted.
pub fn check() -> Result<(), WorkError> {
    if is_interrupted() {
        Err(WorkError::Interrupted)
    } else {
        Ok(())
    }
}

/// Sleep for `duration`, waking early with [`WorkError::Interrupted`] if the
/// thread is interrupted.
pub fn sleep(duration: Duration) -> Result<(), WorkError> {
    let deadline = Instant::now() + duration;
    loop {
        check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::park_timeout(deadline - now);
    }
}
