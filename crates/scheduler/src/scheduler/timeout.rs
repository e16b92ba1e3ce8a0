//! Per-task deadlines and the escalating pause/abort flags.
//!
//! A running task moves through three flags, each set at most once per
//! execution and only cleared by [`ManagedTimeoutState::reset`] or the next
//! [`ManagedTimeoutState::start_timer`]:
//!
//! - **paused**: the pause budget ran out *and* something else is waiting to
//!   run. A well-behaved task yields at its next opportunity.
//! - **soft abort**: the task has run for the full timeout. It should stop,
//!   typically by raising [`ABORT_MESSAGE`] inside the interpreter.
//! - **hard abort**: a further abort grace period has passed. The task must
//!   be torn down; the monitor will start interrupting its thread.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::clock::{after, nanos, Clock};

/// The error a workload reports when it has been soft aborted.
pub const ABORT_MESSAGE: &str = "Too long without yielding";

type Listener = Arc<dyn Fn() + Send + Sync>;

/// The flags a workload polls to decide whether it should pause or stop.
pub struct TimeoutState {
    paused: AtomicBool,
    soft_abort: AtomicBool,
    hard_abort: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
}

impl TimeoutState {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            soft_abort: AtomicBool::new(false),
            hard_abort: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Whether the task should yield so other computers can run.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether the task has run past its timeout and should stop.
    pub fn is_soft_aborted(&self) -> bool {
        self.soft_abort.load(Ordering::Acquire)
    }

    /// Whether the task has ignored its soft abort and must be torn down.
    pub fn is_hard_aborted(&self) -> bool {
        self.hard_abort.load(Ordering::Acquire)
    }

    /// Register a callback run whenever a flag becomes set. Callbacks run on
    /// whichever thread set the flag, usually the monitor, so they must be
    /// quick.
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    fn notify_listeners(&self) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }

    fn clear(&self) {
        self.paused.store(false, Ordering::Release);
        self.soft_abort.store(false, Ordering::Release);
        self.hard_abort.store(false, Ordering::Release);
    }

    /// Set `flag` if it is not already set, returning whether it changed.
    fn raise(flag: &AtomicBool) -> bool {
        !flag.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for TimeoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutState")
            .field("paused", &self.is_paused())
            .field("soft_abort", &self.is_soft_aborted())
            .field("hard_abort", &self.is_hard_aborted())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    start: i64,
    pause: i64,
    abort: i64,
}

/// A [`TimeoutState`] plus the deadline bookkeeping that drives it.
///
/// Only the owning worker thread calls [`start_timer`](Self::start_timer)
/// and [`reset`](Self::reset); only the monitor calls
/// [`refresh`](Self::refresh).
pub struct ManagedTimeoutState {
    state: TimeoutState,
    clock: Clock,
    timeout: i64,
    abort_timeout: i64,
    deadlines: Mutex<Deadlines>,
}

impl ManagedTimeoutState {
    pub fn new(clock: Clock, timeout: Duration, abort_timeout: Duration) -> Self {
        Self {
            state: TimeoutState::new(),
            clock,
            timeout: nanos(timeout),
            abort_timeout: nanos(abort_timeout),
            deadlines: Mutex::new(Deadlines::default()),
        }
    }

    /// The soft-abort budget, in nanoseconds.
    pub fn timeout_nanos(&self) -> i64 {
        self.timeout
    }

    /// The grace period between soft and hard abort, in nanoseconds.
    pub fn abort_timeout_nanos(&self) -> i64 {
        self.abort_timeout
    }

    /// Begin a new execution with every flag cleared, allowing it to run for
    /// `pause_budget` before it may be paused.
    pub fn start_timer(&self, pause_budget: Duration) {
        self.start_timer_at(self.clock.nano_time(), nanos(pause_budget));
    }

    pub(crate) fn start_timer_at(&self, now: i64, pause_budget: i64) {
        let mut deadlines = self.deadlines.lock();
        // A late flag from the previous execution must not carry over.
        self.state.clear();

        deadlines.start = now;
        deadlines.pause = now.wrapping_add(pause_budget);
        deadlines.abort = now.wrapping_add(self.timeout);
    }

    /// Recompute the flags against the current time. `should_pause` is only
    /// consulted once the pause deadline has passed.
    pub fn refresh(&self, should_pause: impl FnOnce() -> bool) {
        self.refresh_at(self.clock.nano_time(), should_pause);
    }

    pub(crate) fn refresh_at(&self, now: i64, should_pause: impl FnOnce() -> bool) -> bool {
        let mut changed = false;
        {
            let deadlines = self.deadlines.lock();
            let s = &self.state;

            if !s.is_paused() && after(now, deadlines.pause) && should_pause() {
                changed |= TimeoutState::raise(&s.paused);
            }
            if !s.is_soft_aborted() && after(now, deadlines.abort) {
                changed |= TimeoutState::raise(&s.soft_abort);
            }
            if !s.is_hard_aborted() && after(now, deadlines.abort.wrapping_add(self.abort_timeout)) {
                changed |= TimeoutState::raise(&s.hard_abort);
            }
        }

        if changed {
            self.state.notify_listeners();
        }
        changed
    }

    /// Immediately and unconditionally set both abort flags.
    pub fn hard_abort(&self) {
        let soft = TimeoutState::raise(&self.state.soft_abort);
        let hard = TimeoutState::raise(&self.state.hard_abort);
        if soft || hard {
            self.state.notify_listeners();
        }
    }

    /// Clear every flag ready for the next execution.
    pub fn reset(&self) {
        let _deadlines = self.deadlines.lock();
        self.state.clear();
    }

    /// Nanoseconds until the soft abort deadline. Negative once overrun.
    pub fn remaining_nanos(&self) -> i64 {
        self.remaining_nanos_at(self.clock.nano_time())
    }

    pub(crate) fn remaining_nanos_at(&self, now: i64) -> i64 {
        self.deadlines.lock().abort.wrapping_sub(now)
    }

    /// Move the abort deadline so the task has `remaining` nanoseconds left.
    /// Used to resume a paused task with the budget it had left.
    pub fn set_remaining_nanos(&self, remaining: i64) {
        self.set_remaining_nanos_at(self.clock.nano_time(), remaining);
    }

    pub(crate) fn set_remaining_nanos_at(&self, now: i64, remaining: i64) {
        self.deadlines.lock().abort = now.wrapping_add(remaining);
    }

    /// Nanoseconds since the timer was last started.
    pub fn execution_nanos(&self) -> i64 {
        self.clock.nano_time().wrapping_sub(self.deadlines.lock().start)
    }
}

impl Deref for ManagedTimeoutState {
    type Target = TimeoutState;

    fn deref(&self) -> &TimeoutState {
        &self.state
    }
}

impl fmt::Debug for ManagedTimeoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTimeoutState")
            .field("state", &self.state)
            .field("deadlines", &*self.deadlines.lock())
            .finish()
    }
}
