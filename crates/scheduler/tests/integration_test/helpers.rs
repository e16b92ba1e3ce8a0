use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use vmsched::scheduler::interrupt;
use vmsched::{ComputerThread, Executor, NoopMetrics, SchedulerConfig, WorkError, Worker};

/// Route scheduler logs (including timeout reports) to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config with short timeouts so escalation happens within a test.
pub fn fast_config(threads: usize, timeout_ms: u64, abort_timeout_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        timeout_ms,
        abort_timeout_ms,
        monitor_wakeup_ms: 5,
        ..SchedulerConfig::with_threads(threads)
    }
}

/// Poll `condition` until it holds, failing the test after 5 seconds.
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Blocks until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

/// What a [`TestComputer`] does inside `work()`.
pub enum Behaviour {
    Quick,
    /// Sleep, waking early if the thread is interrupted.
    Sleep(Duration),
    /// Block until the gate opens.
    Block(Arc<Gate>),
    /// On the first run only, spin until hard aborted.
    HoldUntilAborted,
    /// Spin until soft aborted, then return normally.
    YieldOnAbort,
    /// Spin until paused, then return normally.
    YieldOnPause,
    /// Block the thread, ignoring every abort and interrupt.
    Wedge(Duration),
    Fail,
    Panic,
}

/// An instrumented computer.
pub struct TestComputer {
    pub id: i32,
    behaviour: Behaviour,
    /// Remaining self-resubmissions.
    resubmits: AtomicUsize,
    executor: OnceLock<Weak<dyn Executor>>,
    pub runs: AtomicUsize,
    pub active: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub errors: AtomicUsize,
    pub unloads: AtomicUsize,
    pub state_dumps: AtomicUsize,
    pub saw_pause: AtomicUsize,
    pub interrupted: AtomicUsize,
}

impl TestComputer {
    pub fn new(id: i32, behaviour: Behaviour) -> Arc<Self> {
        Self::resubmitting(id, behaviour, 0)
    }

    pub fn resubmitting(id: i32, behaviour: Behaviour, resubmits: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            behaviour,
            resubmits: AtomicUsize::new(resubmits),
            executor: OnceLock::new(),
            runs: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            state_dumps: AtomicUsize::new(0),
            saw_pause: AtomicUsize::new(0),
            interrupted: AtomicUsize::new(0),
        })
    }

    /// Create this computer's executor on `scheduler`.
    pub fn attach(self: &Arc<Self>, scheduler: &ComputerThread) -> Arc<dyn Executor> {
        let executor = scheduler.create_executor(self.clone(), Arc::new(NoopMetrics));
        let _ = self.executor.set(Arc::downgrade(&executor));
        executor
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor.get().and_then(Weak::upgrade)
    }

    fn spin_until(&self, limit: Duration, done: impl Fn(&dyn Executor) -> bool) {
        let Some(executor) = self.executor() else { return };
        let started = Instant::now();
        while !done(&*executor) && started.elapsed() < limit {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn behave(&self, run: usize) -> Result<(), WorkError> {
        match &self.behaviour {
            Behaviour::Quick => {}
            Behaviour::Sleep(duration) => {
                if let Err(e) = interrupt::sleep(*duration) {
                    self.interrupted.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
            Behaviour::Block(gate) => gate.wait(),
            Behaviour::HoldUntilAborted => {
                if run == 1 {
                    self.spin_until(Duration::from_secs(10), |e| e.timeout_state().is_hard_aborted());
                }
            }
            Behaviour::YieldOnAbort => {
                self.spin_until(Duration::from_secs(10), |e| e.timeout_state().is_soft_aborted());
            }
            Behaviour::YieldOnPause => {
                self.spin_until(Duration::from_secs(10), |e| e.timeout_state().is_paused());
                if self.executor().is_some_and(|e| e.timeout_state().is_paused()) {
                    self.saw_pause.fetch_add(1, Ordering::SeqCst);
                }
            }
            Behaviour::Wedge(duration) => std::thread::sleep(*duration),
            Behaviour::Fail => return Err(WorkError::Failed("computer failure".into())),
            Behaviour::Panic => panic!("computer panic"),
        }
        Ok(())
    }
}

impl Worker for TestComputer {
    fn work(&self) -> Result<(), WorkError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;

        // Decrement before any panic escapes.
        struct Leave<'a>(&'a AtomicUsize);
        impl Drop for Leave<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _leave = Leave(&self.active);

        self.behave(run)?;

        let resubmit = self
            .resubmits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if resubmit {
            if let Some(executor) = self.executor() {
                let _ = executor.submit();
            }
        }
        Ok(())
    }

    fn computer_id(&self) -> i32 {
        self.id
    }

    fn write_state(&self, output: &mut dyn std::fmt::Write) {
        self.state_dumps.fetch_add(1, Ordering::SeqCst);
        let _ = writeln!(output, "computer #{} after {} runs", self.id, self.runs());
    }

    fn abort_with_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_with_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}
