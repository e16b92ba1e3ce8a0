use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vmsched::{ComputerThread, Executor, ExecutorState, SchedulerConfig};

use crate::helpers::{fast_config, init_tracing, wait_for, Behaviour, TestComputer};

/// When the soft and hard abort flags were first seen, relative to `since`.
#[derive(Default)]
struct Escalation {
    soft: Option<Duration>,
    hard: Option<Duration>,
}

fn watch(executor: &Arc<dyn Executor>, since: Instant) -> Arc<Mutex<Escalation>> {
    let seen = Arc::new(Mutex::new(Escalation::default()));
    let weak: Weak<dyn Executor> = Arc::downgrade(executor);
    let record = Arc::clone(&seen);
    executor.timeout_state().add_listener(move || {
        let Some(executor) = weak.upgrade() else { return };
        let state = executor.timeout_state();
        let mut seen = record.lock();
        if state.is_soft_aborted() && seen.soft.is_none() {
            seen.soft = Some(since.elapsed());
        }
        if state.is_hard_aborted() && seen.hard.is_none() {
            seen.hard = Some(since.elapsed());
        }
    });
    seen
}

#[test]
fn test_wedged_computer_escalates_to_replacement() {
    init_tracing();
    let scheduler = ComputerThread::new(fast_config(2, 100, 20)).unwrap();
    let wedged = TestComputer::new(1, Behaviour::Wedge(Duration::from_secs(1)));
    let wedged_exec = wedged.attach(&scheduler);

    let submitted = Instant::now();
    let seen = watch(&wedged_exec, submitted);
    wedged_exec.submit().unwrap();

    wait_for("worker to be replaced", || scheduler.status().replaced_workers == 1);
    // Abandoned one abort timeout after the hard abort.
    let replaced = submitted.elapsed();
    assert!(replaced >= Duration::from_millis(140), "replaced after {replaced:?}");
    assert!(replaced <= Duration::from_millis(500), "replaced after {replaced:?}");

    {
        let seen = seen.lock();
        let soft = seen.soft.expect("soft abort never raised");
        let hard = seen.hard.expect("hard abort never raised");
        assert!(soft >= Duration::from_millis(100), "soft abort after {soft:?}");
        assert!(hard >= Duration::from_millis(120), "hard abort after {hard:?}");
        assert!(soft <= hard);
        assert!(hard <= Duration::from_millis(400), "hard abort after {hard:?}");
    }

    assert!(wedged.timeouts.load(Ordering::SeqCst) >= 1);
    // The thread was abandoned mid-task.
    assert_eq!(wedged.active.load(Ordering::SeqCst), 1);
    assert_eq!(wedged.state_dumps.load(Ordering::SeqCst), 1);
    assert_eq!(wedged_exec.state(), ExecutorState::Idle);

    // The pool is still usable.
    let healthy = TestComputer::new(2, Behaviour::Quick);
    let healthy_exec = healthy.attach(&scheduler);
    healthy_exec.submit().unwrap();
    wait_for("healthy computer to run", || healthy.runs() == 1);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_timeout_reports_are_debounced_across_replacements() {
    init_tracing();
    let config = SchedulerConfig { report_debounce_ms: 5_000, ..fast_config(1, 50, 10) };
    let scheduler = ComputerThread::new(config).unwrap();
    let first = TestComputer::new(1, Behaviour::Wedge(Duration::from_millis(400)));
    let second = TestComputer::new(2, Behaviour::Wedge(Duration::from_millis(400)));
    let first_exec = first.attach(&scheduler);
    let second_exec = second.attach(&scheduler);

    first_exec.submit().unwrap();
    second_exec.submit().unwrap();

    // One slot, so the second computer runs on the replacement thread.
    wait_for("both workers to be replaced", || scheduler.status().replaced_workers == 2);
    assert_eq!(first.runs() + second.runs(), 2);
    let dumps = first.state_dumps.load(Ordering::SeqCst) + second.state_dumps.load(Ordering::SeqCst);
    assert_eq!(dumps, 1, "replacement thread reported again within the debounce");

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_cooperative_computer_yields_on_soft_abort() {
    let scheduler = ComputerThread::new(fast_config(1, 50, 200)).unwrap();
    let computer = TestComputer::new(1, Behaviour::YieldOnAbort);
    let executor = computer.attach(&scheduler);
    let seen = watch(&executor, Instant::now());

    executor.submit().unwrap();
    wait_for("computer to finish", || computer.runs() == 1 && executor.state() == ExecutorState::Idle);

    let seen = seen.lock();
    assert!(seen.soft.is_some());
    assert!(seen.hard.is_none(), "yielded within the grace period");
    assert_eq!(computer.timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(computer.errors.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.status().replaced_workers, 0);
    drop(seen);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_hard_abort_interrupts_sleeping_computer() {
    let scheduler = ComputerThread::new(fast_config(1, 50, 20)).unwrap();
    let computer = TestComputer::new(1, Behaviour::Sleep(Duration::from_secs(5)));
    let executor = computer.attach(&scheduler);

    let started = Instant::now();
    executor.submit().unwrap();
    wait_for("computer to be interrupted", || computer.interrupted.load(Ordering::SeqCst) == 1);
    assert!(started.elapsed() < Duration::from_secs(2));

    wait_for("error to be handled", || computer.errors.load(Ordering::SeqCst) == 1);
    assert!(computer.timeouts.load(Ordering::SeqCst) >= 1);
    wait_for("executor to go idle", || executor.state() == ExecutorState::Idle);
    assert_eq!(scheduler.status().replaced_workers, 0);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_long_task_is_paused_when_others_wait() {
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let long = TestComputer::new(1, Behaviour::YieldOnPause);
    let waiting = TestComputer::new(2, Behaviour::Quick);
    let long_exec = long.attach(&scheduler);
    let waiting_exec = waiting.attach(&scheduler);

    long_exec.submit().unwrap();
    wait_for("long task to start", || long.runs() == 1);
    assert!(!long_exec.timeout_state().is_paused(), "nothing else is waiting yet");

    waiting_exec.submit().unwrap();
    wait_for("waiting computer to run", || waiting.runs() == 1);

    assert_eq!(long.saw_pause.load(Ordering::SeqCst), 1);
    assert_eq!(long.timeouts.load(Ordering::SeqCst), 0);
    // Flags are cleared once the task returns.
    wait_for("long task to go idle", || long_exec.state() == ExecutorState::Idle);
    assert!(!long_exec.timeout_state().is_paused());

    assert!(scheduler.stop(Duration::from_secs(5)));
}
