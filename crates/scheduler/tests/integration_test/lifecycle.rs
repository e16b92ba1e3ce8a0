use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use vmsched::{ComputerThread, ExecutorState, SchedulerError, SchedulerState};

use crate::helpers::{wait_for, Behaviour, Gate, TestComputer};

#[test]
fn test_repeated_submit_runs_once() {
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let gate = Arc::new(Gate::default());

    let blocker = TestComputer::new(0, Behaviour::Block(gate.clone()));
    let blocker_exec = blocker.attach(&scheduler);
    blocker_exec.submit().unwrap();
    wait_for("blocker to start", || blocker.runs() == 1);

    let computer = TestComputer::new(1, Behaviour::Quick);
    let executor = computer.attach(&scheduler);
    for _ in 0..5 {
        executor.submit().unwrap();
    }
    assert_eq!(executor.state(), ExecutorState::OnQueue);
    assert_eq!(scheduler.status().queued, 1);

    gate.open();
    wait_for("computer to finish", || computer.runs() == 1 && executor.state() == ExecutorState::Idle);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(computer.runs(), 1);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_submit_while_running_repeats_once() {
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let gate = Arc::new(Gate::default());
    let computer = TestComputer::new(1, Behaviour::Block(gate.clone()));
    let executor = computer.attach(&scheduler);

    executor.submit().unwrap();
    wait_for("computer to start", || computer.runs() == 1);
    assert_eq!(executor.state(), ExecutorState::Running);

    for _ in 0..3 {
        executor.submit().unwrap();
    }
    assert_eq!(executor.state(), ExecutorState::Repeat);

    gate.open();
    wait_for("computer to run again", || computer.runs() == 2 && executor.state() == ExecutorState::Idle);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(computer.runs(), 2);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_error_aborts_without_retry() {
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let computer = TestComputer::resubmitting(1, Behaviour::Fail, 10);
    let executor = computer.attach(&scheduler);

    executor.submit().unwrap();
    wait_for("error to be handled", || computer.errors.load(Ordering::SeqCst) == 1);
    wait_for("executor to go idle", || executor.state() == ExecutorState::Idle);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(computer.runs(), 1);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_panic_is_contained() {
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let panicking = TestComputer::new(1, Behaviour::Panic);
    let healthy = TestComputer::new(2, Behaviour::Quick);
    let panicking_exec = panicking.attach(&scheduler);
    let healthy_exec = healthy.attach(&scheduler);

    panicking_exec.submit().unwrap();
    wait_for("panic to be handled", || panicking.errors.load(Ordering::SeqCst) == 1);
    assert_eq!(panicking.active.load(Ordering::SeqCst), 0);

    // The worker thread survives and keeps serving.
    healthy_exec.submit().unwrap();
    wait_for("healthy computer to run", || healthy.runs() == 1);
    assert_eq!(scheduler.status().replaced_workers, 0);

    assert!(scheduler.stop(Duration::from_secs(5)));
}

#[test]
fn test_submit_after_stop_is_rejected() {
    let scheduler = ComputerThread::with_threads(2).unwrap();
    let computer = TestComputer::new(1, Behaviour::Quick);
    let executor = computer.attach(&scheduler);

    executor.submit().unwrap();
    wait_for("computer to run", || computer.runs() == 1);
    assert!(scheduler.stop(Duration::from_secs(5)));
    assert_eq!(scheduler.state(), SchedulerState::Closed);

    assert!(matches!(executor.submit(), Err(SchedulerError::NotRunning)));
    assert_eq!(executor.state(), ExecutorState::Idle);
    assert_eq!(computer.runs(), 1);
}

#[test]
fn test_stop_drains_queue() {
    let scheduler = ComputerThread::with_threads(1).unwrap();

    // Holds the only worker until stop hard aborts it, then keeps asking to
    // run again.
    let holder = TestComputer::resubmitting(0, Behaviour::HoldUntilAborted, 100);
    let holder_exec = holder.attach(&scheduler);
    holder_exec.submit().unwrap();
    wait_for("holder to start", || holder.runs() == 1);

    let queued: Vec<_> = (1..=3).map(|id| TestComputer::new(id, Behaviour::Quick)).collect();
    let executors: Vec<_> = queued.iter().map(|computer| computer.attach(&scheduler)).collect();
    for executor in &executors {
        executor.submit().unwrap();
    }
    assert_eq!(scheduler.status().queued, 3);

    assert!(scheduler.stop(Duration::from_secs(5)));

    let status = scheduler.status();
    assert_eq!(status.state, SchedulerState::Closed);
    assert_eq!(status.live_workers, 0);
    assert_eq!(status.queued, 0);

    for (computer, executor) in queued.iter().zip(&executors) {
        assert_eq!(computer.unloads.load(Ordering::SeqCst), 1, "computer {}", computer.id);
        assert_eq!(computer.runs(), 1);
        assert_eq!(executor.state(), ExecutorState::Idle);
    }

    // Requeued once to be unloaded, then never again.
    assert_eq!(holder.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(holder.runs(), 2);
    assert_eq!(holder_exec.state(), ExecutorState::Idle);
}

#[test]
fn test_stop_unloads_running_computer() {
    let scheduler = ComputerThread::with_threads(2).unwrap();
    let running = TestComputer::new(1, Behaviour::HoldUntilAborted);
    let idle = TestComputer::new(2, Behaviour::Quick);
    let running_exec = running.attach(&scheduler);
    let idle_exec = idle.attach(&scheduler);

    idle_exec.submit().unwrap();
    wait_for("idle computer to run", || idle.runs() == 1 && idle_exec.state() == ExecutorState::Idle);
    running_exec.submit().unwrap();
    wait_for("running computer to start", || running.runs() == 1);

    assert!(scheduler.stop(Duration::from_secs(5)));

    assert_eq!(running.unloads.load(Ordering::SeqCst), 1);
    assert_eq!(running.runs(), 1);
    assert_eq!(running_exec.state(), ExecutorState::Idle);
    // Not running when the scheduler stopped, so nothing to unload.
    assert_eq!(idle.unloads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_times_out_on_stuck_worker() {
    // Default timeouts are far longer than the stop deadline.
    let scheduler = ComputerThread::with_threads(1).unwrap();
    let computer = TestComputer::new(1, Behaviour::Wedge(Duration::from_millis(500)));
    let executor = computer.attach(&scheduler);

    executor.submit().unwrap();
    wait_for("computer to start", || computer.runs() == 1);

    assert!(!scheduler.stop(Duration::from_millis(50)));
    assert_eq!(scheduler.state(), SchedulerState::Stopping);
    assert!(executor.timeout_state().is_hard_aborted());

    // Once the task returns the worker exits and stop succeeds.
    assert!(scheduler.stop(Duration::from_secs(5)));
    assert_eq!(scheduler.status().live_workers, 0);
}

#[test]
fn test_at_most_one_worker_per_computer() {
    let scheduler = ComputerThread::with_threads(4).unwrap();
    let computers: Vec<_> = (0..8)
        .map(|id| TestComputer::resubmitting(id, Behaviour::Sleep(Duration::from_micros(200)), 40))
        .collect();
    let executors: Vec<_> = computers.iter().map(|computer| computer.attach(&scheduler)).collect();

    // Hammer submit from several threads while the computers also resubmit
    // themselves.
    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                for _ in 0..200 {
                    for executor in &executors {
                        executor.submit().unwrap();
                    }
                    std::thread::yield_now();
                }
            });
        }
    });

    wait_for("every computer to finish", || {
        executors.iter().all(|executor| executor.state() == ExecutorState::Idle)
    });

    for computer in &computers {
        assert!(computer.runs() > 0, "computer {} never ran", computer.id);
        assert_eq!(computer.overlaps.load(Ordering::SeqCst), 0, "computer {} ran concurrently", computer.id);
    }
    assert!(scheduler.stop(Duration::from_secs(5)));
}
