#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{init_tracing, wait_until};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use provisr::{config::ProcessSpec, manager::Manager, status::ProcessState};

fn sigkill(pid: u32) {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("SIGKILL");
}

#[test]
fn killed_child_is_restarted_exactly_once() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("phoenix", "sleep 60");
    spec.auto_restart = true;
    spec.restart_interval = Some(Duration::from_millis(500));
    manager.register(spec).expect("register");
    manager.start("phoenix").expect("start");

    let first_pid = manager.status("phoenix").expect("status").pid;
    assert!(first_pid > 0);
    sigkill(first_pid);

    // A new PID must appear within restart_interval plus one health tick.
    wait_until("auto-restart to happen", Duration::from_secs(4), || {
        let status = manager.status("phoenix").expect("status");
        status.running && status.pid != first_pid
    });

    let status = manager.status("phoenix").expect("status");
    assert_eq!(status.restarts, 1);

    // No runaway restarts afterwards.
    std::thread::sleep(Duration::from_millis(1200));
    let status = manager.status("phoenix").expect("status");
    assert_eq!(status.restarts, 1);
    assert!(status.running);

    manager.shutdown();
}

#[test]
fn requested_stop_suppresses_auto_restart() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("obedient", "sleep 60");
    spec.auto_restart = true;
    spec.restart_interval = Some(Duration::from_millis(200));
    manager.register(spec).expect("register");
    manager.start("obedient").expect("start");
    manager
        .stop("obedient", Duration::from_secs(2))
        .expect("stop");

    // Give the health tick time to run a few times.
    std::thread::sleep(Duration::from_millis(2500));
    let status = manager.status("obedient").expect("status");
    assert!(!status.running);
    assert_eq!(status.restarts, 0);
    assert_eq!(status.state, ProcessState::Stopped);

    manager.shutdown();
}

#[test]
fn registered_process_is_not_started_by_the_health_tick() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("patient", "sleep 60");
    spec.auto_restart = true;
    spec.restart_interval = Some(Duration::from_millis(100));
    manager.register(spec).expect("register");

    std::thread::sleep(Duration::from_millis(2500));
    let status = manager.status("patient").expect("status");
    assert!(!status.running, "a never-started process must stay stopped");
    assert_eq!(status.restarts, 0);

    manager.shutdown();
}

#[test]
fn dead_child_without_auto_restart_stays_stopped_with_exit_recorded() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(Some(Duration::from_millis(100)));
    manager
        .register(ProcessSpec::new("mortal", "sleep 60"))
        .expect("register");
    manager.start("mortal").expect("start");

    let pid = manager.status("mortal").expect("status").pid;
    sigkill(pid);

    wait_until("exit to be observed", Duration::from_secs(3), || {
        manager.status("mortal").expect("status").state == ProcessState::Stopped
    });
    let status = manager.status("mortal").expect("status");
    assert!(!status.running);
    assert_eq!(status.pid, 0);
    let exit_error = status.exit_error.expect("exit error recorded");
    assert!(
        exit_error.contains("signal"),
        "unexpected exit error: {exit_error}"
    );

    // It must stay down without auto_restart.
    std::thread::sleep(Duration::from_millis(1500));
    assert!(!manager.status("mortal").expect("status").running);

    manager.shutdown();
}

#[test]
fn restart_counter_accumulates_over_repeated_kills() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("cat", "sleep 60");
    spec.auto_restart = true;
    spec.restart_interval = Some(Duration::from_millis(200));
    manager.register(spec).expect("register");
    manager.start("cat").expect("start");

    for expected in 1..=2u64 {
        let pid = manager.status("cat").expect("status").pid;
        sigkill(pid);
        wait_until("restart", Duration::from_secs(4), || {
            let status = manager.status("cat").expect("status");
            status.running && status.restarts == expected
        });
    }

    manager.shutdown();
}
