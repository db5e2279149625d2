#[path = "common/mod.rs"]
mod common;

use std::time::{Duration, Instant};

use common::{init_tracing, wait_for_lines, wait_until};
use provisr::{
    config::{FailureMode, HookConfig, ProcessSpec, RunMode},
    error::SupervisorError,
    manager::Manager,
    status::ProcessState,
};
use tempfile::tempdir;

fn hook(name: &str, command: String) -> HookConfig {
    HookConfig {
        name: name.into(),
        command,
        ..HookConfig::default()
    }
}

#[test]
fn failing_pre_start_hook_aborts_the_start() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let marker = dir.path().join("spawned");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("guarded", format!("sh -c 'touch {}'", marker.display()));
    spec.lifecycle.pre_start.push(hook("gate", "exit 1".into()));
    manager.register(spec).expect("register");

    let result = manager.start("guarded");
    assert!(matches!(result, Err(SupervisorError::HookFailed { .. })));

    let status = manager.status("guarded").expect("status");
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(!status.running);

    // The child must never have been spawned.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists());

    manager.shutdown();
}

#[test]
fn hook_environment_is_injected() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("hook-env.out");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("hooked", "sleep 1");
    spec.lifecycle.pre_start.push(hook(
        "dump-env",
        format!(
            "echo $PROVISR_PROCESS_NAME:$PROVISR_HOOK_NAME:$PROVISR_HOOK_PHASE > {}",
            out.display()
        ),
    ));
    manager.register(spec).expect("register");
    manager.start("hooked").expect("start");

    let lines = wait_for_lines(&out, 1);
    assert_eq!(lines, vec!["hooked:dump-env:pre_start".to_string()]);

    manager.shutdown();
}

#[test]
fn spec_and_hook_env_reach_the_hook() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("hook-vars.out");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("varsy", "sleep 1");
    spec.env.push("FROM_SPEC=alpha".into());
    let mut dump = hook(
        "dump-vars",
        format!("echo $FROM_SPEC:$FROM_HOOK > {}", out.display()),
    );
    dump.env.push("FROM_HOOK=beta".into());
    spec.lifecycle.pre_start.push(dump);
    manager.register(spec).expect("register");
    manager.start("varsy").expect("start");

    let lines = wait_for_lines(&out, 1);
    assert_eq!(lines, vec!["alpha:beta".to_string()]);

    manager.shutdown();
}

#[test]
fn ignored_hook_failure_continues_the_phase() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("after-ignore.out");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("tolerant", "sleep 1");
    let mut failing = hook("flaky", "exit 1".into());
    failing.failure_mode = FailureMode::Ignore;
    spec.lifecycle.pre_start.push(failing);
    spec.lifecycle
        .pre_start
        .push(hook("after", format!("echo ran > {}", out.display())));
    manager.register(spec).expect("register");

    manager.start("tolerant").expect("start despite ignored failure");
    let lines = wait_for_lines(&out, 1);
    assert_eq!(lines, vec!["ran".to_string()]);

    manager.shutdown();
}

#[test]
fn retry_hook_succeeds_on_second_attempt() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let marker = dir.path().join("first-attempt");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("retrier", "sleep 1");
    let mut flaky = hook(
        "second-time-lucky",
        format!(
            "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        ),
    );
    flaky.failure_mode = FailureMode::Retry;
    spec.lifecycle.pre_start.push(flaky);
    manager.register(spec).expect("register");

    manager.start("retrier").expect("start after hook retry");
    assert!(marker.exists());

    manager.shutdown();
}

#[test]
fn retry_hook_exhaustion_fails_the_phase() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("doomed", "sleep 1");
    let mut hopeless = hook("hopeless", "exit 1".into());
    hopeless.failure_mode = FailureMode::Retry;
    spec.lifecycle.pre_start.push(hopeless);
    manager.register(spec).expect("register");

    let result = manager.start("doomed");
    assert!(matches!(
        result,
        Err(SupervisorError::HookRetriesExhausted { .. })
    ));
    assert_eq!(
        manager.status("doomed").expect("status").state,
        ProcessState::Stopped
    );

    manager.shutdown();
}

#[test]
fn blocking_hook_timeout_fails_the_start() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("stuck", "sleep 1");
    let mut slow = hook("slow", "sleep 5".into());
    slow.timeout = Some(Duration::from_millis(200));
    spec.lifecycle.pre_start.push(slow);
    manager.register(spec).expect("register");

    let started = Instant::now();
    let result = manager.start("stuck");
    assert!(matches!(result, Err(SupervisorError::HookTimeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));

    manager.shutdown();
}

#[test]
fn post_start_hook_failure_does_not_stop_the_process() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("resilient", "sleep 5");
    spec.lifecycle.post_start.push(hook("notify", "exit 1".into()));
    manager.register(spec).expect("register");

    manager.start("resilient").expect("start despite post-start failure");
    let status = manager.status("resilient").expect("status");
    assert!(status.running);

    manager.shutdown();
}

#[test]
fn stop_hooks_run_around_the_stop() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let log = dir.path().join("hooks.log");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("observed", "sleep 5");
    spec.lifecycle
        .pre_stop
        .push(hook("before", format!("echo pre_stop >> {}", log.display())));
    spec.lifecycle
        .post_stop
        .push(hook("after", format!("echo post_stop >> {}", log.display())));
    manager.register(spec).expect("register");
    manager.start("observed").expect("start");
    manager.stop("observed", Duration::from_secs(2)).expect("stop");

    let lines = wait_for_lines(&log, 2);
    assert_eq!(
        lines,
        vec!["pre_stop".to_string(), "post_stop".to_string()]
    );

    manager.shutdown();
}

#[test]
fn async_hook_does_not_block_the_start() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("async.out");

    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("eager", "sleep 2");
    let mut background = hook(
        "background",
        format!("sleep 0.5 && echo done > {}", out.display()),
    );
    background.run_mode = RunMode::Async;
    spec.lifecycle.pre_start.push(background);
    manager.register(spec).expect("register");

    let started = Instant::now();
    manager.start("eager").expect("start");
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "async hook must not block the start"
    );

    wait_until("async hook to finish", Duration::from_secs(3), || {
        out.exists()
    });

    manager.shutdown();
}
