#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{RecordingSink, init_tracing, wait_until};
use provisr::{
    config::ProcessSpec,
    error::SupervisorError,
    history::{EventKind, HistorySink},
    manager::Manager,
    status::ProcessState,
};

#[test]
fn register_n_expands_and_patterns_address_instances() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let mut spec = ProcessSpec::new("worker", "sleep 5");
    spec.instances = 3;
    manager.register_n(spec).expect("register instances");

    let statuses = manager.status_all("worker");
    let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["worker-1", "worker-2", "worker-3"]);

    for name in &names {
        manager.start(name).expect("start instance");
    }
    assert_eq!(manager.count("worker"), 3);
    assert_eq!(manager.count("worker-2"), 1);
    assert_eq!(manager.count("*"), 3);

    manager.stop_all("worker", Duration::from_secs(2));
    wait_until("all instances to stop", Duration::from_secs(3), || {
        manager.count("worker") == 0
    });

    manager.shutdown();
}

#[test]
fn status_all_pattern_variants() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    for name in ["api", "api-gateway", "db-primary", "db-replica"] {
        manager
            .register(ProcessSpec::new(name, "sleep 1"))
            .expect("register");
    }

    let names = |pattern: &str| -> Vec<String> {
        manager
            .status_all(pattern)
            .into_iter()
            .map(|s| s.name)
            .collect()
    };

    assert_eq!(names("").len(), 4);
    assert_eq!(names("db*"), vec!["db-primary", "db-replica"]);
    assert_eq!(names("*replica"), vec!["db-replica"]);
    assert_eq!(names("*gate*"), vec!["api-gateway"]);
    // Base-name expansion: "api" also covers "api-gateway".
    assert_eq!(names("api"), vec!["api", "api-gateway"]);

    manager.shutdown();
}

#[test]
fn unregister_stops_and_removes() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    manager
        .register(ProcessSpec::new("temp", "sleep 5"))
        .expect("register");
    manager.start("temp").expect("start");

    manager
        .unregister("temp", Duration::from_secs(2))
        .expect("unregister");
    assert!(matches!(
        manager.status("temp"),
        Err(SupervisorError::NotRegistered { .. })
    ));

    manager.shutdown();
}

#[test]
fn update_spec_applies_to_the_next_start() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    manager
        .register(ProcessSpec::new("mutable", "sleep 5"))
        .expect("register");
    manager.start("mutable").expect("start");
    let first = manager.status("mutable").expect("status");
    assert!(first.running);

    manager
        .update_spec("mutable", ProcessSpec::new("mutable", "sleep 7"))
        .expect("update spec");
    // The running child is untouched by the update.
    let updated = manager.status("mutable").expect("status");
    assert_eq!(updated.pid, first.pid);
    assert!(updated.running);

    manager
        .stop("mutable", Duration::from_secs(2))
        .expect("stop");
    manager.start("mutable").expect("start with new spec");
    assert!(manager.status("mutable").expect("status").running);

    manager.shutdown();
}

#[test]
fn history_sinks_observe_start_and_stop() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let sink = RecordingSink::new();
    manager.set_history_sinks(vec![sink.clone() as std::sync::Arc<dyn HistorySink>]);

    manager
        .register(ProcessSpec::new("audited", "sleep 5"))
        .expect("register");
    manager.start("audited").expect("start");
    manager.stop("audited", Duration::from_secs(2)).expect("stop");

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Start);
    assert_eq!(events[0].name, "audited");
    assert!(events[0].pid > 0);
    assert!(events[0].spec_json.contains("\"name\":\"audited\""));
    assert_eq!(events[1].kind, EventKind::Stop);
    assert_eq!(events[1].pid, events[0].pid);

    manager.shutdown();
}

#[test]
fn apply_config_starts_in_priority_order_and_prunes() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let sink = RecordingSink::new();
    manager.set_history_sinks(vec![sink.clone() as std::sync::Arc<dyn HistorySink>]);

    let mut late = ProcessSpec::new("late", "sleep 5");
    late.priority = 10;
    let mut early = ProcessSpec::new("early", "sleep 5");
    early.priority = 1;

    manager
        .apply_config(&[late.clone(), early.clone()])
        .expect("apply");

    let starts: Vec<String> = sink
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::Start)
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(starts, vec!["early", "late"]);
    assert!(manager.status("early").expect("status").running);
    assert!(manager.status("late").expect("status").running);

    // A second apply without "late" shuts it down and removes it.
    manager.apply_config(&[early]).expect("apply subset");
    assert!(matches!(
        manager.status("late"),
        Err(SupervisorError::NotRegistered { .. })
    ));
    assert!(manager.status("early").expect("status").running);

    manager.shutdown();
}

#[test]
fn apply_config_leaves_running_processes_alone() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    let spec = ProcessSpec::new("steady", "sleep 10");
    manager.apply_config(&[spec.clone()]).expect("apply");
    let first = manager.status("steady").expect("status");
    assert!(first.running);

    manager.apply_config(&[spec]).expect("re-apply");
    let second = manager.status("steady").expect("status");
    assert_eq!(second.pid, first.pid, "re-apply must not respawn a live child");

    manager.shutdown();
}

#[test]
fn shutdown_keeps_directory_entries_and_rejects_commands() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);
    manager
        .register(ProcessSpec::new("survivor", "sleep 5"))
        .expect("register");
    manager.start("survivor").expect("start");

    manager.shutdown();

    // The entry is still visible, but its process was stopped and no new
    // commands are accepted.
    let status = manager.status("survivor").expect("status after shutdown");
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(matches!(
        manager.start("survivor"),
        Err(SupervisorError::ShuttingDown)
    ));
}

#[test]
fn validation_errors_surface_synchronously() {
    init_tracing();
    let manager = Manager::with_reconcile_interval(None);

    assert!(matches!(
        manager.register(ProcessSpec::new("", "sleep 1")),
        Err(SupervisorError::EmptyName)
    ));
    assert!(matches!(
        manager.register(ProcessSpec::new("nocmd", "")),
        Err(SupervisorError::EmptyCommand { .. })
    ));

    let mut detached = ProcessSpec::new("detached", "sleep 1");
    detached.detached = true;
    detached.log.stdout = Some("/tmp/detached.log".into());
    assert!(matches!(
        manager.register(detached),
        Err(SupervisorError::DetachedWithFileLogging { .. })
    ));

    manager.shutdown();
}
