//! Supervisor manager: the directory of managed processes, bulk
//! operations, declarative config application and the reconciler.
//!
//! Locking discipline: the directory lock is only ever held to read or
//! mutate the name map. Managed-process handles are snapshotted out of
//! the map before any per-process operation is invoked, so the directory
//! lock can never participate in an inversion with a per-process lock.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    config::ProcessSpec,
    detector::Detector,
    env::EnvResolver,
    error::SupervisorError,
    history::HistorySink,
    managed::{ManagedProcess, SharedEnv, SharedSinks},
    status::{ProcessState, Status},
};

/// Default tick of the background reconciler.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

/// Stop wait used when the reconciler clears a stale running entry.
const STALE_STOP_WAIT: Duration = Duration::from_secs(1);

type Directory = Arc<Mutex<HashMap<String, Arc<ManagedProcess>>>>;

/// Directory of managed processes behind the public supervisor API.
pub struct Manager {
    directory: Directory,
    env: SharedEnv,
    sinks: SharedSinks,
    reconciler: Mutex<Option<Reconciler>>,
    shutting_down: AtomicBool,
}

impl Manager {
    /// Creates a manager with the reconciler running at the default
    /// interval.
    pub fn new() -> Self {
        Self::with_reconcile_interval(Some(DEFAULT_RECONCILE_INTERVAL))
    }

    /// Creates a manager with a custom reconciler interval, or without a
    /// reconciler when `interval` is `None`.
    pub fn with_reconcile_interval(interval: Option<Duration>) -> Self {
        let directory: Directory = Arc::new(Mutex::new(HashMap::new()));
        let reconciler = interval.map(|interval| {
            Reconciler::spawn(Arc::clone(&directory), interval)
        });
        Self {
            directory,
            env: Arc::new(Mutex::new(EnvResolver::new())),
            sinks: Arc::new(Mutex::new(Vec::new())),
            reconciler: Mutex::new(reconciler),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn ensure_accepting(&self) -> Result<(), SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        Ok(())
    }

    /// Registers one process under its spec name. The spec is validated;
    /// duplicate names are rejected.
    pub fn register(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        spec.validate()?;
        let mut directory = self.directory.lock().expect("directory poisoned");
        if directory.contains_key(&spec.name) {
            return Err(SupervisorError::AlreadyRegistered {
                name: spec.name.clone(),
            });
        }
        let name = spec.name.clone();
        let managed = Arc::new(ManagedProcess::new(
            spec,
            Arc::clone(&self.env),
            Arc::clone(&self.sinks),
        ));
        directory.insert(name, managed);
        Ok(())
    }

    /// Registers a spec expanded to its instances (`<name>-1..N`). All
    /// resulting names are checked before any of them is inserted.
    pub fn register_n(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        spec.validate()?;
        let expanded = spec.expand_instances();
        let mut directory = self.directory.lock().expect("directory poisoned");
        for instance in &expanded {
            if directory.contains_key(&instance.name) {
                return Err(SupervisorError::AlreadyRegistered {
                    name: instance.name.clone(),
                });
            }
        }
        for instance in expanded {
            let name = instance.name.clone();
            let managed = Arc::new(ManagedProcess::new(
                instance,
                Arc::clone(&self.env),
                Arc::clone(&self.sinks),
            ));
            directory.insert(name, managed);
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<ManagedProcess>, SupervisorError> {
        let directory = self.directory.lock().expect("directory poisoned");
        directory
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotRegistered { name: name.into() })
    }

    /// Starts the named process using its current spec.
    pub fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        self.lookup(name)?.start()
    }

    /// Stops the named process, waiting up to `wait` before the kill
    /// escalation.
    pub fn stop(&self, name: &str, wait: Duration) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        self.lookup(name)?.stop(wait)
    }

    /// Replaces the spec used by the next start of the named process.
    pub fn update_spec(
        &self,
        name: &str,
        spec: ProcessSpec,
    ) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        self.lookup(name)?.update_spec(spec)
    }

    /// Stops the named process, shuts its worker down and removes it from
    /// the directory.
    pub fn unregister(&self, name: &str, wait: Duration) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        let managed = self.lookup(name)?;
        let stop_result = managed.stop(wait);
        if let Err(err) = &stop_result {
            warn!("'{name}' stop during unregister reported: {err}");
        }
        managed.shutdown();
        let mut directory = self.directory.lock().expect("directory poisoned");
        directory.remove(name);
        Ok(())
    }

    /// Status of one process.
    pub fn status(&self, name: &str) -> Result<Status, SupervisorError> {
        Ok(self.lookup(name)?.status())
    }

    /// Statuses of all processes matching `pattern`, sorted by name.
    pub fn status_all(&self, pattern: &str) -> Vec<Status> {
        let mut statuses: Vec<Status> = self
            .snapshot_matching(pattern)
            .iter()
            .map(|managed| managed.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stops every process matching `pattern`. Stop failures are logged
    /// and do not interrupt the sweep; no ordering is applied.
    pub fn stop_all(&self, pattern: &str, wait: Duration) {
        for managed in self.snapshot_matching(pattern) {
            if let Err(err) = managed.stop(wait) {
                warn!("'{}' stop reported: {err}", managed.name());
            }
        }
    }

    /// Number of processes matching `pattern` that are currently running.
    pub fn count(&self, pattern: &str) -> usize {
        self.snapshot_matching(pattern)
            .iter()
            .filter(|managed| managed.status().running)
            .count()
    }

    /// Replaces the supervisor-global environment overrides. Running
    /// processes keep the environment they were started with.
    pub fn set_global_env(&self, entries: &[String]) {
        let mut env = self.env.lock().expect("env resolver poisoned");
        *env = EnvResolver::from_entries(entries);
    }

    /// Replaces the history sinks shared by all managed processes.
    pub fn set_history_sinks(&self, sinks: Vec<Arc<dyn HistorySink>>) {
        let mut guard = self.sinks.lock().expect("history sinks poisoned");
        *guard = sinks;
    }

    /// Declarative reconciliation: expands the desired specs, recovers
    /// processes whose PID file still points at a live child, starts the
    /// rest in ascending priority order, and shuts down and removes every
    /// managed name not in the desired set. Per-process failures are
    /// logged so the rest of the set still converges.
    pub fn apply_config(&self, specs: &[ProcessSpec]) -> Result<(), SupervisorError> {
        self.ensure_accepting()?;
        for spec in specs {
            spec.validate()?;
        }

        let mut desired: Vec<ProcessSpec> =
            specs.iter().flat_map(|spec| spec.expand_instances()).collect();
        desired.sort_by_key(|spec| spec.priority);
        let desired_names: HashSet<String> =
            desired.iter().map(|spec| spec.name.clone()).collect();

        for spec in desired {
            let name = spec.name.clone();
            let managed = match self.lookup(&name) {
                Ok(managed) => {
                    if let Err(err) = managed.update_spec(spec.clone()) {
                        warn!("'{name}' spec update failed: {err}");
                    }
                    managed
                }
                Err(_) => {
                    self.register(spec.clone())?;
                    self.lookup(&name)?
                }
            };

            if let Some(pid) = recoverable_pid(&spec) {
                match managed.recover(pid) {
                    Ok(true) => {
                        info!("'{name}' recovered from PID file (PID {pid})");
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => warn!("'{name}' recovery failed: {err}"),
                }
            }

            match managed.start() {
                Ok(()) => {}
                Err(SupervisorError::AlreadyRunning { .. }) => {}
                Err(err) => warn!("'{name}' start during apply failed: {err}"),
            }
        }

        let obsolete: Vec<(String, Arc<ManagedProcess>)> = {
            let directory = self.directory.lock().expect("directory poisoned");
            directory
                .iter()
                .filter(|(name, _)| !desired_names.contains(*name))
                .map(|(name, managed)| (name.clone(), Arc::clone(managed)))
                .collect()
        };
        for (name, managed) in obsolete {
            info!("'{name}' no longer desired, shutting down");
            managed.shutdown();
            let mut directory = self.directory.lock().expect("directory poisoned");
            directory.remove(&name);
        }
        Ok(())
    }

    /// Runs one reconciler pass synchronously. Also used by the
    /// background reconciler thread.
    pub fn reconcile_now(&self) {
        let processes: Vec<Arc<ManagedProcess>> = {
            let directory = self.directory.lock().expect("directory poisoned");
            directory.values().cloned().collect()
        };
        reconcile_pass(&processes);
    }

    /// Stops the reconciler and shuts down every managed process. The
    /// directory entries are retained; only `unregister` removes them.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.reconciler.lock()
            && let Some(reconciler) = guard.take()
        {
            reconciler.stop();
        }
        let processes: Vec<Arc<ManagedProcess>> = {
            let directory = self.directory.lock().expect("directory poisoned");
            directory.values().cloned().collect()
        };
        for managed in processes {
            managed.shutdown();
        }
        info!("supervisor shut down");
    }

    fn snapshot_matching(&self, pattern: &str) -> Vec<Arc<ManagedProcess>> {
        let directory = self.directory.lock().expect("directory poisoned");
        directory
            .iter()
            .filter(|(name, _)| pattern_matches(pattern, name))
            .map(|(_, managed)| Arc::clone(managed))
            .collect()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads the spec's PID file and verifies the recorded PID (including its
/// start-time fingerprint) before recovery is attempted.
fn recoverable_pid(spec: &ProcessSpec) -> Option<u32> {
    let path = spec.pid_file.as_ref()?;
    let contents = crate::pidfile::read_pid_file(path).ok()?;
    let probe = Detector::PidFile { path: path.clone() };
    match probe.alive() {
        Ok(true) => Some(contents.pid),
        _ => None,
    }
}

/// One pass over a directory snapshot, applying the two reconciler
/// corrections. Errors are swallowed; the next tick re-converges.
fn reconcile_pass(processes: &[Arc<ManagedProcess>]) {
    for managed in processes {
        let status = managed.status();
        if status.running && status.pid == 0 {
            debug!("'{}' running without a PID, stopping", managed.name());
            if let Err(err) = managed.stop(STALE_STOP_WAIT) {
                debug!("'{}' stale stop reported: {err}", managed.name());
            }
        } else if !status.running
            && status.pid != 0
            && status.state == ProcessState::Running
        {
            debug!("'{}' looks dead, requesting reconcile", managed.name());
            managed.reconcile();
        }
    }
}

/// Matches a status pattern against a process name. Supported forms:
/// empty or `*` (everything), exact, `prefix*`, `*suffix`, `*inner*`, and
/// base-name expansion where `p` also matches `p-<instance>`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if pattern == name {
        return true;
    }
    if let Some(stripped) = pattern.strip_prefix('*') {
        if let Some(inner) = stripped.strip_suffix('*') {
            return inner.is_empty() || name.contains(inner);
        }
        return name.ends_with(stripped);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    name.len() > pattern.len()
        && name.starts_with(pattern)
        && name.as_bytes()[pattern.len()] == b'-'
}

/// Background thread re-converging managed-process state, in the style of
/// a periodic collector: an atomic stop flag plus a joined handle, with
/// the sleep cut into short steps so `stop()` returns promptly.
struct Reconciler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    fn spawn(directory: Directory, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            while !stop_clone.load(Ordering::SeqCst) {
                let processes: Vec<Arc<ManagedProcess>> = {
                    let directory = directory.lock().expect("directory poisoned");
                    directory.values().cloned().collect()
                };
                reconcile_pass(&processes);

                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_clone.load(Ordering::SeqCst) {
                        return;
                    }
                    let remaining = interval.saturating_sub(slept);
                    let step = remaining.min(Duration::from_millis(100));
                    thread::sleep(step);
                    slept += step;
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
