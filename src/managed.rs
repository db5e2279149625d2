//! Per-process state machine.
//!
//! Every managed process owns one serializing worker thread that consumes
//! a bounded command channel; all state transitions happen on that thread,
//! so they are free of intra-process races by construction. Callers talk
//! to the worker through value commands carrying reply senders. A 1s
//! health tick is interleaved with command handling to observe child exits
//! and drive auto-restart.
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    config::ProcessSpec,
    detector,
    env::EnvResolver,
    error::SupervisorError,
    history::{Event, EventKind, HistorySink},
    hooks::{self, HookPhase},
    process::Process,
    status::{ProcessState, Status},
};

/// Capacity of the per-process command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Interval of the health tick interleaved with command handling.
const HEALTH_TICK: Duration = Duration::from_secs(1);

/// Stop wait applied during shutdown.
const SHUTDOWN_STOP_WAIT: Duration = Duration::from_secs(3);

/// Shared handle to the manager's history sinks.
pub type SharedSinks = Arc<Mutex<Vec<Arc<dyn HistorySink>>>>;

/// Shared handle to the manager's environment resolver.
pub type SharedEnv = Arc<Mutex<EnvResolver>>;

enum Command {
    Start {
        reply: mpsc::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        wait: Duration,
        reply: mpsc::Sender<Result<(), SupervisorError>>,
    },
    UpdateSpec {
        spec: Box<ProcessSpec>,
        reply: mpsc::Sender<Result<(), SupervisorError>>,
    },
    Recover {
        pid: u32,
        reply: mpsc::Sender<Result<bool, SupervisorError>>,
    },
    Reconcile,
    Shutdown {
        reply: mpsc::Sender<()>,
    },
}

/// Scalar state mirrored out of the worker so `status()` never has to go
/// through the command channel.
#[derive(Debug)]
struct Shared {
    spec: ProcessSpec,
    state: ProcessState,
    pid: u32,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    stopped_at: Option<chrono::DateTime<chrono::Utc>>,
    exit_error: Option<String>,
    restarts: u64,
}

/// One supervised process: the public face of the per-process worker.
pub struct ManagedProcess {
    name: String,
    tx: SyncSender<Command>,
    shared: Arc<Mutex<Shared>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ManagedProcess {
    /// Creates the managed process and spawns its worker thread. The spec
    /// must already be validated.
    pub fn new(spec: ProcessSpec, env: SharedEnv, sinks: SharedSinks) -> Self {
        let name = spec.name.clone();
        let (tx, rx) = mpsc::sync_channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(Mutex::new(Shared {
            spec: spec.clone(),
            state: ProcessState::Stopped,
            pid: 0,
            started_at: None,
            stopped_at: None,
            exit_error: None,
            restarts: 0,
        }));

        let worker = Worker {
            name: name.clone(),
            rx,
            process: Process::new(spec),
            shared: Arc::clone(&shared),
            env,
            sinks,
            last_restart_at: None,
        };
        let handle = thread::Builder::new()
            .name(format!("provisr-{name}"))
            .spawn(move || worker.run())
            .expect("failed to spawn managed process worker");

        Self {
            name,
            tx,
            shared,
            handle: Mutex::new(Some(handle)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the process using the current spec. The reply arrives only
    /// after the state machine reached Running (success) or returned to
    /// Stopped (failure).
    pub fn start(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Start { reply })?;
        rx.recv().map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Stops the process, waiting up to `wait` before the kill escalation.
    /// Stopping a stopped process is a no-op.
    pub fn stop(&self, wait: Duration) -> Result<(), SupervisorError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Stop { wait, reply })?;
        rx.recv().map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Replaces the spec used by the next start without disturbing a
    /// running child. The spec is validated synchronously.
    pub fn update_spec(&self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        spec.validate()?;
        let (reply, rx) = mpsc::channel();
        self.send(Command::UpdateSpec {
            spec: Box::new(spec),
            reply,
        })?;
        rx.recv().map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Attaches to a PID found on disk and probes it. Returns whether the
    /// process was found alive (state Running) or not (state Stopped).
    pub fn recover(&self, pid: u32) -> Result<bool, SupervisorError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Recover { pid, reply })?;
        rx.recv().map_err(|_| SupervisorError::ShuttingDown)?
    }

    /// Asks the worker to re-observe child liveness. Non-blocking; dropped
    /// when the command channel is full, since the next health tick will
    /// converge anyway.
    pub fn reconcile(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        match self.tx.try_send(Command::Reconcile) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Builds a point-in-time status snapshot. When the state machine
    /// believes the process is running, liveness is confirmed through the
    /// detector stack so callers (and the reconciler) can observe
    /// divergence.
    pub fn status(&self) -> Status {
        let (spec, state, pid, started_at, stopped_at, exit_error, restarts) = {
            let shared = self.shared.lock().expect("managed state poisoned");
            (
                shared.spec.clone(),
                shared.state,
                shared.pid,
                shared.started_at,
                shared.stopped_at,
                shared.exit_error.clone(),
                shared.restarts,
            )
        };

        let (running, detected_by) = if state == ProcessState::Running {
            detector::probe(pid, &spec)
        } else {
            (false, String::new())
        };

        Status {
            name: self.name.clone(),
            running,
            pid,
            started_at,
            stopped_at,
            exit_error,
            detected_by,
            restarts,
            state,
        }
    }

    /// Stops the process (3s wait), removes the PID file and terminates
    /// the worker. Further commands fail with `ShuttingDown`.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, rx) = mpsc::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.recv();
        }
        if let Ok(mut guard) = self.handle.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }

    fn send(&self, command: Command) -> Result<(), SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        self.tx
            .send(command)
            .map_err(|_| SupervisorError::ShuttingDown)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    name: String,
    rx: Receiver<Command>,
    process: Process,
    shared: Arc<Mutex<Shared>>,
    env: SharedEnv,
    sinks: SharedSinks,
    last_restart_at: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        let mut next_tick = Instant::now() + HEALTH_TICK;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(Command::Start { reply }) => {
                    let _ = reply.send(self.handle_start());
                }
                Ok(Command::Stop { wait, reply }) => {
                    let _ = reply.send(self.handle_stop(wait));
                }
                Ok(Command::UpdateSpec { spec, reply }) => {
                    let _ = reply.send(self.handle_update_spec(*spec));
                }
                Ok(Command::Recover { pid, reply }) => {
                    let _ = reply.send(Ok(self.handle_recover(pid)));
                }
                Ok(Command::Reconcile) => {
                    self.health_check();
                    self.maybe_auto_restart();
                }
                Ok(Command::Shutdown { reply }) => {
                    if self.state() != ProcessState::Stopped
                        && let Err(err) = self.handle_stop(SHUTDOWN_STOP_WAIT)
                    {
                        warn!("'{}' stop during shutdown failed: {err}", self.name);
                    }
                    self.process.remove_pidfile();
                    let _ = reply.send(());
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.health_check();
                    self.maybe_auto_restart();
                    next_tick = Instant::now() + HEALTH_TICK;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn state(&self) -> ProcessState {
        self.shared.lock().expect("managed state poisoned").state
    }

    fn set_state(&mut self, state: ProcessState) {
        let mut shared = self.shared.lock().expect("managed state poisoned");
        shared.state = state;
        shared.pid = self.process.pid();
        shared.started_at = self.process.started_at();
        shared.stopped_at = self.process.stopped_at();
        shared.exit_error = self.process.exit_error().map(str::to_string);
    }

    fn set_exit_error(&mut self, message: String) {
        let mut shared = self.shared.lock().expect("managed state poisoned");
        shared.exit_error = Some(message);
    }

    fn handle_start(&mut self) -> Result<(), SupervisorError> {
        match self.state() {
            ProcessState::Starting => return Err(SupervisorError::AlreadyStarting),
            ProcessState::Stopping => return Err(SupervisorError::CurrentlyStopping),
            ProcessState::Running => {
                let (alive, _) = self.process.detect_alive();
                if alive {
                    return Err(SupervisorError::AlreadyRunning {
                        pid: self.process.pid(),
                    });
                }
                // The child died without the health tick noticing yet;
                // observe the exit and fall through to a fresh start.
                self.observe_stopped();
            }
            ProcessState::Stopped => {}
        }
        self.start_inner()
    }

    /// Start path shared by explicit starts and auto-restart. PreStart
    /// failure aborts before anything is spawned; any failure after that
    /// reverts to Stopped and removes the PID file.
    fn start_inner(&mut self) -> Result<(), SupervisorError> {
        let spec = self.process.spec().clone();

        if let Err(err) = hooks::run_phase(HookPhase::PreStart, &spec) {
            warn!("'{}' pre-start hooks failed: {err}", self.name);
            self.set_exit_error(err.to_string());
            return Err(err);
        }

        self.set_state(ProcessState::Starting);

        let resolver = self.env.lock().expect("env resolver poisoned").clone();
        let merged = resolver.merge(&spec.env);

        let mut attempts_left = spec.retry_count;
        let result = loop {
            match self.spawn_once(&merged, &spec) {
                Ok(()) => break Ok(()),
                Err(err) if attempts_left > 0 => {
                    attempts_left -= 1;
                    // A before-start exit retries immediately; other
                    // failures honor the configured interval.
                    if matches!(err, SupervisorError::BeforeStart(_)) {
                        debug!("'{}' exited before start, retrying now", self.name);
                    } else {
                        debug!(
                            "'{}' start failed ({err}), retrying in {:?}",
                            self.name, spec.retry_interval
                        );
                        thread::sleep(spec.retry_interval);
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(()) => {
                let pid = self.process.pid();
                self.set_state(ProcessState::Running);
                info!("'{}' running as PID {pid}", self.name);
                if let Err(err) = hooks::run_phase(HookPhase::PostStart, &spec) {
                    warn!("'{}' post-start hooks failed: {err}", self.name);
                }
                self.record_event(EventKind::Start, pid);
                Ok(())
            }
            Err(err) => {
                self.process.remove_pidfile();
                self.set_state(ProcessState::Stopped);
                self.set_exit_error(err.to_string());
                Err(err)
            }
        }
    }

    fn spawn_once(
        &mut self,
        merged_env: &[String],
        spec: &ProcessSpec,
    ) -> Result<(), SupervisorError> {
        let mut cmd = self.process.configure_cmd(merged_env)?;
        self.process.try_start(&mut cmd)?;
        if let Err(err) = self.process.enforce_start_duration(spec.start_duration) {
            self.process.remove_pidfile();
            return Err(err);
        }
        Ok(())
    }

    fn handle_stop(&mut self, wait: Duration) -> Result<(), SupervisorError> {
        if self.state() == ProcessState::Stopped {
            return Ok(());
        }

        let spec = self.process.spec().clone();
        if let Err(err) = hooks::run_phase(HookPhase::PreStop, &spec) {
            warn!("'{}' pre-stop hooks failed: {err}", self.name);
        }

        self.set_state(ProcessState::Stopping);
        let pid = self.process.pid();
        let result = self.process.stop(wait);
        if let Err(err) = &result {
            warn!("'{}' stop reported: {err}", self.name);
        }

        self.set_state(ProcessState::Stopped);
        self.process.remove_pidfile();
        self.record_event(EventKind::Stop, pid);

        if let Err(err) = hooks::run_phase(HookPhase::PostStop, &spec) {
            warn!("'{}' post-stop hooks failed: {err}", self.name);
        }
        result
    }

    fn handle_update_spec(&mut self, spec: ProcessSpec) -> Result<(), SupervisorError> {
        self.process.set_spec(spec.clone());
        let mut shared = self.shared.lock().expect("managed state poisoned");
        shared.spec = spec;
        Ok(())
    }

    /// Seeds a PID discovered on disk and probes it. Running children are
    /// adopted; dead ones leave the machine Stopped with the stale PID
    /// file removed.
    fn handle_recover(&mut self, pid: u32) -> bool {
        self.process.seed_pid(pid);
        let (alive, source) = self.process.detect_alive();
        if alive {
            self.set_state(ProcessState::Running);
            info!("'{}' recovered running PID {pid} via {source}", self.name);
            true
        } else {
            self.process.observe_exit();
            self.process.remove_pidfile();
            self.set_state(ProcessState::Stopped);
            debug!("'{}' PID {pid} not alive at recovery", self.name);
            false
        }
    }

    /// Observes child exit outside an explicit stop.
    fn observe_stopped(&mut self) {
        let pid = self.process.pid();
        self.process.observe_exit();
        self.set_state(ProcessState::Stopped);
        self.record_event(EventKind::Stop, pid);
    }

    fn health_check(&mut self) {
        if self.state() != ProcessState::Running {
            return;
        }
        if !self.process.handle_alive() {
            info!("'{}' exited unexpectedly", self.name);
            self.observe_stopped();
        }
    }

    fn maybe_auto_restart(&mut self) {
        let spec = self.process.spec();
        if !spec.auto_restart
            || self.state() != ProcessState::Stopped
            || self.process.stop_requested()
        {
            return;
        }
        let interval = spec.restart_interval();
        if let Some(last) = self.last_restart_at
            && last.elapsed() < interval
        {
            return;
        }

        debug!("'{}' auto-restarting", self.name);
        match self.start_inner() {
            Ok(()) => {
                self.last_restart_at = Some(Instant::now());
                let mut shared = self.shared.lock().expect("managed state poisoned");
                shared.restarts += 1;
            }
            Err(err) => {
                debug!("'{}' auto-restart failed: {err}", self.name);
            }
        }
    }

    /// Delivers a history event to all sinks. The sink list is copied out
    /// of the shared handle first so no lock is held during delivery.
    fn record_event(&self, kind: EventKind, pid: u32) {
        let sinks: Vec<Arc<dyn HistorySink>> = match self.sinks.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        if sinks.is_empty() {
            return;
        }
        let spec_json = serde_json::to_string(self.process.spec()).unwrap_or_default();
        let event = Event::now(kind, &self.name, pid, spec_json);
        for sink in sinks {
            sink.send(&event);
        }
    }
}
