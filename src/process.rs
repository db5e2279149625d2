//! OS child primitives for one supervised process.
//!
//! `Process` owns the child handle, the PID file and the stdio sinks of a
//! single supervised process. It implements mechanism only; policy (state
//! transitions, hooks, retries, restarts) lives in the managed-process
//! state machine driving it.
use std::{
    fs::OpenOptions,
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{
    command::build_command,
    config::ProcessSpec,
    detector,
    error::SupervisorError,
    pidfile,
};

/// Poll granularity for the start-duration watch.
const START_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll granularity while waiting for a signalled child to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The OS-level half of one supervised process.
pub struct Process {
    spec: ProcessSpec,
    child: Option<Child>,
    pid: u32,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    exit_error: Option<String>,
    stop_requested: bool,
}

impl Process {
    /// Creates a process shell for `spec` with no child attached.
    ///
    /// The stop-requested flag starts set so a process that has never been
    /// started is not picked up by auto-restart.
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: 0,
            started_at: None,
            stopped_at: None,
            exit_error: None,
            stop_requested: true,
        }
    }

    /// The spec used by the next start.
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Replaces the spec used by the next start. The running child, if
    /// any, is not disturbed.
    pub fn set_spec(&mut self, spec: ProcessSpec) {
        self.spec = spec;
    }

    /// PID of the current child, or 0 when none is known.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the child was last started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the child last stopped.
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    /// Last terminal error observation.
    pub fn exit_error(&self) -> Option<&str> {
        self.exit_error.as_deref()
    }

    /// Whether the last stop was requested by a caller (as opposed to the
    /// child dying on its own).
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Builds the child invocation for the spec with exactly the provided
    /// merged environment; the parent environment is not inherited.
    pub fn configure_cmd(
        &self,
        merged_env: &[String],
    ) -> Result<Command, SupervisorError> {
        let argv = build_command(&self.spec.command);
        let Some((program, args)) = argv.split_first() else {
            return Err(SupervisorError::EmptyCommand {
                name: self.spec.name.clone(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        for entry in merged_env {
            let (key, value) = crate::env::split_merged(entry);
            if !key.is_empty() {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &self.spec.work_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(self.open_sink(self.spec.log.stdout.as_deref())?);
        cmd.stderr(self.open_sink(self.spec.log.stderr.as_deref())?);

        if self.spec.detached {
            // A detached child gets its own session so it survives the
            // supervisor; a plain child gets its own process group so the
            // whole tree can be signalled with one negative-PID kill.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        } else {
            cmd.process_group(0);
        }
        Ok(cmd)
    }

    fn open_sink(&self, path: Option<&std::path::Path>) -> Result<Stdio, SupervisorError> {
        match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(SupervisorError::Io)?;
                Ok(Stdio::from(file))
            }
            None => Ok(Stdio::null()),
        }
    }

    /// Spawns the configured command and records the new child. The PID
    /// file, when configured, is written with the start-time fingerprint;
    /// failures there are logged, never fatal.
    pub fn try_start(&mut self, cmd: &mut Command) -> Result<(), SupervisorError> {
        let child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;
        self.pid = child.id();
        self.child = Some(child);
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
        self.exit_error = None;
        self.stop_requested = false;
        debug!("spawned '{}' as PID {}", self.spec.name, self.pid);
        self.write_pidfile();
        Ok(())
    }

    /// Watches the fresh child for `duration`, polling at 10ms. Returns
    /// `BeforeStart` the moment the child disappears inside the window.
    pub fn enforce_start_duration(
        &mut self,
        duration: Duration,
    ) -> Result<(), SupervisorError> {
        if duration.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        self.record_exit(status);
                        self.finish_stop();
                        return Err(SupervisorError::BeforeStart(duration));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!("try_wait failed for '{}': {err}", self.spec.name);
                    }
                }
            } else {
                return Err(SupervisorError::BeforeStart(duration));
            }
            thread::sleep(START_POLL_INTERVAL);
        }
        Ok(())
    }

    /// Sends SIGTERM to the process group, escalating to SIGKILL when the
    /// child has not exited within `wait`. Returns `StopTimeout` when
    /// escalation was needed; the process is terminated either way.
    pub fn stop(&mut self, wait: Duration) -> Result<(), SupervisorError> {
        if self.pid == 0 {
            return Ok(());
        }
        self.stop_requested = true;
        self.signal_group(Signal::SIGTERM);

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if !self.handle_alive() {
                self.finish_stop();
                return Ok(());
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        warn!(
            "'{}' (PID {}) ignored SIGTERM for {wait:?}, killing",
            self.spec.name, self.pid
        );
        self.signal_group(Signal::SIGKILL);
        self.reap();
        self.finish_stop();
        Err(SupervisorError::StopTimeout)
    }

    /// Immediate forceful termination of the process group.
    pub fn kill(&mut self) {
        if self.pid == 0 {
            return;
        }
        self.stop_requested = true;
        self.signal_group(Signal::SIGKILL);
        self.reap();
        self.finish_stop();
    }

    /// Runs the detector stack: the owned exec handle first, then the PID
    /// file, then user detectors. Returns liveness plus the description of
    /// the affirming detector.
    pub fn detect_alive(&mut self) -> (bool, String) {
        if self.child.is_some() && !self.child_alive() {
            return (false, String::new());
        }
        detector::probe(self.pid, &self.spec)
    }

    /// Cheap handle-only liveness check used by the health tick. Reaps and
    /// records the exit when the child has terminated.
    pub fn handle_alive(&mut self) -> bool {
        if self.child.is_some() {
            return self.child_alive();
        }
        if self.pid != 0 {
            let (alive, _) = detector::probe(self.pid, &self.spec);
            return alive;
        }
        false
    }

    /// Attaches to a PID discovered on disk without owning a handle.
    /// Liveness then falls back to signal and PID-file probes.
    pub fn seed_pid(&mut self, pid: u32) {
        self.child = None;
        self.pid = pid;
        self.stop_requested = false;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Marks the process stopped without signalling anything. Used when a
    /// health check observes that the child died on its own.
    pub fn observe_exit(&mut self) {
        self.finish_stop();
    }

    /// Writes the PID file with the start-time fingerprint, best-effort.
    pub fn write_pidfile(&self) {
        let Some(path) = &self.spec.pid_file else {
            return;
        };
        let start_unix = pidfile::process_start_unix(self.pid);
        if let Err(err) = pidfile::write_pid_file(path, self.pid, &self.spec, start_unix)
        {
            warn!("failed to write PID file for '{}': {err}", self.spec.name);
        }
    }

    /// Removes the PID file, best-effort.
    pub fn remove_pidfile(&self) {
        let Some(path) = &self.spec.pid_file else {
            return;
        };
        if let Err(err) = pidfile::remove_pid_file(path) {
            warn!("failed to remove PID file for '{}': {err}", self.spec.name);
        }
    }

    fn signal_group(&self, signal: Signal) {
        let group = Pid::from_raw(self.pid as i32);
        match killpg(group, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {}
            Err(err) => {
                // Group signalling can be refused for a reparented child;
                // fall back to the PID itself.
                debug!(
                    "killpg({}, {signal}) failed ({err}), falling back to kill",
                    self.pid
                );
                let _ = nix::sys::signal::kill(Pid::from_raw(self.pid as i32), signal);
            }
        }
    }

    /// True while the owned child has not been reaped. Records the exit
    /// status when the child has terminated.
    fn child_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                self.child = None;
                false
            }
            Err(err) => {
                warn!("try_wait failed for '{}': {err}", self.spec.name);
                true
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if status.success() {
            self.exit_error = None;
        } else if let Some(code) = status.code() {
            self.exit_error = Some(SupervisorError::ExitStatus(code).to_string());
        } else if let Some(signal) = status.signal() {
            self.exit_error = Some(format!("Process terminated by signal {signal}"));
        }
    }

    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {
                    if let Ok(status) = child.wait() {
                        self.record_exit(status);
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn finish_stop(&mut self) {
        self.child = None;
        self.pid = 0;
        self.stopped_at = Some(Utc::now());
    }
}
