//! Pluggable liveness detectors.
//!
//! A detector is a pure probe: it holds nothing but its configuration and
//! answers whether the supervised process looks alive, together with a
//! stable description that feeds `Status.detected_by`. The exec probe
//! signals the process group so a re-parented direct child does not fool
//! it; the PID-file probe verifies the recorded start-time fingerprint
//! before trusting a PID, which defeats PID reuse.
use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::Pid,
};
use tracing::debug;

use crate::{
    command::build_command,
    config::{DetectorConfig, ProcessSpec},
    error::{PidFileError, SupervisorError},
    pidfile,
};

/// A liveness probe. Variants are aggregated in a fixed order by
/// [`probe`]; the first affirmative answer wins.
#[derive(Debug, Clone)]
pub enum Detector {
    /// Zero-signal probe of the process group of a PID owned (or seeded)
    /// by the supervisor.
    Exec {
        /// PID of the supervised child.
        pid: u32,
    },
    /// Read a PID file and probe the recorded PID, honoring the
    /// start-time fingerprint when present.
    PidFile {
        /// Path of the PID file.
        path: PathBuf,
    },
    /// Run a user command; exit status zero means alive.
    Command {
        /// Command line to execute.
        command: String,
    },
}

impl Detector {
    /// Builds a detector from a user configuration entry.
    pub fn from_config(config: &DetectorConfig) -> Self {
        match config {
            DetectorConfig::PidFile { path } => Detector::PidFile { path: path.clone() },
            DetectorConfig::Command { command } => Detector::Command {
                command: command.clone(),
            },
        }
    }

    /// Stable human-readable description of this probe.
    pub fn describe(&self) -> String {
        match self {
            Detector::Exec { pid } => format!("exec:{pid}"),
            Detector::PidFile { path } => format!("pidfile:{}", path.display()),
            Detector::Command { command } => format!("command:{command}"),
        }
    }

    /// Probes liveness once.
    pub fn alive(&self) -> Result<bool, SupervisorError> {
        match self {
            Detector::Exec { pid } => Ok(signal_probe(*pid)),
            Detector::PidFile { path } => pid_file_alive(path),
            Detector::Command { command } => command_alive(command),
        }
    }
}

/// Zero-signal probe. The process group is tried first so the whole tree
/// is covered; when the group is gone the PID itself is probed, since a
/// child may have moved itself into a new group.
fn signal_probe(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let group = Pid::from_raw(-(pid as i32));
    match kill(group, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => matches!(
            kill(Pid::from_raw(pid as i32), None),
            Ok(()) | Err(Errno::EPERM)
        ),
    }
}

fn pid_file_alive(path: &std::path::Path) -> Result<bool, SupervisorError> {
    let contents = match pidfile::read_pid_file(path) {
        Ok(contents) => contents,
        Err(PidFileError::Missing) => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    if let Some(recorded) = contents.start_unix
        && let Some(actual) = pidfile::process_start_unix(contents.pid)
        && actual != recorded
    {
        debug!(
            pid = contents.pid,
            recorded, actual, "PID start time mismatch; treating PID as reused"
        );
        return Ok(false);
    }

    Ok(signal_probe(contents.pid))
}

fn command_alive(command: &str) -> Result<bool, SupervisorError> {
    let argv = build_command(command);
    let Some((program, args)) = argv.split_first() else {
        return Ok(false);
    };
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(SupervisorError::SpawnFailed)?;
    Ok(status.success())
}

/// Runs the full detector stack for a process: exec probe (when a PID is
/// known), then the spec's PID file, then user detectors in declared
/// order. The first affirmative probe wins and its description is
/// returned; probe errors are logged and skipped.
pub fn probe(pid: u32, spec: &ProcessSpec) -> (bool, String) {
    let mut detectors = Vec::new();
    if pid != 0 {
        detectors.push(Detector::Exec { pid });
    }
    if let Some(path) = &spec.pid_file {
        detectors.push(Detector::PidFile { path: path.clone() });
    }
    detectors.extend(spec.detectors.iter().map(Detector::from_config));

    for detector in detectors {
        match detector.alive() {
            Ok(true) => return (true, detector.describe()),
            Ok(false) => {}
            Err(err) => {
                debug!("detector {} failed: {err}", detector.describe());
            }
        }
    }
    (false, String::new())
}
