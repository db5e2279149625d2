//! Error handling for provisr.
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A spec was submitted with an empty (or whitespace-only) name.
    #[error("Process name must not be empty")]
    EmptyName,

    /// A spec was submitted with an empty command line.
    #[error("Process '{name}' has an empty command")]
    EmptyCommand {
        /// The offending spec name.
        name: String,
    },

    /// Detached processes cannot also log to files; the child outlives the
    /// supervisor and would hold the sinks open.
    #[error("Process '{name}' is detached and cannot use file logging")]
    DetachedWithFileLogging {
        /// The offending spec name.
        name: String,
    },

    /// A hook name is empty, duplicated, or contains forbidden characters.
    #[error("Invalid hook name '{name}': {reason}")]
    InvalidHookName {
        /// The offending hook name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// A hook configured an environment variable in the reserved namespace.
    #[error("Hook '{hook}' sets reserved environment variable '{name}'")]
    ReservedEnvVar {
        /// The hook carrying the reserved variable.
        hook: String,
        /// The rejected variable name.
        name: String,
    },

    /// A hook command exceeds the maximum accepted length.
    #[error("Hook '{name}' command exceeds {max} characters")]
    HookCommandTooLong {
        /// The offending hook name.
        name: String,
        /// Maximum accepted command length.
        max: usize,
    },

    /// A hook timeout exceeds the maximum accepted duration.
    #[error("Hook '{name}' timeout exceeds {max:?}")]
    HookTimeoutTooLong {
        /// The offending hook name.
        name: String,
        /// Maximum accepted timeout.
        max: Duration,
    },

    /// A spec requested more instances than the supervisor accepts.
    #[error("Process '{name}' requests {requested} instances (maximum {max})")]
    InstancesTooMany {
        /// The offending spec name.
        name: String,
        /// Requested instance count.
        requested: u32,
        /// Maximum accepted instance count.
        max: u32,
    },

    /// A name was registered twice with the same manager.
    #[error("Process '{name}' is already registered")]
    AlreadyRegistered {
        /// The duplicated name.
        name: String,
    },

    /// Start was requested while the process is already running.
    #[error("Process is already running with PID {pid}")]
    AlreadyRunning {
        /// PID of the live child.
        pid: u32,
    },

    /// Start was requested while a previous start is still in flight.
    #[error("Process is already starting")]
    AlreadyStarting,

    /// Start was requested while a stop is in flight.
    #[error("Process is currently stopping")]
    CurrentlyStopping,

    /// The named process is not registered with the manager.
    #[error("Process '{name}' is not registered")]
    NotRegistered {
        /// The unknown name.
        name: String,
    },

    /// The manager or managed process is shutting down and no longer
    /// accepts commands.
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    /// The OS refused to spawn the child.
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The child exited before `start_duration` elapsed.
    #[error("Process exited before running for {0:?}")]
    BeforeStart(Duration),

    /// The child ignored SIGTERM for the full stop wait and was killed.
    #[error("Process did not exit within the stop timeout and was killed")]
    StopTimeout,

    /// The child terminated with a non-zero exit status.
    #[error("Process exited with status {0}")]
    ExitStatus(i32),

    /// A blocking hook exceeded its timeout.
    #[error("Hook '{name}' timed out after {timeout:?}")]
    HookTimeout {
        /// The hook that timed out.
        name: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// A blocking hook failed and its failure mode is `fail`.
    #[error("Hook '{name}' failed: {reason}")]
    HookFailed {
        /// The failing hook.
        name: String,
        /// Exit status or spawn error description.
        reason: String,
    },

    /// A hook with failure mode `retry` failed its retry as well.
    #[error("Hook '{name}' failed after retry")]
    HookRetriesExhausted {
        /// The failing hook.
        name: String,
    },

    /// Error for PID file operations.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// Underlying I/O error outside the spawn path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The PID file does not exist.
    #[error("PID file not found")]
    Missing,

    /// The PID file content could not be parsed.
    #[error("Invalid PID file: {0}")]
    Invalid(String),

    /// The recorded start-time fingerprint does not match the live process;
    /// the PID has been reused by an unrelated process.
    #[error("PID has been reused since the PID file was written")]
    PidReused,

    /// Error reading or writing the PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding the embedded spec JSON.
    #[error("Failed to parse PID file JSON: {0}")]
    Json(#[from] serde_json::Error),
}
