//! Process specifications and validation.
use std::{
    collections::BTreeSet,
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;

/// Environment variable names starting with this prefix are reserved for
/// values injected by the hook engine.
pub const RESERVED_ENV_PREFIX: &str = "PROVISR_";

/// Maximum number of instances a single spec may expand to.
pub const MAX_INSTANCES: u32 = 100;

/// Maximum accepted length of a hook command string.
pub const MAX_HOOK_COMMAND_LEN: usize = 10_000;

/// Maximum accepted hook timeout.
pub const MAX_HOOK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default hook timeout applied when none is configured.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default minimum delay between auto-restart attempts.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(3);

/// Declarative description of one desired process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Unique name of the process within a manager.
    pub name: String,
    /// Command line used to start the process. May be a shell line.
    pub command: String,
    /// Working directory for the child.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Environment entries (`KEY=VALUE`) applied on top of the resolver
    /// output. Values may reference `${OTHER}`.
    #[serde(default)]
    pub env: Vec<String>,
    /// Optional path where the PID file is written after a successful spawn.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Number of additional start attempts on transient failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Delay between start retries. Skipped entirely when the failure is a
    /// before-start exit.
    #[serde(default)]
    pub retry_interval: Duration,
    /// The child must remain alive this long to count as started.
    /// Zero disables the check.
    #[serde(default)]
    pub start_duration: Duration,
    /// Restart the process automatically when it dies without a stop request.
    #[serde(default)]
    pub auto_restart: bool,
    /// Minimum delay between auto-restart attempts. Defaults to 3s.
    #[serde(default)]
    pub restart_interval: Option<Duration>,
    /// Number of instances to expand to on registration. Must be at least 1.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Start the child in its own session so it survives the supervisor.
    /// Mutually exclusive with file logging.
    #[serde(default)]
    pub detached: bool,
    /// User-configured liveness detectors, probed in order after the
    /// built-in ones.
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
    /// Byte sinks for the child's stdout and stderr.
    #[serde(default)]
    pub log: LogConfig,
    /// Lifecycle hooks run around start and stop.
    #[serde(default)]
    pub lifecycle: LifecycleHooks,
    /// Bulk-apply ordering; lower priorities start first.
    #[serde(default)]
    pub priority: i32,
}

fn default_instances() -> u32 {
    1
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            work_dir: None,
            env: Vec::new(),
            pid_file: None,
            retry_count: 0,
            retry_interval: Duration::ZERO,
            start_duration: Duration::ZERO,
            auto_restart: false,
            restart_interval: None,
            instances: 1,
            detached: false,
            detectors: Vec::new(),
            log: LogConfig::default(),
            lifecycle: LifecycleHooks::default(),
            priority: 0,
        }
    }
}

impl ProcessSpec {
    /// Creates a spec with the given name and command and defaults elsewhere.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Effective minimum delay between auto-restart attempts.
    pub fn restart_interval(&self) -> Duration {
        self.restart_interval.unwrap_or(DEFAULT_RESTART_INTERVAL)
    }

    /// Validates the spec, returning the first violation found.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::EmptyName);
        }
        if self.command.trim().is_empty() {
            return Err(SupervisorError::EmptyCommand {
                name: self.name.clone(),
            });
        }
        if self.detached && (self.log.stdout.is_some() || self.log.stderr.is_some()) {
            return Err(SupervisorError::DetachedWithFileLogging {
                name: self.name.clone(),
            });
        }
        if self.instances == 0 || self.instances > MAX_INSTANCES {
            return Err(SupervisorError::InstancesTooMany {
                name: self.name.clone(),
                requested: self.instances,
                max: MAX_INSTANCES,
            });
        }
        self.lifecycle.validate()?;
        Ok(())
    }

    /// Expands a multi-instance spec into `<name>-1 .. <name>-n` specs.
    /// A single-instance spec is returned unchanged.
    pub fn expand_instances(&self) -> Vec<ProcessSpec> {
        if self.instances <= 1 {
            return vec![self.clone()];
        }
        (1..=self.instances)
            .map(|i| {
                let mut spec = self.clone();
                spec.name = format!("{}-{i}", self.name);
                spec.instances = 1;
                spec
            })
            .collect()
    }
}

/// File sinks for a child's standard streams. Absent sinks go to /dev/null.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Path receiving the child's stdout, opened in append mode.
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    /// Path receiving the child's stderr, opened in append mode.
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

/// User-configured liveness detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Probe the PID recorded in a PID file, honoring the start-time
    /// fingerprint when present.
    PidFile {
        /// Path of the PID file to read.
        path: PathBuf,
    },
    /// Run a short command; exit status zero means alive.
    Command {
        /// Command line to execute.
        command: String,
    },
}

/// What to do when a blocking hook fails or times out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Fail the surrounding phase.
    #[default]
    Fail,
    /// Log the failure and continue with the next hook.
    Ignore,
    /// Pause one second and run the hook once more before failing.
    Retry,
}

/// Whether a hook blocks the phase or runs in the background.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run to completion before the next hook.
    #[default]
    Blocking,
    /// Spawn and continue; the outcome is not observed.
    Async,
}

/// A user-provided command run at one of the four lifecycle phases.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Hook name, unique across all phases of a spec.
    pub name: String,
    /// Command line, always run through the shell.
    pub command: String,
    /// Working directory; falls back to the spec's `work_dir`.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Extra environment entries (`KEY=VALUE`). The reserved `PROVISR_`
    /// namespace is rejected at validation.
    #[serde(default)]
    pub env: Vec<String>,
    /// Maximum runtime for a blocking hook. Defaults to 30s.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Failure policy. Defaults to `fail`.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Run policy. Defaults to `blocking`.
    #[serde(default)]
    pub run_mode: RunMode,
}

impl HookConfig {
    /// Effective timeout for a blocking run.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_HOOK_TIMEOUT)
    }
}

/// Ordered hook lists for the four lifecycle phases.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LifecycleHooks {
    /// Run before the child is spawned; a failure aborts the start.
    #[serde(default)]
    pub pre_start: Vec<HookConfig>,
    /// Run after the process reached Running; failures are logged only.
    #[serde(default)]
    pub post_start: Vec<HookConfig>,
    /// Run before the child is signalled; failures are logged only.
    #[serde(default)]
    pub pre_stop: Vec<HookConfig>,
    /// Run after the process reached Stopped; failures are logged only.
    #[serde(default)]
    pub post_stop: Vec<HookConfig>,
}

impl LifecycleHooks {
    /// Returns true when no hooks are configured in any phase.
    pub fn is_empty(&self) -> bool {
        self.pre_start.is_empty()
            && self.post_start.is_empty()
            && self.pre_stop.is_empty()
            && self.post_stop.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &HookConfig> {
        self.pre_start
            .iter()
            .chain(&self.post_start)
            .chain(&self.pre_stop)
            .chain(&self.post_stop)
    }

    fn validate(&self) -> Result<(), SupervisorError> {
        let mut seen = BTreeSet::new();
        for hook in self.all() {
            validate_hook_name(&hook.name)?;
            if !seen.insert(hook.name.as_str()) {
                return Err(SupervisorError::InvalidHookName {
                    name: hook.name.clone(),
                    reason: "duplicate hook name across phases".into(),
                });
            }
            if hook.command.len() > MAX_HOOK_COMMAND_LEN {
                return Err(SupervisorError::HookCommandTooLong {
                    name: hook.name.clone(),
                    max: MAX_HOOK_COMMAND_LEN,
                });
            }
            if let Some(timeout) = hook.timeout
                && timeout > MAX_HOOK_TIMEOUT
            {
                return Err(SupervisorError::HookTimeoutTooLong {
                    name: hook.name.clone(),
                    max: MAX_HOOK_TIMEOUT,
                });
            }
            for entry in &hook.env {
                let key = entry.split('=').next().unwrap_or(entry);
                if key.starts_with(RESERVED_ENV_PREFIX) {
                    return Err(SupervisorError::ReservedEnvVar {
                        hook: hook.name.clone(),
                        name: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn validate_hook_name(name: &str) -> Result<(), SupervisorError> {
    if name.is_empty() {
        return Err(SupervisorError::InvalidHookName {
            name: name.into(),
            reason: "name is empty".into(),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(SupervisorError::InvalidHookName {
            name: name.into(),
            reason: format!("character '{bad}' is not allowed"),
        });
    }
    Ok(())
}
