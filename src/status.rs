//! Status snapshots for supervised processes.
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

/// The state machine states of a managed process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessState {
    /// No child is running and no transition is in flight.
    #[default]
    Stopped,
    /// A start command is being executed.
    Starting,
    /// The child was spawned and survived its start duration.
    Running,
    /// A stop command is being executed.
    Stopping,
}

/// Point-in-time snapshot of one managed process.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Process name.
    pub name: String,
    /// Whether the detector stack currently considers the process alive.
    pub running: bool,
    /// PID of the child, or 0 when none is known.
    pub pid: u32,
    /// When the child was last started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the child last reached Stopped.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last terminal error observation, if any.
    pub exit_error: Option<String>,
    /// Description of the detector that affirmed liveness.
    pub detected_by: String,
    /// Number of automatic restarts since registration.
    pub restarts: u64,
    /// Current state machine state.
    pub state: ProcessState,
}

impl Status {
    /// A stopped snapshot for a process that has never run.
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: false,
            pid: 0,
            started_at: None,
            stopped_at: None,
            exit_error: None,
            detected_by: String::new(),
            restarts: 0,
            state: ProcessState::Stopped,
        }
    }
}
