//! History sinks for start and stop events.
//!
//! Delivery is best-effort and fire-and-forget: a sink must never fail the
//! supervisor, so the trait is infallible and implementations swallow
//! their own errors. Sinks are invoked without holding any supervisor
//! lock.
use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Kind of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A process reached Running.
    Start,
    /// A process reached Stopped.
    Stop,
}

/// One history event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Process name.
    pub name: String,
    /// PID of the child at event time, 0 when unknown.
    pub pid: u32,
    /// JSON encoding of the spec in force at event time.
    pub spec_json: String,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Builds an event stamped with the current time.
    pub fn now(kind: EventKind, name: &str, pid: u32, spec_json: String) -> Self {
        Self {
            kind,
            name: name.to_string(),
            pid,
            spec_json,
            occurred_at: Utc::now(),
        }
    }
}

/// Receiver for history events.
pub trait HistorySink: Send + Sync {
    /// Delivers one event. Implementations must not panic and must swallow
    /// their own errors.
    fn send(&self, event: &Event);
}

/// Sink appending one JSON object per line to a file.
pub struct JsonLineSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonLineSink {
    /// Creates a sink writing to `path`. The file is opened lazily on the
    /// first event.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

impl HistorySink for JsonLineSink {
    fn send(&self, event: &Event) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    warn!("failed to open history sink {:?}: {err}", self.path);
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            match serde_json::to_string(event) {
                Ok(line) => {
                    if let Err(err) = writeln!(file, "{line}") {
                        warn!("failed to append history event: {err}");
                    }
                }
                Err(err) => warn!("failed to encode history event: {err}"),
            }
        }
    }
}
