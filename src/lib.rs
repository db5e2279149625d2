//! Process supervisor core for Unix services.
//!
//! provisr starts, monitors, stops and auto-restarts long-running OS
//! child processes on behalf of an embedding application. Each supervised
//! process is driven by its own serializing state machine; a manager
//! holds the directory of processes and a background reconciler that
//! re-converges state after crashes and PID reuse.

#![warn(unused_crate_dependencies)]
// Only the derive macros from strum_macros are used directly.
use strum as _;
// Test dependencies are only used in test code.
#[cfg(test)]
use tracing_subscriber as _;

/// Command-line interpretation.
pub mod command;

/// Process specifications and validation.
pub mod config;

/// Liveness detectors.
pub mod detector;

/// Environment resolution.
pub mod env;

/// Errors.
pub mod error;

/// History sinks.
pub mod history;

/// Lifecycle hook engine.
pub mod hooks;

/// Per-process state machine.
pub mod managed;

/// Supervisor manager.
pub mod manager;

/// PID file codec.
pub mod pidfile;

/// OS child primitives.
pub mod process;

/// Status snapshots.
pub mod status;
