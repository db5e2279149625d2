//! Lifecycle hook engine.
//!
//! Hooks run around start and stop in four phases. Each hook is a shell
//! command with its own timeout, failure policy and run mode. The engine
//! injects `PROVISR_PROCESS_NAME`, `PROVISR_HOOK_NAME` and
//! `PROVISR_HOOK_PHASE` into every hook environment; that namespace is
//! reserved and rejected at spec validation.
use std::{
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::{
    config::{FailureMode, HookConfig, ProcessSpec, RunMode},
    error::SupervisorError,
};

/// Pause before the single retry of a hook with `failure_mode = retry`.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Poll granularity for blocking hook timeouts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The four lifecycle phases hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum HookPhase {
    /// Before the child is spawned.
    PreStart,
    /// After the process reached Running.
    PostStart,
    /// Before the child is signalled.
    PreStop,
    /// After the process reached Stopped.
    PostStop,
}

/// Runs all hooks of one phase in declared order. The first hook failure
/// that is not ignored fails the whole phase; the caller decides what a
/// phase failure means for the surrounding transition.
pub fn run_phase(phase: HookPhase, spec: &ProcessSpec) -> Result<(), SupervisorError> {
    let hooks = match phase {
        HookPhase::PreStart => &spec.lifecycle.pre_start,
        HookPhase::PostStart => &spec.lifecycle.post_start,
        HookPhase::PreStop => &spec.lifecycle.pre_stop,
        HookPhase::PostStop => &spec.lifecycle.post_stop,
    };

    for hook in hooks {
        match hook.run_mode {
            RunMode::Async => spawn_async(phase, spec, hook),
            RunMode::Blocking => match run_blocking(phase, spec, hook) {
                Ok(()) => {}
                Err(err) => match hook.failure_mode {
                    FailureMode::Ignore => {
                        warn!(
                            "hook '{}' ({phase}) failed, ignoring: {err}",
                            hook.name
                        );
                    }
                    FailureMode::Fail => return Err(err),
                    FailureMode::Retry => {
                        warn!(
                            "hook '{}' ({phase}) failed, retrying once: {err}",
                            hook.name
                        );
                        thread::sleep(RETRY_PAUSE);
                        if let Err(err) = run_blocking(phase, spec, hook) {
                            warn!("hook '{}' retry failed: {err}", hook.name);
                            return Err(SupervisorError::HookRetriesExhausted {
                                name: hook.name.clone(),
                            });
                        }
                    }
                },
            },
        }
    }
    Ok(())
}

fn build_hook_command(phase: HookPhase, spec: &ProcessSpec, hook: &HookConfig) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(&hook.command);

    if let Some(dir) = hook.work_dir.as_ref().or(spec.work_dir.as_ref()) {
        cmd.current_dir(dir);
    }

    for entry in spec.env.iter().chain(&hook.env) {
        if let Some((key, value)) = entry.split_once('=')
            && !key.is_empty()
        {
            cmd.env(key, value);
        }
    }
    cmd.env("PROVISR_PROCESS_NAME", &spec.name);
    cmd.env("PROVISR_HOOK_NAME", &hook.name);
    cmd.env("PROVISR_HOOK_PHASE", phase.as_ref());

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Spawns a fire-and-forget hook. A reaper thread waits on the child so
/// it never lingers as a zombie; the outcome is lost.
fn spawn_async(phase: HookPhase, spec: &ProcessSpec, hook: &HookConfig) {
    let mut cmd = build_hook_command(phase, spec, hook);
    match cmd.spawn() {
        Ok(mut child) => {
            debug!("async hook '{}' ({phase}) spawned as {}", hook.name, child.id());
            thread::spawn(move || {
                let _ = child.wait();
            });
        }
        Err(err) => {
            warn!("async hook '{}' ({phase}) failed to spawn: {err}", hook.name);
        }
    }
}

/// Runs a hook to completion, killing it when the timeout elapses.
fn run_blocking(
    phase: HookPhase,
    spec: &ProcessSpec,
    hook: &HookConfig,
) -> Result<(), SupervisorError> {
    let timeout = hook.timeout();
    let mut cmd = build_hook_command(phase, spec, hook);
    let mut child = cmd.spawn().map_err(|err| SupervisorError::HookFailed {
        name: hook.name.clone(),
        reason: err.to_string(),
    })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    return Ok(());
                }
                return Err(SupervisorError::HookFailed {
                    name: hook.name.clone(),
                    reason: format!("exit status {}", status.code().unwrap_or(-1)),
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SupervisorError::HookTimeout {
                        name: hook.name.clone(),
                        timeout,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                return Err(SupervisorError::HookFailed {
                    name: hook.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
}
