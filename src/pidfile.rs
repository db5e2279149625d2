//! PID file codec.
//!
//! On-disk format is three lines: the PID, the spec JSON, and a meta JSON
//! object carrying the OS-reported start time of the child. The start time
//! acts as a fingerprint so a recycled PID is never mistaken for the
//! supervised process. Legacy one-line (PID only) and two-line (PID plus
//! spec) files are accepted on read.
use std::{
    fs,
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::Path,
};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::{config::ProcessSpec, error::PidFileError};

const PID_FILE_MODE: u32 = 0o600;
const PID_DIR_MODE: u32 = 0o750;

/// Third-line metadata stored alongside the PID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidFileMeta {
    /// OS-reported start time of the child, seconds since the Unix epoch.
    pub start_unix: i64,
}

/// Parsed content of a PID file.
#[derive(Debug, Clone)]
pub struct PidFileContents {
    /// The recorded PID.
    pub pid: u32,
    /// The spec as written at spawn time, when present.
    pub spec: Option<ProcessSpec>,
    /// The start-time fingerprint, when present.
    pub start_unix: Option<i64>,
}

/// Writes a PID file atomically: temp file in the target directory, then
/// rename. The file is created with mode 0600, parents with mode 0750.
/// When `start_unix` is unknown the meta line is omitted rather than
/// fabricated.
pub fn write_pid_file(
    path: &Path,
    pid: u32,
    spec: &ProcessSpec,
    start_unix: Option<i64>,
) -> Result<(), PidFileError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(PID_DIR_MODE)
            .create(parent)?;
    }

    let spec_json = serde_json::to_string(spec)?;
    let mut document = format!("{pid}\n{spec_json}\n");
    if let Some(start_unix) = start_unix {
        let meta = serde_json::to_string(&PidFileMeta { start_unix })?;
        document.push_str(&meta);
        document.push('\n');
    }

    let tmp = path.with_file_name(format!(
        "{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pid".into())
    ));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PID_FILE_MODE)
        .open(&tmp)?;
    file.write_all(document.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a PID file. Only the first line is required; trailing whitespace
/// and CRLF line endings are tolerated.
pub fn read_pid_file(path: &Path) -> Result<PidFileContents, PidFileError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PidFileError::Missing);
        }
        Err(err) => return Err(err.into()),
    };

    let mut lines = content.lines().map(str::trim_end);
    let pid_line = lines.next().unwrap_or("").trim();
    let pid: u32 = pid_line
        .parse()
        .map_err(|_| PidFileError::Invalid(format!("bad PID line {pid_line:?}")))?;

    let spec = match lines.next().map(str::trim) {
        Some(line) if !line.is_empty() => Some(serde_json::from_str(line)?),
        _ => None,
    };

    let start_unix = match lines.next().map(str::trim) {
        Some(line) if !line.is_empty() => {
            let meta: PidFileMeta = serde_json::from_str(line)?;
            Some(meta.start_unix)
        }
        _ => None,
    };

    Ok(PidFileContents {
        pid,
        spec,
        start_unix,
    })
}

/// Removes a PID file. A missing file is not an error.
pub fn remove_pid_file(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Queries the OS for the start time of `pid`, seconds since the Unix
/// epoch. Returns `None` when the process cannot be found.
pub fn process_start_unix(pid: u32) -> Option<i64> {
    let mut system = System::new();
    let target = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let started = system.process(target).map(|p| p.start_time() as i64);
    if started.is_none() {
        debug!("no start time available for PID {pid}");
    }
    started
}
