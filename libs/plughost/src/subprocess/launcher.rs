// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use super::ProcessHandle;
use crate::error::Result;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A started worker whose liveness the host can observe and end.
pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking. `Some` once the process has exited.
    fn poll_exit(&mut self) -> Result<Option<ExitInfo>>;

    /// Ask the process to exit (SIGTERM on unix).
    fn request_terminate(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;
}

/// Starts worker processes.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(
        &self,
        executable: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches workers with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdProcessLauncher;

impl ProcessLauncher for StdProcessLauncher {
    fn spawn(
        &self,
        executable: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(executable);
        command.args(args).envs(env).stdin(Stdio::null());

        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());

        Ok(Box::new(ProcessHandle::spawn(command, &name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_info_display() {
        let normal = ExitInfo {
            code: Some(0),
            signal: None,
        };
        assert!(normal.success());
        assert_eq!(normal.to_string(), "exit code 0");

        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "signal 9");
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let result = StdProcessLauncher.spawn(
            Path::new("/definitely/not/a/worker"),
            &[],
            &BTreeMap::new(),
        );
        assert!(result.is_err());
    }
}
