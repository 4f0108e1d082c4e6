// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker process lifecycle.

use std::process::{Child, Command};
use std::time::{Duration, Instant};

use super::{ExitInfo, WorkerProcess};
use crate::error::{HostError, Result};

/// Handle to a running worker process.
pub struct ProcessHandle {
    child: Child,
    name: String,
    exit: Option<ExitInfo>,
}

impl ProcessHandle {
    /// Spawn a worker from a command.
    pub fn spawn(mut command: Command, name: &str) -> Result<Self> {
        let child = command.spawn().map_err(|e| {
            HostError::Launch(format!("Failed to spawn worker '{}': {}", name, e))
        })?;

        tracing::info!("Spawned worker '{}' with PID {}", name, child.id());

        Ok(Self {
            child,
            name: name.to_string(),
            exit: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.poll_exit(), Ok(None))
    }

    /// Poll until the process exits or `timeout` passes. Returns the exit
    /// status if it exited in time.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitInfo>> {
        let start = Instant::now();
        loop {
            if let Some(exit) = self.poll_exit()? {
                return Ok(Some(exit));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl WorkerProcess for ProcessHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll_exit(&mut self) -> Result<Option<ExitInfo>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = self.child.try_wait().map_err(|e| {
            HostError::Launch(format!(
                "Failed to check worker '{}' status: {}",
                self.name, e
            ))
        })?;
        if let Some(status) = status {
            let exit = ExitInfo::from(status);
            tracing::info!("Worker '{}' exited: {}", self.name, exit);
            self.exit = Some(exit);
        }
        Ok(self.exit)
    }

    #[cfg(unix)]
    fn request_terminate(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        tracing::info!("Requesting termination of worker '{}'", self.name);
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: plain signal delivery to our own unreaped child.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(HostError::Launch(format!(
                    "Failed to signal worker '{}': {}",
                    self.name, err
                )));
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_terminate(&mut self) -> Result<()> {
        // No polite signal available; termination is a kill.
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        tracing::warn!("Force killing worker '{}'", self.name);
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(HostError::Launch(format!(
                "Failed to kill worker '{}': {}",
                self.name, e
            ))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(
                "ProcessHandle for '{}' dropped while still running, killing",
                self.name
            );
            self.kill().ok();
            self.child.wait().ok();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_poll_exit_reports_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let mut handle = ProcessHandle::spawn(command, "sh").unwrap();

        let exit = handle.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!handle.is_running());
        // Cached after reaping.
        assert_eq!(handle.poll_exit().unwrap(), Some(exit));
    }

    #[test]
    fn test_request_terminate_sends_sigterm() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut handle = ProcessHandle::spawn(command, "sleep").unwrap();
        assert!(handle.is_running());

        handle.request_terminate().unwrap();
        let exit = handle.wait_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
    }

    #[test]
    fn test_kill_after_exit_is_noop() {
        let mut command = Command::new("true");
        command.arg("--");
        let mut handle = ProcessHandle::spawn(command, "true").unwrap();
        handle.wait_timeout(Duration::from_secs(5)).unwrap();
        handle.kill().unwrap();
    }
}
