// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host and reactor configuration, loadable from `plughost.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_SOCKET_BUFFER_BYTES;
use crate::error::{HostError, Result};

/// Which shared-memory implementation new regions use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShmBackendKind {
    /// POSIX shm on unix, paging-file mappings on windows.
    #[default]
    Auto,
    Posix,
    /// Temp-dir files mapped with `mmap`.
    File,
    Win32,
}

/// Everything one [`PluginHost`](crate::PluginHost) needs to launch and
/// supervise its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Worker executable.
    pub launcher: PathBuf,
    /// Sent to the worker in `load_plugin`.
    pub plugin_file: String,
    /// Worker argv after the port.
    pub args: Vec<String>,
    /// Extra environment for the worker.
    pub env: BTreeMap<String, String>,
    /// Prefix for log lines; defaults to the launcher's file name.
    pub label: Option<String>,

    pub launch_timeout_secs: f64,
    pub lockup_timeout_secs: f64,
    pub blocked_timeout_secs: f64,
    pub shm_remove_grace_secs: f64,
    pub exit_timeout_secs: f64,
    pub sleep_time_secs: f64,

    /// Suspends launch, lockup and blocked timeouts while a debugger is attached.
    pub debug: bool,
    pub disable_timeout: bool,

    /// Message classes the worker must announce, on top of `internal`.
    pub required_classes: Vec<String>,
    pub shm_backend: ShmBackendKind,
    pub socket_buffer_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            launcher: PathBuf::new(),
            plugin_file: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            label: None,
            launch_timeout_secs: 8.0,
            lockup_timeout_secs: 15.0,
            blocked_timeout_secs: 60.0,
            shm_remove_grace_secs: 2.0,
            exit_timeout_secs: 2.0,
            sleep_time_secs: 0.01,
            debug: false,
            disable_timeout: false,
            required_classes: Vec::new(),
            shm_backend: ShmBackendKind::Auto,
            socket_buffer_bytes: DEFAULT_SOCKET_BUFFER_BYTES,
        }
    }
}

impl HostConfig {
    pub fn new(launcher: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            ..Self::default()
        }
    }

    pub fn with_plugin_file(mut self, plugin_file: impl Into<String>) -> Self {
        self.plugin_file = plugin_file.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_required_class(mut self, class: impl Into<String>) -> Self {
        self.required_classes.push(class.into());
        self
    }

    /// Label used in log lines.
    pub fn effective_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        self.launcher
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string())
    }

    pub fn launch_timeout(&self) -> Duration {
        secs(self.launch_timeout_secs)
    }

    pub fn lockup_timeout(&self) -> Duration {
        secs(self.lockup_timeout_secs)
    }

    pub fn blocked_timeout(&self) -> Duration {
        secs(self.blocked_timeout_secs)
    }

    pub fn shm_remove_grace(&self) -> Duration {
        secs(self.shm_remove_grace_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        secs(self.exit_timeout_secs)
    }

    pub fn sleep_time(&self) -> Duration {
        secs(self.sleep_time_secs)
    }

    /// Reject values that would make the state machine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.launcher.as_os_str().is_empty() {
            return Err(HostError::Configuration(
                "launcher executable is not set".to_string(),
            ));
        }
        let timeouts = [
            ("launch_timeout_secs", self.launch_timeout_secs),
            ("lockup_timeout_secs", self.lockup_timeout_secs),
            ("blocked_timeout_secs", self.blocked_timeout_secs),
            ("shm_remove_grace_secs", self.shm_remove_grace_secs),
            ("exit_timeout_secs", self.exit_timeout_secs),
            ("sleep_time_secs", self.sleep_time_secs),
        ];
        for (name, value) in timeouts {
            if !value.is_finite() || value < 0.0 {
                return Err(HostError::Configuration(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
            if value > MAX_TIMEOUT_SECS {
                return Err(HostError::Configuration(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_TIMEOUT_SECS, value
                )));
            }
        }
        if self.socket_buffer_bytes == 0 {
            return Err(HostError::Configuration(
                "socket_buffer_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Upper bound on any configured timeout: one year.
pub const MAX_TIMEOUT_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Clamp to a valid, non-negative duration of at most [`MAX_TIMEOUT_SECS`].
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value.min(MAX_TIMEOUT_SECS))
    } else {
        Duration::ZERO
    }
}

/// `now + timeout`, saturating at the furthest representable instant
/// instead of panicking on overflow.
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    if let Some(deadline) = now.checked_add(timeout) {
        return deadline;
    }
    let mut step = timeout;
    let mut deadline = now;
    while !step.is_zero() {
        match deadline.checked_add(step) {
            Some(next) => deadline = next,
            None => step /= 2,
        }
    }
    deadline
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Pump sockets on a dedicated thread instead of the caller's.
    pub use_read_thread: bool,
    /// Upper bound on a single poll wait.
    pub max_poll_timeout_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            use_read_thread: false,
            max_poll_timeout_ms: 100,
        }
    }
}

impl ReactorConfig {
    pub fn max_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.max_poll_timeout_ms.max(1))
    }
}

/// Top-level `plughost.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlughostConfig {
    pub reactor: ReactorConfig,
    pub host: HostConfig,
}

impl PlughostConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "plughost.toml";

    /// Load a config file. Errors if it is missing or cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HostError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            HostError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it is missing or
    /// unparseable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HostError::Configuration(format!("Failed to serialize config: {}", e)))
    }
}

/// Get the PLUGHOST_HOME directory path.
///
/// Resolution order:
/// 1. `PLUGHOST_HOME` environment variable
/// 2. `XDG_CONFIG_HOME/plughost`
/// 3. `~/.plughost`
///
/// Falls back to the temp dir when no home directory can be determined.
pub fn plughost_home() -> PathBuf {
    if let Ok(home) = std::env::var("PLUGHOST_HOME") {
        return PathBuf::from(home);
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("plughost");
    }

    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".plughost")
}

/// `<PLUGHOST_HOME>/plughost.toml`.
pub fn default_config_path() -> PathBuf {
    plughost_home().join(PlughostConfig::FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.launch_timeout(), Duration::from_secs(8));
        assert_eq!(config.lockup_timeout(), Duration::from_secs(15));
        assert_eq!(config.sleep_time(), Duration::from_millis(10));
        assert_eq!(config.socket_buffer_bytes, 64 * 1024);
        assert_eq!(config.shm_backend, ShmBackendKind::Auto);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: PlughostConfig = toml::from_str(
            r#"
            [reactor]
            use_read_thread = true

            [host]
            launcher = "/usr/bin/worker"
            lockup_timeout_secs = 3.5
            shm_backend = "file"
            required_classes = ["media"]
            "#,
        )
        .unwrap();

        assert!(config.reactor.use_read_thread);
        assert_eq!(config.reactor.max_poll_timeout_ms, 100);
        assert_eq!(config.host.lockup_timeout(), Duration::from_millis(3500));
        assert_eq!(config.host.launch_timeout_secs, 8.0);
        assert_eq!(config.host.shm_backend, ShmBackendKind::File);
        assert_eq!(config.host.effective_label(), "worker");
        config.host.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_negative_timeout() {
        let mut config = HostConfig::new("/bin/true");
        config.exit_timeout_secs = -1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exit_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_huge_timeout() {
        let mut config = HostConfig::new("/bin/true");
        config.lockup_timeout_secs = 1e19;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lockup_timeout_secs"));

        config.lockup_timeout_secs = MAX_TIMEOUT_SECS;
        config.validate().unwrap();

        // Unvalidated values still clamp instead of overflowing.
        assert_eq!(secs(1e19), Duration::from_secs_f64(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        let far = deadline_after(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(1_000_000));
    }

    #[test]
    fn test_load_and_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PlughostConfig::FILE_NAME);

        assert!(PlughostConfig::load(&path).is_err());
        assert_eq!(PlughostConfig::load_or_default(&path), PlughostConfig::default());

        let mut config = PlughostConfig::default();
        config.host = HostConfig::new("/opt/worker").with_label("w1").with_args(["--fast"]);
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(PlughostConfig::load(&path).unwrap(), config);

        std::fs::write(&path, "host = 12").unwrap();
        assert!(PlughostConfig::load(&path).is_err());
        assert_eq!(PlughostConfig::load_or_default(&path), PlughostConfig::default());
    }

    #[test]
    #[serial]
    fn test_plughost_home_override() {
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var("PLUGHOST_HOME", "/tmp/ph-home") };
        assert_eq!(plughost_home(), PathBuf::from("/tmp/ph-home"));
        assert_eq!(default_config_path(), PathBuf::from("/tmp/ph-home/plughost.toml"));
        unsafe { std::env::remove_var("PLUGHOST_HOME") };
    }
}
