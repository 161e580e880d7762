// ABOUTME: Engine configuration with defaults for the runtime binary, timeouts, and sync excludes
// ABOUTME: Supplied pre-validated by the embedding CLI/config layer; Default carries documented values

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the lifecycle engine.
///
/// The embedding application (CLI or server) is responsible for loading and
/// validating this; the engine assumes well-formed input and surfaces runtime
/// rejections instead of re-validating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container runtime binary invoked for every operation
    pub runtime_bin: String,
    /// Default base image for new environments
    pub default_base_image: String,
    /// Default working directory inside an environment
    pub default_working_directory: String,
    /// Interval between readiness polls, in milliseconds
    pub readiness_poll_ms: u64,
    /// Maximum time to wait for an environment to become ready, in milliseconds
    pub readiness_max_wait_ms: u64,
    /// Graceful stop timeout handed to the runtime, in seconds
    pub stop_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for host subprocesses, in milliseconds
    pub kill_grace_ms: u64,
    /// Default timeout for a single runtime invocation, in milliseconds
    pub command_timeout_ms: u64,
    /// Default resource monitoring interval, in milliseconds
    pub monitor_interval_ms: u64,
    /// Base delay for recovery retry backoff, in milliseconds
    pub recovery_base_delay_ms: u64,
    /// Age after which a stopped environment counts as an orphan, in hours
    pub orphan_max_age_hours: i64,
    /// Patterns excluded from file sync by default
    pub sync_excludes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "cu".to_string(),
            default_base_image: "ubuntu:24.04".to_string(),
            default_working_directory: "/workspace".to_string(),
            readiness_poll_ms: 2_000,
            readiness_max_wait_ms: 120_000,
            stop_timeout_secs: 10,
            kill_grace_ms: 5_000,
            command_timeout_ms: 60_000,
            monitor_interval_ms: 30_000,
            recovery_base_delay_ms: 500,
            orphan_max_age_hours: 24,
            sync_excludes: default_sync_excludes(),
        }
    }
}

impl EngineConfig {
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn readiness_max_wait(&self) -> Duration {
        Duration::from_millis(self.readiness_max_wait_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn recovery_base_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_base_delay_ms)
    }
}

/// VCS metadata, dependency caches, build output, and secret-looking files
/// are never synced unless the caller overrides the exclude list.
pub fn default_sync_excludes() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "node_modules",
        "target",
        "vendor",
        "dist",
        "build",
        ".next",
        "__pycache__",
        ".venv",
        ".env",
        ".env.local",
        "*.pem",
        "*.key",
        "id_rsa",
        ".DS_Store",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.readiness_poll(), Duration::from_secs(2));
        assert!(config.readiness_max_wait() > config.readiness_poll());
        assert!(config.sync_excludes.iter().any(|p| p == ".git"));
        assert!(config.sync_excludes.iter().any(|p| p == "*.pem"));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"runtime_bin": "podman"}"#).unwrap();
        assert_eq!(config.runtime_bin, "podman");
        assert_eq!(config.readiness_poll_ms, 2_000);
    }
}
