// ABOUTME: Core data model for sandbox environments, statuses, and resource usage snapshots
// ABOUTME: Status strings from the runtime normalize leniently; unknown statuses become Error

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Lifecycle status of an environment.
///
/// Transitions only along creating → running → {stopping → stopped, error}
/// and stopped → running (restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl EnvironmentStatus {
    /// Lenient parse of a runtime-reported status string. Anything the engine
    /// does not recognize is treated as an error state rather than rejected.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "creating" | "created" | "starting" | "pending" => Self::Creating,
            "running" | "up" | "ready" => Self::Running,
            "stopping" | "removing" => Self::Stopping,
            "stopped" | "exited" | "paused" => Self::Stopped,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Ordering used when sorting selections by status:
    /// running > creating > stopped > error.
    pub fn sort_priority(&self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Creating => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
            Self::Error => 4,
        }
    }
}

// Deserialized through `parse` so a status string this engine does not
// recognize degrades to Error instead of failing the whole document.
impl<'de> Deserialize<'de> for EnvironmentStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A service running alongside an environment (database, cache, ...),
/// managed by an external collaborator and reported here read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInstance {
    pub name: String,
    pub running: bool,
    pub connection_string: Option<String>,
}

/// Ephemeral resource usage snapshot, recomputed on every poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceUsage {
    pub memory: MemoryUsage,
    pub cpu: CpuUsage,
    pub disk: DiskUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuUsage {
    pub pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl ResourceUsage {
    /// Zeroed snapshot used when a stats sample cannot be parsed.
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn memory_pct(&self) -> f64 {
        if self.memory.pct > 0.0 {
            self.memory.pct
        } else if self.memory.limit_bytes > 0 {
            (self.memory.used_bytes as f64 / self.memory.limit_bytes as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn disk_pct(&self) -> f64 {
        let total = self.disk.used_bytes + self.disk.available_bytes;
        if total > 0 {
            (self.disk.used_bytes as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// A provisioned isolated execution context identified by its unique,
/// immutable name. Owned and mutated exclusively by the lifecycle
/// orchestrator; all other components observe it read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    pub name: String,
    pub status: EnvironmentStatus,
    pub branch: String,
    pub base_image: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub working_directory: String,
    pub ports: Vec<u16>,
    pub services: Vec<ServiceInstance>,
    pub resource_usage: Option<ResourceUsage>,
    pub git_commit: Option<String>,
    pub env_vars: HashMap<String, String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            name: String::new(),
            status: EnvironmentStatus::Error,
            branch: "main".to_string(),
            base_image: String::new(),
            created_at: Utc::now(),
            last_activity_at: None,
            working_directory: "/workspace".to_string(),
            ports: Vec::new(),
            services: Vec::new(),
            resource_usage: None,
            git_commit: None,
            env_vars: HashMap::new(),
        }
    }
}

impl Environment {
    pub fn is_running(&self) -> bool {
        self.status == EnvironmentStatus::Running
    }

    /// Agent-type tag carried in the environment's variables, if any.
    pub fn agent_type(&self) -> Option<&str> {
        self.env_vars.get("AGENT_TYPE").map(String::as_str)
    }
}

/// Resource limits applied during the RESOURCE_LIMITING create step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// Service requested at environment creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
}

/// Validated creation request, supplied by the external config/CLI layer.
#[derive(Debug, Clone)]
pub struct CreateEnvironmentOptions {
    pub name: String,
    pub base_image: Option<String>,
    pub branch: Option<String>,
    pub working_directory: Option<String>,
    pub ports: Vec<u16>,
    pub env_vars: HashMap<String, String>,
    pub setup_commands: Vec<String>,
    pub services: Vec<ServiceSpec>,
    pub resources: Option<ResourceLimits>,
    /// Delete the partially-created environment when a create step fails.
    pub cleanup_on_failure: bool,
}

impl CreateEnvironmentOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_image: None,
            branch: None,
            working_directory: None,
            ports: Vec::new(),
            env_vars: HashMap::new(),
            setup_commands: Vec::new(),
            services: Vec::new(),
            resources: None,
            cleanup_on_failure: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_known_values() {
        assert_eq!(EnvironmentStatus::parse("running"), EnvironmentStatus::Running);
        assert_eq!(EnvironmentStatus::parse("Up"), EnvironmentStatus::Running);
        assert_eq!(EnvironmentStatus::parse("exited"), EnvironmentStatus::Stopped);
        assert_eq!(EnvironmentStatus::parse("creating"), EnvironmentStatus::Creating);
    }

    #[test]
    fn test_status_parse_unknown_normalizes_to_error() {
        assert_eq!(EnvironmentStatus::parse("zombie"), EnvironmentStatus::Error);
        assert_eq!(EnvironmentStatus::parse(""), EnvironmentStatus::Error);
    }

    #[test]
    fn test_status_sort_priority_ordering() {
        assert!(
            EnvironmentStatus::Running.sort_priority()
                < EnvironmentStatus::Creating.sort_priority()
        );
        assert!(
            EnvironmentStatus::Stopped.sort_priority() < EnvironmentStatus::Error.sort_priority()
        );
    }

    #[test]
    fn test_resource_usage_pct_derivation() {
        let usage = ResourceUsage {
            memory: MemoryUsage {
                used_bytes: 512,
                limit_bytes: 1024,
                pct: 0.0,
            },
            cpu: CpuUsage { pct: 12.5 },
            disk: DiskUsage {
                used_bytes: 30,
                available_bytes: 70,
            },
        };
        assert!((usage.memory_pct() - 50.0).abs() < f64::EPSILON);
        assert!((usage.disk_pct() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_environment_json_round_trip() {
        let env = Environment {
            name: "env-a".to_string(),
            status: EnvironmentStatus::Running,
            base_image: "ubuntu:24.04".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"baseImage\""));
        let back: Environment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "env-a");
        assert_eq!(back.status, EnvironmentStatus::Running);
    }

    #[test]
    fn test_environment_partial_json_fills_defaults() {
        let env: Environment = serde_json::from_str(r#"{"name": "env-b"}"#).unwrap();
        assert_eq!(env.name, "env-b");
        assert_eq!(env.branch, "main");
        assert_eq!(env.status, EnvironmentStatus::Error);
    }

    #[test]
    fn test_unknown_status_string_deserializes_to_error() {
        let env: Environment =
            serde_json::from_str(r#"{"name": "x", "status": "zombie"}"#).unwrap();
        assert_eq!(env.status, EnvironmentStatus::Error);
    }

    #[test]
    fn test_agent_type_tag() {
        let mut env = Environment::default();
        assert!(env.agent_type().is_none());
        env.env_vars
            .insert("AGENT_TYPE".to_string(), "claude".to_string());
        assert_eq!(env.agent_type(), Some("claude"));
    }
}
