// ABOUTME: Thin async wrapper mapping engine operations onto runtime CLI verbs
// ABOUTME: Detects not-found from stderr; delete and stop are idempotent against missing targets

use crate::config::EngineConfig;
use crate::environment::{Environment, ResourceLimits, ServiceSpec};
use crate::executor::{CommandOutput, CommandRunner, ExecOptions, ExecutorError};
use crate::parser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to create environment '{name}' (exit {exit_code}): {stderr}")]
    CreateFailed {
        name: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to delete environment '{name}' (exit {exit_code}): {stderr}")]
    DeleteFailed {
        name: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Environment '{name}' not found")]
    NotFound { name: String },

    #[error("Runtime command '{command}' failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Could not make sense of runtime output for '{command}'")]
    UnrecognizedOutput { command: String },

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Stderr fragments the runtime emits when a target does not exist.
/// Matching is case-insensitive and substring-based since the exact
/// phrasing varies between runtime versions.
const NOT_FOUND_MARKERS: &[&str] = &["not found", "no such", "does not exist"];

/// Exit code the runtime itself uses when it rejects an invocation, as
/// opposed to exit codes passed through from a command inside an
/// environment (126/127 and whatever the command returned).
const RUNTIME_ERROR_EXIT: i32 = 125;

pub fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Translates engine operations into invocations of the container runtime
/// binary. Holds no environment state of its own; the orchestrator above it
/// owns the registry.
pub struct EnvironmentManager {
    runner: Arc<dyn CommandRunner>,
    runtime_bin: String,
    stop_timeout_secs: u64,
    command_timeout: Duration,
}

impl EnvironmentManager {
    pub fn new(config: &EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            runtime_bin: config.runtime_bin.clone(),
            stop_timeout_secs: config.stop_timeout_secs,
            command_timeout: config.command_timeout(),
        }
    }

    fn argv(&self, parts: &[&str]) -> Vec<String> {
        std::iter::once(self.runtime_bin.clone())
            .chain(parts.iter().map(|s| s.to_string()))
            .collect()
    }

    async fn run(&self, argv: Vec<String>) -> Result<CommandOutput> {
        let opts = ExecOptions::with_timeout(self.command_timeout);
        Ok(self.runner.run(&argv, &opts).await?)
    }

    async fn run_checked(&self, argv: Vec<String>) -> Result<CommandOutput> {
        let output = self.run(argv.clone()).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ManagerError::CommandFailed {
                command: argv.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Create the base environment via `apply`. Called once per environment,
    /// before setup commands or services.
    pub async fn create_base(&self, name: &str, image: &str, branch: &str) -> Result<()> {
        info!("Creating base environment '{}' from '{}'", name, image);
        let argv = self.argv(&[
            "apply", "--name", name, "--image", image, "--branch", branch,
        ]);
        let output = self.run(argv).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ManagerError::CreateFailed {
                name: name.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Fetch a single environment. Not-found is an error here; callers that
    /// treat absence as normal use [`EnvironmentManager::try_inspect`].
    pub async fn inspect(&self, name: &str) -> Result<Environment> {
        self.try_inspect(name)
            .await?
            .ok_or_else(|| ManagerError::NotFound {
                name: name.to_string(),
            })
    }

    /// Fetch a single environment, mapping not-found to `None`.
    pub async fn try_inspect(&self, name: &str) -> Result<Option<Environment>> {
        let argv = self.argv(&["inspect", name]);
        let output = self.run(argv.clone()).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(ManagerError::CommandFailed {
                command: argv.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        parser::parse_environment(&output.stdout)
            .map(Some)
            .ok_or(ManagerError::UnrecognizedOutput {
                command: argv.join(" "),
            })
    }

    /// List all environments known to the runtime.
    pub async fn list(&self) -> Result<Vec<Environment>> {
        let output = self.run_checked(self.argv(&["list"])).await?;
        Ok(parser::parse_environments(&output.stdout))
    }

    /// Delete an environment. Deleting one that no longer exists succeeds,
    /// so retried rollbacks and concurrent cleanup do not trip over each other.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let output = self.run(self.argv(&["delete", name])).await?;
        if output.success() {
            info!("Deleted environment '{}'", name);
            return Ok(());
        }
        if is_not_found(&output.stderr) {
            debug!("Environment '{}' already gone, treating delete as success", name);
            return Ok(());
        }
        Err(ManagerError::DeleteFailed {
            name: name.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }

    /// Stop an environment with the configured grace timeout. Stopping an
    /// already-stopped or missing environment succeeds.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let timeout = self.stop_timeout_secs.to_string();
        let output = self
            .run(self.argv(&["stop", name, "--time", &timeout]))
            .await?;
        if output.success() || is_not_found(&output.stderr) {
            return Ok(());
        }
        let lowered = output.stderr.to_ascii_lowercase();
        if lowered.contains("already stopped") || lowered.contains("not running") {
            return Ok(());
        }
        Err(ManagerError::CommandFailed {
            command: format!("{} stop {}", self.runtime_bin, name),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }

    /// Run a shell command inside an environment. The exit code is reported
    /// in the returned output; a non-zero exit is not an error at this layer.
    ///
    /// Stdout, stderr, and the exit code pass through from the command
    /// inside the environment, so the not-found markers only apply when the
    /// exit code is the runtime's own rejection code. A `sh: foo: not found`
    /// from the inner shell stays a plain non-zero result.
    pub async fn exec(&self, name: &str, command: &str) -> Result<CommandOutput> {
        let argv = self.argv(&["exec", name, "sh", "-c", command]);
        let output = self.run(argv).await?;
        if output.exit_code == RUNTIME_ERROR_EXIT && is_not_found(&output.stderr) {
            return Err(ManagerError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(output)
    }

    /// Like [`EnvironmentManager::exec`] but any non-zero exit is an error.
    pub async fn exec_checked(&self, name: &str, command: &str) -> Result<CommandOutput> {
        let output = self.exec(name, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ManagerError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Fetch raw stats output for an environment. The monitor parses it
    /// leniently; this just surfaces whatever the runtime printed.
    pub async fn stats(&self, name: &str) -> Result<String> {
        let argv = self.argv(&["stats", name]);
        let output = self.run(argv.clone()).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Err(ManagerError::NotFound {
                    name: name.to_string(),
                });
            }
            return Err(ManagerError::CommandFailed {
                command: argv.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Attach a service (database, cache, ...) to an environment.
    pub async fn service_add(&self, name: &str, service: &ServiceSpec) -> Result<()> {
        info!(
            "Adding service '{}' ({}) to environment '{}'",
            service.name, service.image, name
        );
        self.run_checked(self.argv(&[
            "service",
            "add",
            name,
            "--service",
            &service.name,
            "--image",
            &service.image,
        ]))
        .await?;
        Ok(())
    }

    /// Detach a service from an environment. Removing a service that is not
    /// attached succeeds.
    pub async fn service_remove(&self, name: &str, service_name: &str) -> Result<()> {
        let output = self
            .run(self.argv(&["service", "remove", name, "--service", service_name]))
            .await?;
        if output.success() || is_not_found(&output.stderr) {
            Ok(())
        } else {
            Err(ManagerError::CommandFailed {
                command: format!("{} service remove {}", self.runtime_bin, name),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Apply resource limits via `update`.
    pub async fn apply_limits(&self, name: &str, limits: &ResourceLimits) -> Result<()> {
        let cpus = limits.cpu_cores.to_string();
        let memory = format!("{}m", limits.memory_mb);
        let disk = format!("{}g", limits.disk_gb);
        self.run_checked(self.argv(&[
            "update", name, "--cpus", &cpus, "--memory", &memory, "--disk", &disk,
        ]))
        .await?;
        Ok(())
    }

    /// Restart an environment: stop with grace, then exec a no-op to force
    /// the runtime to bring it back up, falling back to `apply` on rejection.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        let output = self.run(self.argv(&["start", name])).await?;
        if output.success() {
            return Ok(());
        }
        if is_not_found(&output.stderr) {
            return Err(ManagerError::NotFound {
                name: name.to_string(),
            });
        }
        warn!(
            "Restart of '{}' rejected (exit {}): {}",
            name,
            output.exit_code,
            output.stderr.trim()
        );
        Err(ManagerError::CommandFailed {
            command: format!("{} start {}", self.runtime_bin, name),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }

    pub fn runtime_bin(&self) -> &str {
        &self.runtime_bin
    }
}
