// ABOUTME: Orchestrates environment creation, teardown, and recovery-adjacent housekeeping
// ABOUTME: Owns the in-memory registry; a failed create rolls back to no-environment when asked

use crate::config::EngineConfig;
use crate::environment::{
    CreateEnvironmentOptions, Environment, EnvironmentStatus, ServiceInstance,
};
use crate::executor::CommandRunner;
use crate::manager::{EnvironmentManager, ManagerError};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Environment '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Create step '{step}' failed for environment '{name}': {source}")]
    CreateStepFailed {
        name: String,
        step: CreateStep,
        #[source]
        source: ManagerError,
    },

    #[error("Setup command '{command}' failed in environment '{name}': {source}")]
    SetupCommand {
        name: String,
        command: String,
        #[source]
        source: ManagerError,
    },

    #[error("Environment '{name}' did not become ready within {waited_ms}ms")]
    ReadinessTimeout { name: String, waited_ms: u64 },

    #[error("Environment '{name}' entered an error state during startup")]
    StartupFailed { name: String },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Phases of environment creation, in order. Failure at any phase triggers
/// rollback when the request asked for cleanup on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStep {
    BaseCreate,
    Services,
    ResourceLimits,
}

impl std::fmt::Display for CreateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BaseCreate => "base-create",
            Self::Services => "services",
            Self::ResourceLimits => "resource-limits",
        };
        f.write_str(s)
    }
}

/// Outcome of a best-effort operation: the primary action succeeded, but
/// secondary steps may have been skipped. Callers decide whether warnings
/// matter; nothing here is retried automatically.
#[derive(Debug, Default, Clone)]
pub struct BestEffortReport {
    pub warnings: Vec<String>,
}

impl BestEffortReport {
    fn note(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Result of an orphan sweep. `found` lists every candidate; `deleted` only
/// those actually removed, which stays empty on a dry run.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub found: Vec<String>,
    pub deleted: Vec<String>,
    pub warnings: Vec<String>,
}

/// Drives environments through their lifecycle and owns the authoritative
/// in-memory registry. All mutation of [`Environment`] records happens here;
/// other components read through [`LifecycleOrchestrator::get`].
pub struct LifecycleOrchestrator {
    manager: Arc<EnvironmentManager>,
    config: EngineConfig,
    environments: Arc<RwLock<HashMap<String, Environment>>>,
}

impl LifecycleOrchestrator {
    pub fn new(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let manager = Arc::new(EnvironmentManager::new(&config, runner));
        Self {
            manager,
            config,
            environments: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn manager(&self) -> Arc<EnvironmentManager> {
        self.manager.clone()
    }

    /// Create an environment end to end: base, setup commands, services,
    /// resource limits, then wait for readiness.
    ///
    /// On failure, when the request set `cleanup_on_failure`, the partial
    /// environment is deleted and the registry ends up as if the create had
    /// never been attempted. Otherwise the record stays with Error status
    /// for inspection.
    pub async fn create_environment(
        &self,
        opts: CreateEnvironmentOptions,
    ) -> Result<Environment> {
        let name = opts.name.clone();
        {
            let registry = self.environments.read().await;
            if registry.contains_key(&name) {
                return Err(LifecycleError::AlreadyExists { name });
            }
        }

        let image = opts
            .base_image
            .clone()
            .unwrap_or_else(|| self.config.default_base_image.clone());
        let branch = opts.branch.clone().unwrap_or_else(|| "main".to_string());

        let mut record = Environment {
            name: name.clone(),
            status: EnvironmentStatus::Creating,
            branch: branch.clone(),
            base_image: image.clone(),
            working_directory: opts
                .working_directory
                .clone()
                .unwrap_or_else(|| self.config.default_working_directory.clone()),
            ports: opts.ports.clone(),
            env_vars: opts.env_vars.clone(),
            ..Default::default()
        };
        record.services = opts
            .services
            .iter()
            .map(|s| ServiceInstance {
                name: s.name.clone(),
                running: false,
                connection_string: None,
            })
            .collect();
        self.environments
            .write()
            .await
            .insert(name.clone(), record);

        match self.run_create_steps(&opts, &image, &branch).await {
            Ok(env) => {
                info!("Environment '{}' is ready", name);
                self.environments
                    .write()
                    .await
                    .insert(name.clone(), env.clone());
                Ok(env)
            }
            Err(err) => {
                error!("Creating environment '{}' failed: {}", name, err);
                if opts.cleanup_on_failure {
                    self.rollback(&name).await;
                } else if let Some(entry) = self.environments.write().await.get_mut(&name) {
                    entry.status = EnvironmentStatus::Error;
                }
                Err(err)
            }
        }
    }

    async fn run_create_steps(
        &self,
        opts: &CreateEnvironmentOptions,
        image: &str,
        branch: &str,
    ) -> Result<Environment> {
        let name = &opts.name;
        let step_err = |step: CreateStep| {
            let name = name.clone();
            move |source: ManagerError| LifecycleError::CreateStepFailed { name, step, source }
        };

        self.manager
            .create_base(name, image, branch)
            .await
            .map_err(step_err(CreateStep::BaseCreate))?;

        self.run_setup_commands(name, &opts.setup_commands).await?;

        for service in &opts.services {
            self.manager
                .service_add(name, service)
                .await
                .map_err(step_err(CreateStep::Services))?;
        }

        if let Some(limits) = &opts.resources {
            self.manager
                .apply_limits(name, limits)
                .await
                .map_err(step_err(CreateStep::ResourceLimits))?;
        }

        let mut env = self.wait_for_ready(name, None).await?;
        // Runtime output does not carry the request's variables or services
        env.env_vars = opts.env_vars.clone();
        if env.services.is_empty() {
            env.services = opts
                .services
                .iter()
                .map(|s| ServiceInstance {
                    name: s.name.clone(),
                    running: true,
                    connection_string: None,
                })
                .collect();
        }
        Ok(env)
    }

    /// Run setup commands inside an environment, in order. The first failing
    /// command aborts the rest.
    pub async fn run_setup_commands(&self, name: &str, commands: &[String]) -> Result<()> {
        for command in commands {
            info!("[{}] running setup command: {}", name, command);
            self.manager
                .exec_checked(name, command)
                .await
                .map_err(|source| LifecycleError::SetupCommand {
                    name: name.to_string(),
                    command: command.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Delete the partial environment and drop its registry record.
    /// Rollback is best-effort; a failed delete leaves an orphan that the
    /// next [`LifecycleOrchestrator::cleanup_orphans`] sweep picks up.
    async fn rollback(&self, name: &str) {
        warn!("Rolling back partially-created environment '{}'", name);
        if let Err(e) = self.manager.delete(name).await {
            warn!("Rollback delete of '{}' failed: {}", name, e);
        }
        self.environments.write().await.remove(name);
    }

    /// Poll the runtime until the environment reports running.
    ///
    /// The first check happens before any sleep, so an already-ready
    /// environment returns immediately. An Error status fails fast rather
    /// than burning the rest of the wait window. `max_wait` overrides the
    /// configured readiness window for this call.
    pub async fn wait_for_ready(
        &self,
        name: &str,
        max_wait: Option<Duration>,
    ) -> Result<Environment> {
        let start = Instant::now();
        let max_wait = max_wait.unwrap_or_else(|| self.config.readiness_max_wait());
        let poll = self.config.readiness_poll();

        loop {
            match self.manager.try_inspect(name).await? {
                Some(env) if env.is_running() => return Ok(env),
                Some(env) if env.status == EnvironmentStatus::Error => {
                    return Err(LifecycleError::StartupFailed {
                        name: name.to_string(),
                    });
                }
                _ => {}
            }

            if start.elapsed() >= max_wait {
                return Err(LifecycleError::ReadinessTimeout {
                    name: name.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Tear down an environment: detach services, stop, delete, then sweep
    /// for orphans left behind by earlier failures. Service detach and stop
    /// failures become warnings; only a failed delete aborts. The registry
    /// record is removed once the runtime confirms deletion.
    pub async fn delete_environment(&self, name: &str) -> Result<BestEffortReport> {
        let mut report = BestEffortReport::default();
        let services: Vec<String> = {
            let registry = self.environments.read().await;
            registry
                .get(name)
                .map(|env| env.services.iter().map(|s| s.name.clone()).collect())
                .unwrap_or_default()
        };

        if let Some(entry) = self.environments.write().await.get_mut(name) {
            entry.status = EnvironmentStatus::Stopping;
        }

        for service in &services {
            if let Err(e) = self.manager.service_remove(name, service).await {
                report.note(format!(
                    "Detaching service '{}' from '{}' failed: {}",
                    service, name, e
                ));
            }
        }
        if let Err(e) = self.manager.stop(name).await {
            report.note(format!("Stopping '{}' before delete failed: {}", name, e));
        }

        self.manager.delete(name).await?;
        self.environments.write().await.remove(name);
        info!("Environment '{}' deleted", name);

        match self.cleanup_orphans(false).await {
            Ok(sweep) => report.warnings.extend(sweep.warnings),
            Err(e) => report.note(format!(
                "Orphan sweep after deleting '{}' failed: {}",
                name, e
            )),
        }
        Ok(report)
    }

    /// Stop an environment without deleting it.
    pub async fn stop_environment(&self, name: &str) -> Result<()> {
        self.manager.stop(name).await?;
        if let Some(entry) = self.environments.write().await.get_mut(name) {
            entry.status = EnvironmentStatus::Stopped;
        }
        Ok(())
    }

    /// Restart an environment and wait for it to come back up.
    pub async fn restart_environment(&self, name: &str) -> Result<Environment> {
        self.manager.restart(name).await?;
        let env = self.wait_for_ready(name, None).await?;
        self.environments
            .write()
            .await
            .insert(name.to_string(), env.clone());
        Ok(env)
    }

    /// Read an environment from the registry. `None` means this orchestrator
    /// has no record of it; it may still exist in the runtime if created
    /// outside this process.
    pub async fn get(&self, name: &str) -> Option<Environment> {
        self.environments.read().await.get(name).cloned()
    }

    /// List environments, refreshing the registry from the runtime. The
    /// runtime is authoritative for status; request-time metadata such as
    /// environment variables survives the merge.
    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        let runtime_envs = self.manager.list().await?;
        let mut registry = self.environments.write().await;
        for env in &runtime_envs {
            match registry.get_mut(&env.name) {
                Some(existing) => {
                    existing.status = env.status;
                    existing.ports = env.ports.clone();
                    if env.git_commit.is_some() {
                        existing.git_commit = env.git_commit.clone();
                    }
                }
                None => {
                    registry.insert(env.name.clone(), env.clone());
                }
            }
        }
        Ok(registry.values().cloned().collect())
    }

    /// Record activity against an environment, for idle-based policies.
    pub async fn touch(&self, name: &str) {
        if let Some(entry) = self.environments.write().await.get_mut(name) {
            entry.last_activity_at = Some(Utc::now());
        }
    }

    /// Delete environments that are in an error state, or stopped and older
    /// than the configured orphan age. With `dry_run` the candidates are
    /// only reported. Each delete is independent; one failure does not stop
    /// the sweep.
    pub async fn cleanup_orphans(&self, dry_run: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.orphan_max_age_hours);

        let envs = self.manager.list().await?;
        for env in envs {
            let orphaned = match env.status {
                EnvironmentStatus::Error => true,
                EnvironmentStatus::Stopped => env.created_at < cutoff,
                _ => false,
            };
            if !orphaned {
                continue;
            }
            report.found.push(env.name.clone());
            if dry_run {
                info!(
                    "Orphan candidate '{}' (status {}), dry run",
                    env.name,
                    env.status.as_str()
                );
                continue;
            }

            info!(
                "Cleaning up orphaned environment '{}' (status {})",
                env.name,
                env.status.as_str()
            );
            match self.manager.delete(&env.name).await {
                Ok(()) => {
                    self.environments.write().await.remove(&env.name);
                    report.deleted.push(env.name);
                }
                Err(e) => {
                    let message = format!("Could not delete orphan '{}': {}", env.name, e);
                    warn!("{}", message);
                    report.warnings.push(message);
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::ScriptedRunner;
    use pretty_assertions::assert_eq;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            readiness_poll_ms: 10,
            readiness_max_wait_ms: 200,
            ..Default::default()
        }
    }

    fn orchestrator_with(runner: Arc<ScriptedRunner>) -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(fast_config(), runner)
    }

    fn running_json(name: &str) -> String {
        format!(r#"{{"name": "{name}", "status": "running"}}"#)
    }

    #[tokio::test]
    async fn test_create_environment_happy_path() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, "installed", ""); // setup command
        runner.push(0, &running_json("env-a"), ""); // readiness inspect
        let orch = orchestrator_with(runner.clone());

        let mut opts = CreateEnvironmentOptions::new("env-a");
        opts.setup_commands = vec!["npm install".to_string()];
        let env = orch.create_environment(opts).await.unwrap();

        assert_eq!(env.name, "env-a");
        assert!(env.is_running());
        assert!(orch.get("env-a").await.unwrap().is_running());
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back_to_no_environment() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(1, "", "setup exploded"); // setup command fails
        runner.push(0, "", ""); // rollback delete
        let orch = orchestrator_with(runner.clone());

        let mut opts = CreateEnvironmentOptions::new("env-a");
        opts.setup_commands = vec!["false".to_string()];
        let err = orch.create_environment(opts).await.unwrap_err();

        match err {
            LifecycleError::SetupCommand { command, .. } => {
                assert_eq!(command, "false")
            }
            other => panic!("unexpected error: {other}"),
        }
        // Rollback leaves no trace in the registry
        assert!(orch.get("env-a").await.is_none());
        // Last call was the rollback delete
        let last = runner.call(runner.call_count() - 1);
        assert_eq!(last[1], "delete");
    }

    #[tokio::test]
    async fn test_failed_create_without_cleanup_keeps_error_record() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(125, "", "image pull failed"); // apply fails
        let orch = orchestrator_with(runner.clone());

        let mut opts = CreateEnvironmentOptions::new("env-a");
        opts.cleanup_on_failure = false;
        orch.create_environment(opts).await.unwrap_err();

        let env = orch.get("env-a").await.unwrap();
        assert_eq!(env.status, EnvironmentStatus::Error);
        // No delete was issued
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected_before_any_runtime_call() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", "");
        runner.push(0, &running_json("env-a"), "");
        let orch = orchestrator_with(runner.clone());

        orch.create_environment(CreateEnvironmentOptions::new("env-a"))
            .await
            .unwrap();
        let calls_after_first = runner.call_count();

        let err = orch
            .create_environment(CreateEnvironmentOptions::new("env-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyExists { .. }));
        assert_eq!(runner.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn test_wait_for_ready_returns_immediately_when_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, &running_json("env-a"), "");
        let orch = orchestrator_with(runner.clone());

        let start = Instant::now();
        let env = orch.wait_for_ready("env-a", None).await.unwrap();
        assert!(env.is_running());
        // One inspect, no polling sleep
        assert_eq!(runner.call_count(), 1);
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_for_ready_polls_until_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, r#"{"name": "env-a", "status": "creating"}"#, "");
        runner.push(0, r#"{"name": "env-a", "status": "creating"}"#, "");
        runner.push(0, &running_json("env-a"), "");
        let orch = orchestrator_with(runner.clone());

        let env = orch.wait_for_ready("env-a", None).await.unwrap();
        assert!(env.is_running());
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_ready_fails_fast_on_error_status() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, r#"{"name": "env-a", "status": "dead"}"#, "");
        let orch = orchestrator_with(runner.clone());

        let start = Instant::now();
        let err = orch.wait_for_ready("env-a", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartupFailed { .. }));
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..64 {
            runner.push(0, r#"{"name": "env-a", "status": "creating"}"#, "");
        }
        let orch = orchestrator_with(runner);

        let err = orch.wait_for_ready("env-a", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_honors_per_call_window() {
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..64 {
            runner.push(0, r#"{"name": "env-a", "status": "creating"}"#, "");
        }
        let config = EngineConfig {
            readiness_poll_ms: 10,
            readiness_max_wait_ms: 60_000,
            ..Default::default()
        };
        let orch = LifecycleOrchestrator::new(config, runner);

        let start = Instant::now();
        let err = orch
            .wait_for_ready("env-a", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ReadinessTimeout { .. }));
        // The call gave up long before the configured minute
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_delete_reports_stop_failure_as_warning() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, &running_json("env-a"), ""); // readiness
        runner.push(1, "", "device busy"); // stop fails
        runner.push(0, "", ""); // delete succeeds
        let orch = orchestrator_with(runner);

        orch.create_environment(CreateEnvironmentOptions::new("env-a"))
            .await
            .unwrap();
        let report = orch.delete_environment("env-a").await.unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("device busy"));
        assert!(orch.get("env-a").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_detaches_services_then_stops_then_sweeps() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, "", ""); // service add
        runner.push(0, &running_json("env-a"), ""); // readiness
        runner.push(0, "", ""); // service remove
        runner.push(0, "", ""); // stop
        runner.push(0, "", ""); // delete
        runner.push(0, r#"[{"name": "leftover", "status": "dead"}]"#, ""); // sweep list
        runner.push(1, "", "device busy"); // sweep delete fails
        let orch = orchestrator_with(runner.clone());

        let mut opts = CreateEnvironmentOptions::new("env-a");
        opts.services = vec![crate::environment::ServiceSpec {
            name: "postgres".to_string(),
            image: "postgres:16".to_string(),
        }];
        orch.create_environment(opts).await.unwrap();

        let report = orch.delete_environment("env-a").await.unwrap();

        // Services detach before the environment stops, delete follows,
        // and the orphan sweep runs last
        assert_eq!(runner.call(3)[1..3], ["service", "remove"]);
        assert_eq!(runner.call(4)[1], "stop");
        assert_eq!(runner.call(5)[1], "delete");
        assert_eq!(runner.call(6)[1], "list");
        // Sweep failures fold into the teardown report
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("leftover"));
        assert!(orch.get("env-a").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_registry_record() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, &running_json("env-a"), ""); // readiness
        runner.push(0, "", ""); // stop
        runner.push(1, "", "device busy"); // delete fails
        let orch = orchestrator_with(runner);

        orch.create_environment(CreateEnvironmentOptions::new("env-a"))
            .await
            .unwrap();
        orch.delete_environment("env-a").await.unwrap_err();
        assert!(orch.get("env-a").await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_orphans_targets_error_and_old_stopped() {
        let runner = Arc::new(ScriptedRunner::new());
        let old = (Utc::now() - ChronoDuration::hours(48)).to_rfc3339();
        let fresh = Utc::now().to_rfc3339();
        let listing = format!(
            r#"[
                {{"name": "broken", "status": "dead"}},
                {{"name": "stale", "status": "stopped", "createdAt": "{old}"}},
                {{"name": "napping", "status": "stopped", "createdAt": "{fresh}"}},
                {{"name": "busy", "status": "running"}}
            ]"#
        );
        runner.push(0, &listing, ""); // list
        runner.push(0, "", ""); // delete broken
        runner.push(0, "", ""); // delete stale
        let orch = orchestrator_with(runner.clone());

        let report = orch.cleanup_orphans(false).await.unwrap();
        assert_eq!(report.found, vec!["broken", "stale"]);
        assert_eq!(report.deleted, vec!["broken", "stale"]);
        assert!(report.warnings.is_empty());
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_orphans_dry_run_deletes_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, r#"[{"name": "broken", "status": "dead"}]"#, "");
        let orch = orchestrator_with(runner.clone());

        let report = orch.cleanup_orphans(true).await.unwrap();
        assert_eq!(report.found, vec!["broken"]);
        assert!(report.deleted.is_empty());
        // Only the list call was made
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_orphans_continues_past_delete_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        let listing = r#"[
            {"name": "a", "status": "dead"},
            {"name": "b", "status": "dead"}
        ]"#;
        runner.push(0, listing, ""); // list
        runner.push(1, "", "device busy"); // delete a fails
        runner.push(0, "", ""); // delete b succeeds
        let orch = orchestrator_with(runner);

        let report = orch.cleanup_orphans(false).await.unwrap();
        assert_eq!(report.deleted, vec!["b"]);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_list_environments_merges_runtime_status() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, &running_json("env-a"), ""); // readiness
        runner.push(
            0,
            r#"[{"name": "env-a", "status": "stopped"}, {"name": "outsider", "status": "running"}]"#,
            "",
        ); // list
        let orch = orchestrator_with(runner);

        let mut opts = CreateEnvironmentOptions::new("env-a");
        opts.env_vars
            .insert("AGENT_TYPE".to_string(), "claude".to_string());
        orch.create_environment(opts).await.unwrap();

        let envs = orch.list_environments().await.unwrap();
        assert_eq!(envs.len(), 2);
        let env_a = envs.iter().find(|e| e.name == "env-a").unwrap();
        // Runtime wins on status, request metadata survives
        assert_eq!(env_a.status, EnvironmentStatus::Stopped);
        assert_eq!(env_a.agent_type(), Some("claude"));
    }

    #[tokio::test]
    async fn test_stop_environment_updates_registry() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, "", ""); // apply
        runner.push(0, &running_json("env-a"), ""); // readiness
        runner.push(0, "", ""); // stop
        let orch = orchestrator_with(runner);

        orch.create_environment(CreateEnvironmentOptions::new("env-a"))
            .await
            .unwrap();
        orch.stop_environment("env-a").await.unwrap();
        assert_eq!(
            orch.get("env-a").await.unwrap().status,
            EnvironmentStatus::Stopped
        );
    }
}
