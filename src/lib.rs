// ABOUTME: Lifecycle, monitoring, and recovery engine for containerized agent sandboxes
// ABOUTME: Drives an external container runtime exclusively through its command-line interface

pub mod config;
pub mod environment;
pub mod executor;
pub mod lifecycle;
pub mod manager;
pub mod monitor;
pub mod parser;
pub mod recovery;
pub mod selector;
pub mod sync;

pub use config::{default_sync_excludes, EngineConfig};
pub use environment::{
    CreateEnvironmentOptions, Environment, EnvironmentStatus, ResourceLimits, ResourceUsage,
    ServiceInstance, ServiceSpec,
};
pub use executor::{
    CommandExecutor, CommandOutput, CommandRunner, ExecOptions, ExecutorError, StreamHandle,
};
pub use lifecycle::{
    BestEffortReport, CleanupReport, CreateStep, LifecycleError, LifecycleOrchestrator,
};
pub use manager::{EnvironmentManager, ManagerError};
pub use monitor::{
    AlertSeverity, MonitorConfig, ResourceAlert, ResourceKind, ResourceMonitor,
    ResourceThresholds, UsageSnapshot, CRITICAL_CEILING_PCT,
};
pub use recovery::{
    ClassificationRule, ClassifiedError, DiagnosticCheck, DiagnosticsReport, ErrorCategory,
    ErrorRecoveryEngine, ErrorSeverity, RecoveryAction, RecoveryOutcome, RecoveryResult,
    RecoveryStep, RetryOperation,
};
pub use selector::{
    EnvironmentSelector, Selection, SelectionCriteria, SortOrder, CONFIDENCE_EXACT,
    CONFIDENCE_HEURISTIC, CONFIDENCE_INTERACTIVE, CONFIDENCE_SINGLE,
};
pub use sync::{ChangeKind, ChangedFile, FileSynchronizer, SyncError, SyncFileError, SyncReport};

use std::sync::Arc;

/// Bundle of all engine components wired against one runtime binary.
///
/// Convenience for embedders that want the whole engine; the individual
/// components compose freely for anything more custom.
pub struct Engine {
    pub orchestrator: Arc<LifecycleOrchestrator>,
    pub monitor: Arc<ResourceMonitor>,
    pub recovery: Arc<ErrorRecoveryEngine>,
    pub synchronizer: Arc<FileSynchronizer>,
    pub selector: Arc<EnvironmentSelector>,
    pub alerts: tokio::sync::mpsc::UnboundedReceiver<ResourceAlert>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let executor = Arc::new(CommandExecutor::new(&config));
        Self::with_runner(config, executor)
    }

    /// Build the engine against a custom command runner, for embedders that
    /// intercept or audit runtime invocations.
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let orchestrator = Arc::new(LifecycleOrchestrator::new(config.clone(), runner.clone()));
        let manager = orchestrator.manager();
        let (monitor, alerts) =
            ResourceMonitor::new(&config, manager.clone(), ResourceThresholds::default());
        let recovery = Arc::new(ErrorRecoveryEngine::new(&config, manager.clone(), runner));
        let synchronizer = Arc::new(FileSynchronizer::new(
            manager.clone(),
            config.sync_excludes.clone(),
        ));
        let selector = Arc::new(EnvironmentSelector::new(manager));

        Self {
            orchestrator,
            monitor: Arc::new(monitor),
            recovery,
            synchronizer,
            selector,
            alerts,
        }
    }
}
