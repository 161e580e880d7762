// ABOUTME: Classifies operation failures and drives automatic recovery with exponential backoff
// ABOUTME: Classification rules are ordered and instance-owned; first keyword match wins

use crate::config::EngineConfig;
use crate::executor::{CommandRunner, ExecOptions};
use crate::manager::EnvironmentManager;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Resource,
    Permission,
    Configuration,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Resource => "resource",
            Self::Permission => "permission",
            Self::Configuration => "configuration",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An action the engine can take, or suggest, in response to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    Cleanup,
    Restart,
    Recreate,
    Manual,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Cleanup => "cleanup",
            Self::Restart => "restart",
            Self::Recreate => "recreate",
            Self::Manual => "manual",
        }
    }
}

/// One step in a recovery plan. Only steps marked automatic are executed;
/// the rest are surfaced as suggestions for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStep {
    pub action: RecoveryAction,
    pub automatic: bool,
    pub max_attempts: u32,
}

impl RecoveryStep {
    pub fn auto(action: RecoveryAction, max_attempts: u32) -> Self {
        Self {
            action,
            automatic: true,
            max_attempts,
        }
    }

    pub fn suggested(action: RecoveryAction) -> Self {
        Self {
            action,
            automatic: false,
            max_attempts: 1,
        }
    }
}

/// A classification rule: the first rule whose keyword appears in the error
/// message (case-insensitive) determines the category and recovery plan.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub keywords: Vec<String>,
    pub plan: Vec<RecoveryStep>,
}

impl ClassificationRule {
    fn matches(&self, lowered_message: &str) -> bool {
        self.keywords.iter().any(|k| lowered_message.contains(k))
    }
}

/// Result of classifying an error message.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub message: String,
    pub plan: Vec<RecoveryStep>,
}

/// One executed recovery attempt, kept in per-operation history.
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    pub action: RecoveryAction,
    pub attempt: u32,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// How a recovery attempt concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// An automatic action succeeded after the given number of attempts.
    Recovered {
        action: RecoveryAction,
        attempts: u32,
    },
    /// The error class is not recoverable; operator intervention required.
    ManualRequired,
    /// Every automatic action in the plan was tried and failed.
    Exhausted,
}

#[derive(Debug)]
pub struct RecoveryResult {
    pub classification: ClassifiedError,
    pub outcome: RecoveryOutcome,
}

/// Retryable form of the failed operation, supplied by the caller when the
/// operation can be re-run safely.
pub type RetryOperation =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>> + Send + Sync>;

/// One check in a diagnostics run.
#[derive(Debug, Clone)]
pub struct DiagnosticCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticsReport {
    pub checks: Vec<DiagnosticCheck>,
}

impl DiagnosticsReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Classifies failures and executes automatic recovery.
///
/// Attempt history is keyed by `operation:environment` so repeated failures
/// of the same operation are visible across calls. Rules are owned by the
/// instance and can be replaced wholesale for domain-specific deployments.
pub struct ErrorRecoveryEngine {
    manager: Arc<EnvironmentManager>,
    runner: Arc<dyn CommandRunner>,
    rules: Vec<ClassificationRule>,
    base_delay: Duration,
    history: Arc<RwLock<HashMap<String, Vec<RecoveryRecord>>>>,
}

impl ErrorRecoveryEngine {
    pub fn new(
        config: &EngineConfig,
        manager: Arc<EnvironmentManager>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            manager,
            runner,
            rules: default_rules(),
            base_delay: config.recovery_base_delay(),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the classification rules. Order matters: earlier rules win.
    pub fn with_rules(mut self, rules: Vec<ClassificationRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Classify an error message against the rule list.
    pub fn classify(&self, message: &str) -> ClassifiedError {
        let lowered = message.to_ascii_lowercase();
        for rule in &self.rules {
            if rule.matches(&lowered) {
                return ClassifiedError {
                    category: rule.category,
                    severity: rule.severity,
                    recoverable: rule.recoverable,
                    message: message.to_string(),
                    plan: rule.plan.clone(),
                };
            }
        }
        ClassifiedError {
            category: ErrorCategory::Unknown,
            severity: ErrorSeverity::High,
            recoverable: false,
            message: message.to_string(),
            plan: vec![RecoveryStep::suggested(RecoveryAction::Manual)],
        }
    }

    /// Classify a failure and run the automatic steps of its recovery plan,
    /// stopping at the first success.
    ///
    /// `retry` re-runs the failed operation; without it, Retry steps are
    /// skipped. Non-automatic steps are never executed here.
    pub async fn attempt_recovery(
        &self,
        operation: &str,
        environment: &str,
        error_message: &str,
        retry: Option<RetryOperation>,
    ) -> RecoveryResult {
        let classification = self.classify(error_message);
        info!(
            "Recovery for '{}' on '{}': classified as {} ({:?})",
            operation,
            environment,
            classification.category.as_str(),
            classification.severity
        );

        if !classification.recoverable {
            return RecoveryResult {
                classification,
                outcome: RecoveryOutcome::ManualRequired,
            };
        }

        let key = format!("{}:{}", operation, environment);
        let automatic: Vec<RecoveryStep> = classification
            .plan
            .iter()
            .filter(|s| s.automatic)
            .copied()
            .collect();
        for step in automatic {
            for attempt in 1..=step.max_attempts {
                let delay = backoff_delay(self.base_delay, attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let success = self.execute_step(step.action, environment, retry.as_ref()).await;
                self.record(&key, step.action, attempt, success).await;

                if success {
                    info!(
                        "Recovery action '{}' for '{}' succeeded on attempt {}",
                        step.action.as_str(),
                        key,
                        attempt
                    );
                    return RecoveryResult {
                        classification,
                        outcome: RecoveryOutcome::Recovered {
                            action: step.action,
                            attempts: attempt,
                        },
                    };
                }
            }
            warn!(
                "Recovery action '{}' for '{}' exhausted its attempts",
                step.action.as_str(),
                key
            );
        }

        RecoveryResult {
            classification,
            outcome: RecoveryOutcome::Exhausted,
        }
    }

    async fn execute_step(
        &self,
        action: RecoveryAction,
        environment: &str,
        retry: Option<&RetryOperation>,
    ) -> bool {
        match action {
            RecoveryAction::Retry => match retry {
                Some(op) => match op().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Retry of operation on '{}' failed: {}", environment, e);
                        false
                    }
                },
                None => false,
            },
            RecoveryAction::Cleanup => {
                // Space pressure is the usual culprit for resource failures
                match self
                    .manager
                    .exec(environment, "rm -rf /tmp/* 2>/dev/null; apt-get clean 2>/dev/null; true")
                    .await
                {
                    Ok(output) => output.success(),
                    Err(e) => {
                        warn!("Cleanup inside '{}' failed: {}", environment, e);
                        false
                    }
                }
            }
            RecoveryAction::Restart => match self.manager.restart(environment).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Restart of '{}' failed: {}", environment, e);
                    false
                }
            },
            // Recreate and Manual are operator decisions
            RecoveryAction::Recreate | RecoveryAction::Manual => false,
        }
    }

    async fn record(&self, key: &str, action: RecoveryAction, attempt: u32, success: bool) {
        self.history
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(RecoveryRecord {
                action,
                attempt,
                success,
                at: Utc::now(),
            });
    }

    /// Recovery attempt history for one operation on one environment.
    pub async fn history(&self, operation: &str, environment: &str) -> Vec<RecoveryRecord> {
        self.history
            .read()
            .await
            .get(&format!("{}:{}", operation, environment))
            .cloned()
            .unwrap_or_default()
    }

    /// Check the host and runtime for the usual failure preconditions.
    /// Every check runs independently; one failing check never aborts the rest.
    pub async fn run_diagnostics(&self) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::default();

        report.checks.push(
            self.command_check(
                "runtime-version",
                &[self.manager.runtime_bin().to_string(), "--version".to_string()],
            )
            .await,
        );
        report.checks.push(
            self.command_check("git-version", &["git".to_string(), "--version".to_string()])
                .await,
        );
        report.checks.push(self.memory_check().await);
        report.checks.push(self.census_check().await);
        report.checks.push(
            self.command_check(
                "disk-space",
                &["df".to_string(), "-Pk".to_string(), ".".to_string()],
            )
            .await,
        );
        report.checks.push(
            self.command_check(
                "dns-resolution",
                &[
                    "getent".to_string(),
                    "hosts".to_string(),
                    "github.com".to_string(),
                ],
            )
            .await,
        );

        report
    }

    async fn command_check(&self, name: &str, argv: &[String]) -> DiagnosticCheck {
        let opts = ExecOptions::with_timeout(Duration::from_secs(10));
        match self.runner.run(argv, &opts).await {
            Ok(output) if output.success() => DiagnosticCheck {
                name: name.to_string(),
                passed: true,
                detail: output.stdout.lines().next().unwrap_or("").to_string(),
            },
            Ok(output) => DiagnosticCheck {
                name: name.to_string(),
                passed: false,
                detail: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
            },
            Err(e) => DiagnosticCheck {
                name: name.to_string(),
                passed: false,
                detail: e.to_string(),
            },
        }
    }

    async fn memory_check(&self) -> DiagnosticCheck {
        match available_memory_kb().await {
            Ok(available_kb) => DiagnosticCheck {
                name: "host-memory".to_string(),
                // Under 256 MiB of headroom, environment creation tends to fail
                passed: available_kb >= 256 * 1024,
                detail: format!("{} kB available", available_kb),
            },
            Err(e) => DiagnosticCheck {
                name: "host-memory".to_string(),
                passed: false,
                detail: format!("{:#}", e),
            },
        }
    }

    async fn census_check(&self) -> DiagnosticCheck {
        match self.manager.list().await {
            Ok(envs) => DiagnosticCheck {
                name: "environment-census".to_string(),
                passed: true,
                detail: format!("{} environments known to the runtime", envs.len()),
            },
            Err(e) => DiagnosticCheck {
                name: "environment-census".to_string(),
                passed: false,
                detail: e.to_string(),
            },
        }
    }
}

async fn available_memory_kb() -> anyhow::Result<u64> {
    use anyhow::Context;

    let contents = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;
    contents
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse::<u64>().ok())
        .context("no MemAvailable line in /proc/meminfo")
}

/// Delay before the given attempt: the first attempt is immediate, later
/// attempts double from the base. Attempt 2 waits `base`, attempt 3 `2*base`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt <= 1 {
        Duration::ZERO
    } else {
        base * 2u32.saturating_pow(attempt - 2)
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule {
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            recoverable: true,
            keywords: keywords(&[
                "connection refused",
                "econnrefused",
                "connection reset",
                "timed out",
                "timeout",
                "network is unreachable",
                "temporary failure in name resolution",
                "dns",
                "no route to host",
            ]),
            plan: vec![
                RecoveryStep::auto(RecoveryAction::Retry, 3),
                RecoveryStep::suggested(RecoveryAction::Manual),
            ],
        },
        ClassificationRule {
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::High,
            recoverable: true,
            keywords: keywords(&[
                "no space left",
                "disk full",
                "out of memory",
                "oom",
                "cannot allocate",
                "resource exhausted",
                "quota exceeded",
                "too many open files",
            ]),
            plan: vec![
                RecoveryStep::auto(RecoveryAction::Cleanup, 1),
                RecoveryStep::auto(RecoveryAction::Restart, 1),
                RecoveryStep::suggested(RecoveryAction::Manual),
            ],
        },
        ClassificationRule {
            category: ErrorCategory::Permission,
            severity: ErrorSeverity::High,
            recoverable: false,
            keywords: keywords(&[
                "permission denied",
                "access denied",
                "eacces",
                "operation not permitted",
                "unauthorized",
                "forbidden",
            ]),
            plan: vec![RecoveryStep::suggested(RecoveryAction::Manual)],
        },
        ClassificationRule {
            category: ErrorCategory::Configuration,
            severity: ErrorSeverity::Medium,
            recoverable: false,
            keywords: keywords(&[
                "invalid argument",
                "unknown flag",
                "invalid config",
                "missing required",
                "malformed",
                "parse error",
                "unrecognized option",
            ]),
            plan: vec![RecoveryStep::suggested(RecoveryAction::Manual)],
        },
        ClassificationRule {
            category: ErrorCategory::System,
            severity: ErrorSeverity::Critical,
            recoverable: true,
            keywords: keywords(&[
                "internal error",
                "runtime error",
                "daemon",
                "segfault",
                "panic",
                "killed by signal",
            ]),
            plan: vec![
                RecoveryStep::auto(RecoveryAction::Restart, 2),
                RecoveryStep::suggested(RecoveryAction::Recreate),
                RecoveryStep::suggested(RecoveryAction::Manual),
            ],
        },
    ]
}

fn keywords(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}
