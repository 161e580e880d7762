// ABOUTME: Background resource monitoring with per-environment polling tasks and snapshot history
// ABOUTME: Sampling never fails the caller; unparseable stats degrade to a zeroed snapshot

use crate::config::EngineConfig;
use crate::environment::ResourceUsage;
use crate::manager::EnvironmentManager;
use crate::parser;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hard ceiling above which any resource is critical, regardless of the
/// configured thresholds. A 95% warning threshold still alerts at 90%.
pub const CRITICAL_CEILING_PCT: f64 = 90.0;

/// Snapshots retained per environment; when full, the oldest block is pruned.
const MAX_SNAPSHOTS: usize = 1000;
const PRUNE_BLOCK: usize = 100;

/// Warning thresholds as percentages of capacity.
#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub memory_pct: f64,
    pub cpu_pct: f64,
    pub disk_pct: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_pct: 80.0,
            cpu_pct: 80.0,
            disk_pct: 80.0,
        }
    }
}

/// Per-environment monitoring parameters. Each call to
/// [`ResourceMonitor::start_monitoring`] takes its own, so environments can
/// be watched at different cadences and sensitivities.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub thresholds: ResourceThresholds,
}

impl MonitorConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            interval: config.monitor_interval(),
            thresholds: ResourceThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Disk => "disk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold crossing observed on one poll. Alerts are advisory; the
/// monitor never acts on an environment itself.
#[derive(Debug, Clone)]
pub struct ResourceAlert {
    pub environment: String,
    pub resource: ResourceKind,
    pub pct: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub at: DateTime<Utc>,
}

/// Point-in-time usage sample.
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub usage: ResourceUsage,
    pub taken_at: DateTime<Utc>,
}

/// Polls environment resource usage on an interval, keeps bounded history,
/// and emits alerts when thresholds are crossed.
///
/// Each monitored environment gets its own polling task; starting an
/// already-monitored environment replaces its task.
pub struct ResourceMonitor {
    manager: Arc<EnvironmentManager>,
    thresholds: ResourceThresholds,
    interval: Duration,
    tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    history: Arc<RwLock<HashMap<String, Vec<UsageSnapshot>>>>,
    alert_tx: mpsc::UnboundedSender<ResourceAlert>,
}

impl ResourceMonitor {
    pub fn new(
        config: &EngineConfig,
        manager: Arc<EnvironmentManager>,
        thresholds: ResourceThresholds,
    ) -> (Self, mpsc::UnboundedReceiver<ResourceAlert>) {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            manager,
            thresholds,
            interval: config.monitor_interval(),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            alert_tx,
        };
        (monitor, alert_rx)
    }

    /// Sample current usage for an environment. Never errors: a failed or
    /// unparseable stats call yields a zeroed snapshot so monitoring loops
    /// and status displays stay alive.
    pub async fn get_usage(&self, name: &str) -> ResourceUsage {
        match self.manager.stats(name).await {
            Ok(raw) => parser::parse_usage(&raw).unwrap_or_else(|| {
                debug!("Stats output for '{}' was unparseable, reporting zeroes", name);
                ResourceUsage::zeroed()
            }),
            Err(e) => {
                debug!("Stats call for '{}' failed, reporting zeroes: {}", name, e);
                ResourceUsage::zeroed()
            }
        }
    }

    /// Sample, record, and evaluate one poll for an environment.
    pub async fn check(&self, name: &str) -> ResourceUsage {
        let usage = self.get_usage(name).await;
        record_snapshot(&self.history, name, usage.clone()).await;
        for alert in evaluate(name, &usage, &self.thresholds) {
            if alert.severity == AlertSeverity::Critical {
                warn!(
                    "Environment '{}' {} at {:.1}% (critical)",
                    name,
                    alert.resource.as_str(),
                    alert.pct
                );
            }
            let _ = self.alert_tx.send(alert);
        }
        usage
    }

    /// Instance defaults, for callers without per-environment needs.
    pub fn default_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.interval,
            thresholds: self.thresholds,
        }
    }

    /// Start a background polling task for an environment with its own
    /// interval and thresholds. Replaces any existing task for the same name.
    pub async fn start_monitoring(&self, name: &str, config: MonitorConfig) {
        let name = name.to_string();
        let manager = self.manager.clone();
        let MonitorConfig {
            interval,
            thresholds,
        } = config;
        let history = self.history.clone();
        let alert_tx = self.alert_tx.clone();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let usage = match manager.stats(&task_name).await {
                    Ok(raw) => parser::parse_usage(&raw).unwrap_or_else(ResourceUsage::zeroed),
                    Err(e) => {
                        debug!("Monitor poll for '{}' failed: {}", task_name, e);
                        ResourceUsage::zeroed()
                    }
                };
                record_snapshot(&history, &task_name, usage.clone()).await;
                for alert in evaluate(&task_name, &usage, &thresholds) {
                    if alert_tx.send(alert).is_err() {
                        return;
                    }
                }
            }
        });

        if let Some(old) = self.tasks.write().await.insert(name.clone(), handle) {
            old.abort();
        }
        info!("Started resource monitoring for '{}'", name);
    }

    /// Stop the polling task for an environment. History is kept.
    pub async fn stop_monitoring(&self, name: &str) {
        if let Some(handle) = self.tasks.write().await.remove(name) {
            handle.abort();
            info!("Stopped resource monitoring for '{}'", name);
        }
    }

    /// Stop all polling tasks.
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.write().await;
        for (name, handle) in tasks.drain() {
            handle.abort();
            debug!("Stopped resource monitoring for '{}'", name);
        }
    }

    pub async fn is_monitoring(&self, name: &str) -> bool {
        self.tasks.read().await.contains_key(name)
    }

    /// Recorded snapshots for an environment, oldest first.
    pub async fn history(&self, name: &str) -> Vec<UsageSnapshot> {
        self.history
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent `limit` snapshots for an environment, oldest first.
    pub async fn recent_snapshots(&self, name: &str, limit: usize) -> Vec<UsageSnapshot> {
        self.history
            .read()
            .await
            .get(name)
            .map(|snaps| {
                let start = snaps.len().saturating_sub(limit);
                snaps[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub async fn latest(&self, name: &str) -> Option<UsageSnapshot> {
        self.history
            .read()
            .await
            .get(name)
            .and_then(|snaps| snaps.last().cloned())
    }

    /// Drop recorded history for an environment, typically after deletion.
    pub async fn forget(&self, name: &str) {
        self.history.write().await.remove(name);
    }

    /// Try to free space inside an environment by clearing well-known caches.
    /// Every step is best-effort; failures are reported but never propagate.
    pub async fn optimize(&self, name: &str) -> Vec<String> {
        const CLEANUP_COMMANDS: &[&str] = &[
            "rm -rf /tmp/* 2>/dev/null",
            "npm cache clean --force 2>/dev/null",
            "pip cache purge 2>/dev/null",
            "apt-get clean 2>/dev/null",
        ];

        let mut warnings = Vec::new();
        for command in CLEANUP_COMMANDS {
            match self.manager.exec(name, command).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!(
                        "Optimize step '{}' on '{}' exited {} (ignored)",
                        command, name, output.exit_code
                    );
                }
                Err(e) => {
                    let message = format!("Optimize step '{}' on '{}' failed: {}", command, name, e);
                    debug!("{}", message);
                    warnings.push(message);
                }
            }
        }
        info!("Ran cache cleanup in '{}'", name);
        warnings
    }
}

async fn record_snapshot(
    history: &Arc<RwLock<HashMap<String, Vec<UsageSnapshot>>>>,
    name: &str,
    usage: ResourceUsage,
) {
    let mut map = history.write().await;
    let snapshots = map.entry(name.to_string()).or_default();
    snapshots.push(UsageSnapshot {
        usage,
        taken_at: Utc::now(),
    });
    prune_history(snapshots);
}

fn prune_history(snapshots: &mut Vec<UsageSnapshot>) {
    if snapshots.len() > MAX_SNAPSHOTS {
        snapshots.drain(..PRUNE_BLOCK);
    }
}

fn evaluate(name: &str, usage: &ResourceUsage, thresholds: &ResourceThresholds) -> Vec<ResourceAlert> {
    let readings = [
        (ResourceKind::Memory, usage.memory_pct(), thresholds.memory_pct),
        (ResourceKind::Cpu, usage.cpu.pct, thresholds.cpu_pct),
        (ResourceKind::Disk, usage.disk_pct(), thresholds.disk_pct),
    ];

    readings
        .into_iter()
        .filter(|(_, pct, threshold)| *pct >= *threshold || *pct >= CRITICAL_CEILING_PCT)
        .map(|(resource, pct, threshold)| ResourceAlert {
            environment: name.to_string(),
            resource,
            pct,
            threshold,
            severity: if pct >= CRITICAL_CEILING_PCT {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            },
            at: Utc::now(),
        })
        .collect()
}
