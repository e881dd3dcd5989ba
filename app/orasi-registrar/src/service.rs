//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Scheduler driving reconciliation cycles
//!
//! A cycle runs on every refresh tick and whenever a topology change is
//! signalled. Cycles never overlap: the loop awaits each one before it
//! looks at the next trigger.

use crate::{
    catalog::HealthCheckWatcher,
    error::RegistrarError,
    reconciler::{CycleReport, Reconciler},
    types::ClusterSnapshot,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Source of cluster snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<ClusterSnapshot, RegistrarError>;
}

/// Reads a JSON cluster snapshot from disk on every cycle
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    async fn snapshot(&self) -> Result<ClusterSnapshot, RegistrarError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RegistrarError::Internal(format!(
                "Failed to read cluster state {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(serde_json::from_str(&content)?)
    }
}

/// Cloneable handle for signalling a running service
#[derive(Clone)]
pub struct ServiceHandle {
    topology_changed: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl ServiceHandle {
    /// Request an extra cycle as soon as the current one finishes
    pub fn notify_topology_change(&self) {
        self.topology_changed.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Periodic reconciliation service
pub struct RegistrarService {
    reconciler: Reconciler,
    source: Arc<dyn SnapshotSource>,
    health_checks: Arc<HealthCheckWatcher>,
    refresh_interval: Duration,
    handle: ServiceHandle,
}

impl RegistrarService {
    pub fn new(
        reconciler: Reconciler,
        source: Arc<dyn SnapshotSource>,
        health_checks: Arc<HealthCheckWatcher>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            source,
            health_checks,
            refresh_interval,
            handle: ServiceHandle {
                topology_changed: Arc::new(Notify::new()),
                shutdown: Arc::new(Notify::new()),
            },
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run one cycle; a snapshot that cannot be read skips the cycle
    pub async fn run_cycle(&mut self) -> Option<CycleReport> {
        let snapshot = match self.source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Skipping cycle, cluster state unavailable: {}", e);
                return None;
            }
        };

        let catalog = self.health_checks.snapshot().await;
        Some(self.reconciler.reload(&snapshot, &catalog).await)
    }

    /// Run until shutdown is requested
    pub async fn run(mut self) -> Result<(), RegistrarError> {
        info!(
            "Starting registrar loop with a {:?} refresh interval",
            self.refresh_interval
        );

        if let Err(e) = self.health_checks.refresh().await {
            warn!("Initial healthcheck template load failed: {}", e);
        }
        let watcher = self.health_checks.start();

        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let topology_changed = self.handle.topology_changed.clone();
        let shutdown = self.handle.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Registrar loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = topology_changed.notified() => {
                    debug!("Topology change signalled");
                    self.run_cycle().await;
                }
            }
        }

        watcher.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryRegistry;
    use crate::config::RegistrarConfig;
    use crate::types::Node;
    use std::io::Write;

    const STATE: &str = r#"{
        "leader": "master@10.0.0.1:5050",
        "nodes": [
            {"id": "S1", "hostname": "slave-1.local", "address": "10.0.0.1", "port": "5051"},
            {"id": "S2", "hostname": "slave-2.local", "address": "10.0.0.2", "port": "5051"}
        ],
        "frameworks": [{
            "name": "marathon",
            "hostname": "slave-2.local",
            "address": "10.0.0.2",
            "port": "8080",
            "active": true,
            "tasks": [{
                "id": "web.1",
                "node_id": "S1",
                "name": "web",
                "state": "TASK_RUNNING",
                "ports": ["31000"],
                "labels": {"ConsulHealthCheckKeys": "http"}
            }]
        }]
    }"#;

    fn service(registry: &InMemoryRegistry, source: Arc<dyn SnapshotSource>) -> RegistrarService {
        let reconciler = Reconciler::new(
            &RegistrarConfig::default(),
            Arc::new(registry.clone()),
            Arc::new(registry.clone()),
        )
        .unwrap();
        let watcher = Arc::new(HealthCheckWatcher::new(
            Arc::new(registry.clone()),
            Duration::from_secs(60),
        ));
        RegistrarService::new(reconciler, source, watcher, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_file_snapshot_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", STATE).unwrap();

        let snapshot = FileSnapshotSource::new(file.path()).snapshot().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.leader_host(), Some("10.0.0.1"));
        assert_eq!(snapshot.frameworks[0].tasks[0].ports, vec!["31000"]);
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_skips_cycle() {
        let registry = InMemoryRegistry::new();
        let source = Arc::new(FileSnapshotSource::new("/nonexistent/state.json"));
        let mut service = service(&registry, source);

        assert!(service.run_cycle().await.is_none());
        assert_eq!(service.reconciler().cycles(), 0);
    }

    #[tokio::test]
    async fn test_run_registers_and_stops_on_shutdown() {
        let registry = InMemoryRegistry::new();
        registry
            .put_kv(
                "healthchecks/http",
                r#"{"ID":"http","Name":"HTTP","HTTP":"http://{IP}:{PORT}/"}"#,
            )
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", STATE).unwrap();
        let service = service(&registry, Arc::new(FileSnapshotSource::new(file.path())));
        let handle = service.handle();
        let task = tokio::spawn(service.run());

        let mut registered = false;
        for _ in 0..100 {
            if registry.services("S1").await.len() == 2 && !registry.checks("S1").await.is_empty() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registered);

        handle.notify_topology_change();
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    struct Unreachable;

    #[async_trait]
    impl SnapshotSource for Unreachable {
        async fn snapshot(&self) -> Result<ClusterSnapshot, RegistrarError> {
            Ok(ClusterSnapshot {
                nodes: vec![Node {
                    id: "S1".to_string(),
                    hostname: "slave-1".to_string(),
                    address: "10.0.0.1".to_string(),
                    port: "5051".to_string(),
                    is_master: false,
                    is_leader: false,
                }],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_cycle_with_unreachable_agent_still_reports() {
        let registry = InMemoryRegistry::new();
        registry.set_unreachable("S1", true).await;
        let mut service = service(&registry, Arc::new(Unreachable));

        let report = service.run_cycle().await.unwrap();
        assert_eq!(
            report.outcome("S1"),
            Some(crate::reconciler::NodeOutcome::Skipped)
        );
    }
}
