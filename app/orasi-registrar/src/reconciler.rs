//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Reconciliation of desired records against the node agents
//!
//! One cycle runs discover, synthesize, register and cleanup. Register and
//! cleanup fan out one task per node and wait for all of them before the
//! next stage starts. Each task owns its node's state for the stage, so a
//! failure on one node never touches another.

use crate::{
    backend::{AgentConnector, CatalogApi, CatalogDeregistration, RegistryAgent},
    cache::{NodeRegistrationState, RegistrationCache},
    catalog::HealthCheckCatalog,
    config::RegistrarConfig,
    directory::AgentDirectory,
    error::RegistrarError,
    metrics::RegistrarMetrics,
    synthesizer::RecordSynthesizer,
    types::{ClusterSnapshot, NodeId},
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Result of one node in a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Both stages ran and the cache rotated
    Completed,
    /// No healthy agent, nothing was attempted
    Skipped,
    /// An agent call failed; the node is unhealthy until it reconnects
    Failed,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub outcome: NodeOutcome,
    pub error: Option<String>,
    pub registered: usize,
    pub deregistered: usize,
    pub catalog_fallbacks: usize,
    pub orphaned: usize,
    pub cache_dropped: bool,
}

impl NodeReport {
    fn new(outcome: NodeOutcome) -> Self {
        Self {
            outcome,
            error: None,
            registered: 0,
            deregistered: 0,
            catalog_fallbacks: 0,
            orphaned: 0,
            cache_dropped: false,
        }
    }

    fn fail(&mut self, error: &RegistrarError) {
        self.outcome = NodeOutcome::Failed;
        self.error.get_or_insert_with(|| error.to_string());
    }
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub nodes: BTreeMap<NodeId, NodeReport>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn outcome(&self, node_id: &str) -> Option<NodeOutcome> {
        self.nodes.get(node_id).map(|report| report.outcome)
    }

    pub fn registered(&self) -> usize {
        self.nodes.values().map(|report| report.registered).sum()
    }

    pub fn deregistered(&self) -> usize {
        self.nodes.values().map(|report| report.deregistered).sum()
    }

    pub fn catalog_fallbacks(&self) -> usize {
        self.nodes.values().map(|report| report.catalog_fallbacks).sum()
    }

    pub fn orphaned(&self) -> usize {
        self.nodes.values().map(|report| report.orphaned).sum()
    }

    pub fn count(&self, outcome: NodeOutcome) -> usize {
        self.nodes
            .values()
            .filter(|report| report.outcome == outcome)
            .count()
    }
}

/// Shared, read-only inputs of the per-node tasks
struct StageContext {
    catalog_api: Arc<dyn CatalogApi>,
    metrics: RegistrarMetrics,
    request_timeout: Duration,
    prefix: String,
    cache_refresh: u32,
    cache_only: bool,
}

enum Removal {
    Service(String),
    Check(String),
}

impl Removal {
    fn id(&self) -> &str {
        match self {
            Removal::Service(id) | Removal::Check(id) => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Removal::Service(_) => "service",
            Removal::Check(_) => "check",
        }
    }
}

impl StageContext {
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RegistrarError>>,
    ) -> Result<T, RegistrarError> {
        tokio::time::timeout(self.request_timeout, request).await?
    }

    /// Register the additions of one node, stopping at the first failure
    async fn register(
        &self,
        agent: &dyn RegistryAgent,
        state: &NodeRegistrationState,
        report: &mut NodeReport,
    ) -> Result<(), RegistrarError> {
        for record in state.service_additions() {
            self.call(agent.register_service(&record)).await?;
            trace!("Registered service {} on node {}", record.id, state.node_id);
            report.registered += 1;
            self.metrics.increment_registrations("service", 1);
        }

        for check in state.check_additions() {
            self.call(agent.register_check(&check)).await?;
            trace!("Registered check {} on node {}", check.id, state.node_id);
            report.registered += 1;
            self.metrics.increment_registrations("check", 1);
        }

        Ok(())
    }

    /// Remove stale records of one node
    ///
    /// Returns false once the agent failed a call; every later removal then
    /// goes to the catalog directly.
    async fn cleanup(
        &self,
        agent: &dyn RegistryAgent,
        state: &NodeRegistrationState,
        report: &mut NodeReport,
    ) -> bool {
        let mut agent_healthy = true;

        // Checks first, a removed service takes its checks along
        let removals = state
            .check_removals()
            .into_iter()
            .map(|check| Removal::Check(check.id))
            .chain(
                state
                    .service_removals()
                    .into_iter()
                    .map(|record| Removal::Service(record.id)),
            )
            .collect::<Vec<_>>();

        for removal in removals {
            self.remove(agent, state, removal, &mut agent_healthy, report)
                .await;
        }

        if agent_healthy && !self.cache_only && state.is_refresh_cycle(self.cache_refresh) {
            if let Err(e) = self.sweep(agent, state, &mut agent_healthy, report).await {
                warn!("Orphan sweep on node {} failed: {}", state.node_id, e);
                agent_healthy = false;
                report.fail(&e);
            }
        }

        agent_healthy
    }

    async fn remove(
        &self,
        agent: &dyn RegistryAgent,
        state: &NodeRegistrationState,
        removal: Removal,
        agent_healthy: &mut bool,
        report: &mut NodeReport,
    ) {
        if *agent_healthy {
            let result = match &removal {
                Removal::Service(id) => self.call(agent.deregister_service(id)).await,
                Removal::Check(id) => self.call(agent.deregister_check(id)).await,
            };

            match result {
                Ok(()) => {
                    trace!(
                        "Deregistered {} {} on node {}",
                        removal.kind(),
                        removal.id(),
                        state.node_id
                    );
                    report.deregistered += 1;
                    self.metrics.increment_deregistrations(removal.kind(), 1);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Agent of node {} failed to deregister {} {}: {}",
                        state.node_id,
                        removal.kind(),
                        removal.id(),
                        e
                    );
                    *agent_healthy = false;
                    report.fail(&e);
                }
            }
        }

        let request = match &removal {
            Removal::Service(id) => CatalogDeregistration::service(&state.hostname, id),
            Removal::Check(id) => CatalogDeregistration::check(&state.hostname, id),
        };

        match self.call(self.catalog_api.catalog_deregister(&request)).await {
            Ok(()) => {
                debug!(
                    "Deregistered {} {} of node {} through the catalog",
                    removal.kind(),
                    removal.id(),
                    state.hostname
                );
                report.catalog_fallbacks += 1;
                self.metrics.increment_catalog_fallbacks();
            }
            Err(e) => {
                error!(
                    "Failed to deregister {} {} of node {}, left orphaned: {}",
                    removal.kind(),
                    removal.id(),
                    state.hostname,
                    e
                );
                report.orphaned += 1;
                self.metrics.increment_orphaned_records();
            }
        }
    }

    /// Remove prefixed registrations the registrar no longer wants
    async fn sweep(
        &self,
        agent: &dyn RegistryAgent,
        state: &NodeRegistrationState,
        agent_healthy: &mut bool,
        report: &mut NodeReport,
    ) -> Result<(), RegistrarError> {
        let wanted_services: HashSet<&str> = state
            .current_services
            .iter()
            .map(|record| record.id.as_str())
            .collect();
        let wanted_checks: HashSet<&str> = state
            .current_checks
            .iter()
            .map(|check| check.id.as_str())
            .collect();

        let registered = self.call(agent.list_services(&self.prefix)).await?;
        let checks = self.call(agent.list_checks()).await?;
        let owned_prefix = format!("{}:", self.prefix);

        let orphans = checks
            .into_iter()
            .filter(|check| {
                check.service_id.starts_with(&owned_prefix)
                    && !wanted_checks.contains(check.id.as_str())
            })
            .map(|check| Removal::Check(check.id))
            .chain(
                registered
                    .into_iter()
                    .filter(|record| !wanted_services.contains(record.id.as_str()))
                    .map(|record| Removal::Service(record.id)),
            )
            .collect::<Vec<_>>();

        if !orphans.is_empty() {
            info!(
                "Removing {} untracked registrations from node {}",
                orphans.len(),
                state.node_id
            );
        }
        for orphan in orphans {
            self.remove(agent, state, orphan, agent_healthy, report).await;
        }

        Ok(())
    }
}

/// Drives reconciliation cycles
pub struct Reconciler {
    synthesizer: RecordSynthesizer,
    directory: AgentDirectory,
    cache: RegistrationCache,
    context: Arc<StageContext>,
    cycles: u64,
}

impl Reconciler {
    /// Create a reconciler; fails when the configuration is invalid
    pub fn new(
        config: &RegistrarConfig,
        connector: Arc<dyn AgentConnector>,
        catalog_api: Arc<dyn CatalogApi>,
    ) -> Result<Self, RegistrarError> {
        config.validate()?;

        let request_timeout = config.consul.request_timeout();
        Ok(Self {
            synthesizer: RecordSynthesizer::new(config),
            directory: AgentDirectory::new(connector, request_timeout),
            cache: RegistrationCache::new(),
            context: Arc::new(StageContext {
                catalog_api,
                metrics: RegistrarMetrics::new(),
                request_timeout,
                prefix: config.service_prefix.clone(),
                cache_refresh: config.cache_refresh,
                cache_only: config.cache_only,
            }),
            cycles: 0,
        })
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn cache(&self) -> &RegistrationCache {
        &self.cache
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one cycle against a snapshot
    ///
    /// Never fails as a whole: per-node errors are logged and reported.
    pub async fn reload(
        &mut self,
        snapshot: &ClusterSnapshot,
        catalog: &HealthCheckCatalog,
    ) -> CycleReport {
        let started = Instant::now();
        self.cycles += 1;
        debug!("Starting reconciliation cycle {}", self.cycles);

        self.directory.discover(&snapshot.nodes).await;

        let mut desired = self.synthesizer.synthesize(snapshot, catalog);
        for node in &snapshot.nodes {
            let (services, checks) = desired.take(&node.id);
            self.cache.ensure(node).set_current(services, checks);
        }

        let mut report = CycleReport {
            cycle: self.cycles,
            ..Default::default()
        };

        let registered = self.register_stage(snapshot, &mut report).await;
        self.cleanup_stage(registered, &mut report).await;

        report.duration = started.elapsed();
        self.context.metrics.record_cycle(report.duration);
        info!(
            "Cycle {} finished in {:?}: {} registered, {} deregistered, {} completed, {} skipped, {} failed nodes",
            report.cycle,
            report.duration,
            report.registered(),
            report.deregistered(),
            report.count(NodeOutcome::Completed),
            report.count(NodeOutcome::Skipped),
            report.count(NodeOutcome::Failed)
        );
        report
    }

    /// Register additions on every healthy node
    ///
    /// Returns the nodes that may proceed to cleanup along with their agents.
    async fn register_stage(
        &mut self,
        snapshot: &ClusterSnapshot,
        report: &mut CycleReport,
    ) -> Vec<(NodeId, Arc<dyn RegistryAgent>)> {
        let mut tasks = JoinSet::new();
        let mut dispatched = HashSet::new();

        for node in &snapshot.nodes {
            let Some(mut state) = self.cache.take(&node.id) else {
                continue;
            };

            let Some(agent) = self.directory.get(&node.id).await else {
                let agent_state = self.directory.state(&node.id).await;
                debug!("Skipping node {}, agent is {}", node.id, agent_state);
                state.healthy = false;
                self.cache.restore(state);
                report
                    .nodes
                    .insert(node.id.clone(), NodeReport::new(NodeOutcome::Skipped));
                continue;
            };

            state.healthy = true;
            dispatched.insert(node.id.clone());
            let context = self.context.clone();
            tasks.spawn(async move {
                let mut node_report = NodeReport::new(NodeOutcome::Completed);
                let result = context
                    .register(agent.as_ref(), &state, &mut node_report)
                    .await;
                (state, agent, node_report, result)
            });
        }

        let mut ready = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (mut state, agent, mut node_report, result) = match joined {
                Ok(output) => output,
                Err(e) => {
                    error!("Register task panicked: {}", e);
                    continue;
                }
            };
            dispatched.remove(&state.node_id);

            match result {
                Ok(()) => ready.push((state.node_id.clone(), agent)),
                Err(e) => {
                    error!("Registration on node {} failed: {}", state.node_id, e);
                    state.healthy = false;
                    node_report.fail(&e);
                    self.directory.mark_unhealthy(&state.node_id).await;
                    self.context.metrics.increment_node_failures("register");
                }
            }

            report.nodes.insert(state.node_id.clone(), node_report);
            self.cache.restore(state);
        }

        record_lost_nodes(dispatched, report);
        ready
    }

    /// Remove stale records and close the cycle on every registered node
    async fn cleanup_stage(
        &mut self,
        nodes: Vec<(NodeId, Arc<dyn RegistryAgent>)>,
        report: &mut CycleReport,
    ) {
        let mut tasks = JoinSet::new();
        let mut dispatched = HashSet::new();

        for (node_id, agent) in nodes {
            let Some(state) = self.cache.take(&node_id) else {
                continue;
            };
            let node_report = report
                .nodes
                .remove(&node_id)
                .unwrap_or_else(|| NodeReport::new(NodeOutcome::Completed));

            dispatched.insert(node_id);
            let context = self.context.clone();
            tasks.spawn(async move {
                let mut state = state;
                let mut node_report = node_report;
                let agent_healthy = context
                    .cleanup(agent.as_ref(), &state, &mut node_report)
                    .await;
                node_report.cache_dropped = state.complete_cycle(context.cache_refresh);
                (state, node_report, agent_healthy)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (mut state, node_report, agent_healthy) = match joined {
                Ok(output) => output,
                Err(e) => {
                    error!("Cleanup task panicked: {}", e);
                    continue;
                }
            };
            dispatched.remove(&state.node_id);

            if !agent_healthy {
                state.healthy = false;
                self.directory.mark_unhealthy(&state.node_id).await;
                self.context.metrics.increment_node_failures("cleanup");
            }
            if node_report.cache_dropped {
                debug!("Dropped registration cache of node {}", state.node_id);
                self.context.metrics.increment_cache_drops();
            }

            report.nodes.insert(state.node_id.clone(), node_report);
            self.cache.restore(state);
        }

        record_lost_nodes(dispatched, report);
    }
}

/// Nodes whose task died lose their state and start over next cycle
fn record_lost_nodes(lost: HashSet<NodeId>, report: &mut CycleReport) {
    for node_id in lost {
        let mut node_report = NodeReport::new(NodeOutcome::Failed);
        node_report.error = Some("node task aborted".to_string());
        report.nodes.insert(node_id, node_report);
    }
}
