//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! In-memory registry backend
//!
//! Keeps every node's registrations in process. Used for dry runs and to
//! exercise the reconciler against agents that fail on demand.

use super::trait_def::{
    AgentConnector, CatalogApi, CatalogDeregistration, KvPair, KvStore, RegisteredCheck,
    RegistryAgent,
};
use crate::{
    error::RegistrarError,
    types::{HealthCheckRecord, Node, NodeId, ServiceRecord},
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Default)]
struct AgentRecords {
    services: BTreeMap<String, ServiceRecord>,
    checks: BTreeMap<String, HealthCheckRecord>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<NodeId, AgentRecords>,
    node_names: HashMap<String, NodeId>,
    unreachable: HashSet<NodeId>,
    failing_registrations: HashSet<NodeId>,
    failing_deregistrations: HashSet<NodeId>,
    catalog_down: bool,
    catalog_removals: Vec<CatalogDeregistration>,
    connects: HashMap<NodeId, usize>,
    kv: BTreeMap<String, Vec<u8>>,
}

impl RegistryState {
    fn check_reachable(&self, node_id: &str) -> Result<(), RegistrarError> {
        if self.unreachable.contains(node_id) {
            return Err(RegistrarError::Connection(format!(
                "Agent for node {} is unreachable",
                node_id
            )));
        }
        Ok(())
    }
}

/// In-process stand-in for a cluster of registry agents plus catalog and KV
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
    log_operations: bool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that logs every mutation at info level
    pub fn logging() -> Self {
        Self {
            state: Arc::default(),
            log_operations: true,
        }
    }

    pub async fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut state = self.state.write().await;
        if unreachable {
            state.unreachable.insert(node_id.to_string());
        } else {
            state.unreachable.remove(node_id);
        }
    }

    pub async fn fail_registrations(&self, node_id: &str, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing_registrations.insert(node_id.to_string());
        } else {
            state.failing_registrations.remove(node_id);
        }
    }

    pub async fn fail_deregistrations(&self, node_id: &str, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failing_deregistrations.insert(node_id.to_string());
        } else {
            state.failing_deregistrations.remove(node_id);
        }
    }

    pub async fn set_catalog_available(&self, available: bool) {
        self.state.write().await.catalog_down = !available;
    }

    pub async fn put_kv(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.state
            .write()
            .await
            .kv
            .insert(key.to_string(), value.into());
    }

    /// Services currently registered on the node's agent
    pub async fn services(&self, node_id: &str) -> Vec<ServiceRecord> {
        self.state
            .read()
            .await
            .agents
            .get(node_id)
            .map(|agent| agent.services.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Checks currently registered on the node's agent
    pub async fn checks(&self, node_id: &str) -> Vec<HealthCheckRecord> {
        self.state
            .read()
            .await
            .agents
            .get(node_id)
            .map(|agent| agent.checks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a service behind the registrar's back
    pub async fn insert_service(&self, node_id: &str, record: ServiceRecord) {
        self.state
            .write()
            .await
            .agents
            .entry(node_id.to_string())
            .or_default()
            .services
            .insert(record.id.clone(), record);
    }

    pub async fn catalog_removals(&self) -> Vec<CatalogDeregistration> {
        self.state.read().await.catalog_removals.clone()
    }

    pub async fn connect_count(&self, node_id: &str) -> usize {
        self.state
            .read()
            .await
            .connects
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Handle to one node's in-memory agent
pub struct InMemoryAgent {
    node_id: NodeId,
    state: Arc<RwLock<RegistryState>>,
    log_operations: bool,
}

#[async_trait]
impl RegistryAgent for InMemoryAgent {
    async fn register_service(&self, record: &ServiceRecord) -> Result<(), RegistrarError> {
        let mut state = self.state.write().await;
        state.check_reachable(&self.node_id)?;
        if state.failing_registrations.contains(&self.node_id) {
            return Err(RegistrarError::Registration(format!(
                "Agent for node {} rejected service {}",
                self.node_id, record.id
            )));
        }

        if self.log_operations {
            info!(
                "[dry-run] register service {} ({}:{}) on node {}",
                record.id, record.address, record.port, self.node_id
            );
        }
        state
            .agents
            .entry(self.node_id.clone())
            .or_default()
            .services
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistrarError> {
        let mut state = self.state.write().await;
        state.check_reachable(&self.node_id)?;
        if state.failing_deregistrations.contains(&self.node_id) {
            return Err(RegistrarError::Deregistration(format!(
                "Agent for node {} refused to remove service {}",
                self.node_id, service_id
            )));
        }

        if self.log_operations {
            info!(
                "[dry-run] deregister service {} on node {}",
                service_id, self.node_id
            );
        }
        if let Some(agent) = state.agents.get_mut(&self.node_id) {
            agent.services.remove(service_id);
            agent.checks.retain(|_, check| check.service_id != service_id);
        }
        Ok(())
    }

    async fn register_check(&self, record: &HealthCheckRecord) -> Result<(), RegistrarError> {
        let mut state = self.state.write().await;
        state.check_reachable(&self.node_id)?;
        if state.failing_registrations.contains(&self.node_id) {
            return Err(RegistrarError::Registration(format!(
                "Agent for node {} rejected check {}",
                self.node_id, record.id
            )));
        }

        if self.log_operations {
            info!(
                "[dry-run] register check {} ({}) on node {}",
                record.id,
                record.spec.template(),
                self.node_id
            );
        }
        state
            .agents
            .entry(self.node_id.clone())
            .or_default()
            .checks
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister_check(&self, check_id: &str) -> Result<(), RegistrarError> {
        let mut state = self.state.write().await;
        state.check_reachable(&self.node_id)?;
        if state.failing_deregistrations.contains(&self.node_id) {
            return Err(RegistrarError::Deregistration(format!(
                "Agent for node {} refused to remove check {}",
                self.node_id, check_id
            )));
        }

        if self.log_operations {
            info!(
                "[dry-run] deregister check {} on node {}",
                check_id, self.node_id
            );
        }
        if let Some(agent) = state.agents.get_mut(&self.node_id) {
            agent.checks.remove(check_id);
        }
        Ok(())
    }

    async fn list_services(&self, prefix: &str) -> Result<Vec<ServiceRecord>, RegistrarError> {
        let state = self.state.read().await;
        state.check_reachable(&self.node_id)?;
        Ok(state
            .agents
            .get(&self.node_id)
            .map(|agent| {
                agent
                    .services
                    .values()
                    .filter(|service| service.id.split(':').next() == Some(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_checks(&self) -> Result<Vec<RegisteredCheck>, RegistrarError> {
        let state = self.state.read().await;
        state.check_reachable(&self.node_id)?;
        Ok(state
            .agents
            .get(&self.node_id)
            .map(|agent| {
                agent
                    .checks
                    .values()
                    .map(|check| RegisteredCheck {
                        id: check.id.clone(),
                        name: check.name.clone(),
                        service_id: check.service_id.clone(),
                        status: "passing".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn liveness_probe(&self) -> Result<(), RegistrarError> {
        self.state.read().await.check_reachable(&self.node_id)
    }
}

#[async_trait]
impl AgentConnector for InMemoryRegistry {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RegistryAgent>, RegistrarError> {
        {
            let mut state = self.state.write().await;
            *state.connects.entry(node.id.clone()).or_insert(0) += 1;
            state
                .node_names
                .insert(node.short_hostname().to_string(), node.id.clone());
        }

        let agent = InMemoryAgent {
            node_id: node.id.clone(),
            state: self.state.clone(),
            log_operations: self.log_operations,
        };
        agent.liveness_probe().await?;
        Ok(Arc::new(agent))
    }
}

#[async_trait]
impl CatalogApi for InMemoryRegistry {
    async fn catalog_deregister(
        &self,
        request: &CatalogDeregistration,
    ) -> Result<(), RegistrarError> {
        let mut state = self.state.write().await;
        if state.catalog_down {
            return Err(RegistrarError::CatalogFallback(format!(
                "Catalog unavailable while removing entry of node {}",
                request.node
            )));
        }

        if let Some(node_id) = state.node_names.get(&request.node).cloned() {
            if let Some(agent) = state.agents.get_mut(&node_id) {
                if let Some(ref service_id) = request.service_id {
                    agent.services.remove(service_id);
                    agent.checks.retain(|_, check| &check.service_id != service_id);
                }
                if let Some(ref check_id) = request.check_id {
                    agent.checks.remove(check_id);
                }
            }
        }

        state.catalog_removals.push(request.clone());
        Ok(())
    }
}

#[async_trait]
impl KvStore for InMemoryRegistry {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, RegistrarError> {
        Ok(self
            .state
            .read()
            .await
            .kv
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            hostname: format!("{}.cluster", id.to_lowercase()),
            address: "10.0.0.1".to_string(),
            port: "5051".to_string(),
            is_master: false,
            is_leader: false,
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_to_connect() {
        let registry = InMemoryRegistry::new();
        registry.set_unreachable("S1", true).await;

        assert!(registry.connect(&node("S1")).await.is_err());
        assert!(registry.connect(&node("S2")).await.is_ok());
        assert_eq!(registry.connect_count("S1").await, 1);
    }

    #[tokio::test]
    async fn test_catalog_deregister_removes_by_node_name() {
        let registry = InMemoryRegistry::new();
        let agent = registry.connect(&node("S1")).await.unwrap();
        let record = ServiceRecord::new("p:S1".to_string(), "mesos", "10.0.0.1", 5051, ["slave"]);
        agent.register_service(&record).await.unwrap();

        registry
            .catalog_deregister(&CatalogDeregistration::service("s1", "p:S1"))
            .await
            .unwrap();

        assert!(registry.services("S1").await.is_empty());
        assert_eq!(registry.catalog_removals().await.len(), 1);
    }
}
