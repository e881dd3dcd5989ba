//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Desired record synthesis
//!
//! Turns a cluster snapshot into the per-node service and health-check
//! records the registrar should publish. Synthesis is a pure function of
//! the snapshot, the configuration and one health-check catalog snapshot.
//!
//! Record ids:
//! - node: `<prefix>:<node id>`
//! - framework: `<prefix>:<framework name>`
//! - task: `<prefix>:<short hostname>:<task id>[:<port>]`

use crate::{
    catalog::HealthCheckCatalog,
    config::{IpSource, RegistrarConfig},
    error::RegistrarError,
    types::{
        short_hostname, ClusterSnapshot, Framework, HealthCheckRecord, Node, NodeId,
        ServiceRecord, Task, PORT_UNSET,
    },
};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Node role tags
pub const TAG_SLAVE: &str = "slave";
pub const TAG_MASTER: &str = "master";
pub const TAG_LEADER: &str = "leader";

/// Records every member node should carry after this cycle
#[derive(Debug, Clone, Default)]
pub struct DesiredRecords {
    pub services: HashMap<NodeId, Vec<ServiceRecord>>,
    pub checks: HashMap<NodeId, Vec<HealthCheckRecord>>,
}

impl DesiredRecords {
    /// Take the records of one node, leaving nothing behind
    pub fn take(&mut self, node_id: &str) -> (Vec<ServiceRecord>, Vec<HealthCheckRecord>) {
        (
            self.services.remove(node_id).unwrap_or_default(),
            self.checks.remove(node_id).unwrap_or_default(),
        )
    }

    pub fn service_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn check_count(&self) -> usize {
        self.checks.values().map(Vec::len).sum()
    }

    fn push_service(&mut self, node_id: &str, record: ServiceRecord) -> bool {
        let records = self.services.entry(node_id.to_string()).or_default();
        if records.iter().any(|existing| existing.id == record.id) {
            debug!(
                "Duplicate service id {} on node {}, keeping the first",
                record.id, node_id
            );
            return false;
        }
        records.push(record);
        true
    }

    fn push_check(&mut self, node_id: &str, record: HealthCheckRecord) {
        let records = self.checks.entry(node_id.to_string()).or_default();
        if !records.iter().any(|existing| existing.id == record.id) {
            records.push(record);
        }
    }
}

/// Builds desired records from cluster snapshots
#[derive(Debug, Clone)]
pub struct RecordSynthesizer {
    prefix: String,
    node_service_name: String,
    ip_sources: Vec<IpSource>,
    deferred: HashMap<String, String>,
    health_check_label: String,
}

impl RecordSynthesizer {
    pub fn new(config: &RegistrarConfig) -> Self {
        Self {
            prefix: config.service_prefix.clone(),
            node_service_name: config.node_service_name.clone(),
            ip_sources: config.ip_sources.clone(),
            deferred: config
                .deferred_labels
                .iter()
                .map(|deferred| (deferred.label.clone(), deferred.pending_marker.clone()))
                .collect(),
            health_check_label: config.health_check_label.clone(),
        }
    }

    /// Produce the desired records for every member of the snapshot
    pub fn synthesize(
        &self,
        snapshot: &ClusterSnapshot,
        catalog: &HealthCheckCatalog,
    ) -> DesiredRecords {
        let mut desired = DesiredRecords::default();
        for node in &snapshot.nodes {
            desired.services.entry(node.id.clone()).or_default();
            desired.checks.entry(node.id.clone()).or_default();
        }

        self.node_records(snapshot, &mut desired);

        for framework in &snapshot.frameworks {
            self.framework_record(snapshot, framework, &mut desired);

            for task in &framework.tasks {
                self.task_records(snapshot, task, catalog, &mut desired);
            }
        }

        trace!(
            "Synthesized {} services and {} checks for {} nodes",
            desired.service_count(),
            desired.check_count(),
            snapshot.nodes.len()
        );
        desired
    }

    fn node_records(&self, snapshot: &ClusterSnapshot, desired: &mut DesiredRecords) {
        let leader_host = snapshot.leader_host();
        let mut leader_attributed = false;

        for node in &snapshot.nodes {
            let port = match parse_port(&node.port) {
                Ok(port) => port,
                Err(e) => {
                    warn!("Skipping node record of {}: {}", node.id, e);
                    continue;
                }
            };

            let is_leader = node.is_leader || leader_host == Some(node.address.as_str());
            leader_attributed |= is_leader;

            let mut tags = vec![TAG_SLAVE.to_string(), node.short_hostname().to_string()];
            if node.is_master {
                tags.push(TAG_MASTER.to_string());
            }
            if is_leader {
                tags.push(TAG_LEADER.to_string());
            }

            let record = ServiceRecord::new(
                format!("{}:{}", self.prefix, node.id),
                &self.node_service_name,
                &node.address,
                port,
                tags,
            );
            desired.push_service(&node.id, record);
        }

        if let (Some(host), false) = (leader_host, leader_attributed) {
            debug!("Leader {} is not a cluster member, no agent to register on", host);
        }
    }

    fn framework_record(
        &self,
        snapshot: &ClusterSnapshot,
        framework: &Framework,
        desired: &mut DesiredRecords,
    ) {
        if !framework.active || framework.address.is_empty() {
            trace!("Ignoring framework {}", framework.name);
            return;
        }

        let Some(node) = owning_node(snapshot, framework) else {
            debug!(
                "No member node owns framework {} at {}, skipping",
                framework.name, framework.address
            );
            return;
        };

        let port = match parse_port(&framework.port) {
            Ok(port) => port,
            Err(e) => {
                warn!("Skipping framework record of {}: {}", framework.name, e);
                return;
            }
        };

        let record = ServiceRecord::new(
            format!("{}:{}", self.prefix, framework.name),
            &framework.name,
            &framework.address,
            port,
            Vec::<String>::new(),
        );
        desired.push_service(&node.id, record);
    }

    fn task_records(
        &self,
        snapshot: &ClusterSnapshot,
        task: &Task,
        catalog: &HealthCheckCatalog,
        desired: &mut DesiredRecords,
    ) {
        if !task.is_running() {
            return;
        }

        let Some(node) = snapshot.node(&task.node_id) else {
            debug!(
                "Task {} runs on unknown node {}, skipping",
                task.id, task.node_id
            );
            return;
        };

        let Some(address) = self.resolve_address(task, node) else {
            debug!("Address of task {} is not published yet, skipping", task.id);
            return;
        };

        let hostname = node.short_hostname();
        let base_id = format!("{}:{}:{}", self.prefix, hostname, task.id);

        let mut records = Vec::new();
        if task.ports.is_empty() {
            records.push(ServiceRecord::new(
                base_id,
                &task.name,
                address,
                PORT_UNSET,
                [hostname],
            ));
        } else {
            for raw_port in &task.ports {
                match parse_port(raw_port) {
                    Ok(port) => records.push(ServiceRecord::new(
                        format!("{}:{}", base_id, port),
                        &task.name,
                        address,
                        port,
                        [hostname],
                    )),
                    Err(e) => warn!("Skipping port of task {}: {}", task.id, e),
                }
            }
        }

        let check_names = self.health_check_names(task);
        for record in records {
            let service_id = record.id.clone();
            let port = record.port;
            if !desired.push_service(&node.id, record) {
                continue;
            }

            for name in &check_names {
                let definition = match catalog.lookup(name) {
                    Ok(definition) => definition,
                    Err(RegistrarError::LookupMiss(key)) => {
                        debug!("Healthcheck {} not found, skipping", key);
                        continue;
                    }
                    Err(e) => {
                        warn!("Skipping healthcheck {}: {}", name, e);
                        continue;
                    }
                };
                match definition.bind(&service_id, address, port) {
                    Ok(check) => desired.push_check(&node.id, check),
                    Err(e) => warn!("Skipping healthcheck {}: {}", name, e),
                }
            }
        }
    }

    fn health_check_names<'a>(&self, task: &'a Task) -> Vec<&'a str> {
        task.labels
            .get(&self.health_check_label)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    /// First address offered by the configured sources
    ///
    /// Returns `None` when a deferred label is still pending, in which case
    /// the task must not be published this cycle.
    fn resolve_address<'a>(&self, task: &'a Task, node: &'a Node) -> Option<&'a str> {
        for source in &self.ip_sources {
            let address = match source {
                IpSource::Fallback => Some(node.address.as_str()).filter(|a| !a.is_empty()),
                IpSource::Label(label) => task.address_from(&source.to_string()).or_else(|| {
                    task.labels
                        .get(label)
                        .map(String::as_str)
                        .filter(|a| !a.is_empty())
                }),
                _ => task.address_from(&source.to_string()),
            };

            if let Some(address) = address {
                trace!("Task {} resolved to {} via {}", task.id, address, source);
                return Some(address);
            }

            if let IpSource::Label(label) = source {
                if let Some(marker) = self.deferred.get(label) {
                    if task.labels.contains_key(marker) {
                        return None;
                    }
                }
            }
        }

        Some(node.address.as_str())
    }
}

fn parse_port(raw: &str) -> Result<u16, RegistrarError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(PORT_UNSET);
    }
    raw.parse()
        .map_err(|_| RegistrarError::PortParse(format!("Invalid port value {:?}", raw)))
}

/// Member node running the framework scheduler
fn owning_node<'a>(snapshot: &'a ClusterSnapshot, framework: &Framework) -> Option<&'a Node> {
    snapshot
        .nodes
        .iter()
        .find(|node| node.address == framework.address)
        .or_else(|| {
            let hostname = short_hostname(&framework.hostname);
            if hostname.is_empty() {
                return None;
            }
            snapshot
                .nodes
                .iter()
                .find(|node| node.short_hostname() == hostname)
        })
}
