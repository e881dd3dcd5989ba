//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Common types for Orasi Registrar
//!
//! The cluster snapshot types are produced by the state parser and are
//! read-only for the duration of one reconciliation cycle. The record types
//! are what the registrar publishes on each node's registry agent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Cluster node identifier
pub type NodeId = String;

/// Port value used for records that do not expose a port
pub const PORT_UNSET: u16 = 0;

/// Point-in-time view of the cluster topology
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Leader address, either `name@host:port` or `host:port`
    #[serde(default)]
    pub leader: String,

    /// Cluster members in the order reported by the leader
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Registered frameworks
    #[serde(default)]
    pub frameworks: Vec<Framework>,
}

impl ClusterSnapshot {
    /// Host part of the leader address
    pub fn leader_host(&self) -> Option<&str> {
        let without_name = match self.leader.split_once('@') {
            Some((_, rest)) => rest,
            None => self.leader.as_str(),
        };
        let host = without_name
            .split_once(':')
            .map_or(without_name, |(host, _)| host);
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    /// Find a member by id
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }
}

/// Cluster node hosting a registry agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub address: String,

    /// Port as reported by the cluster state; validated during synthesis
    #[serde(default)]
    pub port: String,

    #[serde(default)]
    pub is_master: bool,

    #[serde(default)]
    pub is_leader: bool,
}

impl Node {
    /// Hostname without the domain part
    pub fn short_hostname(&self) -> &str {
        short_hostname(&self.hostname)
    }
}

/// Strip the domain from a fully qualified hostname
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Framework registered with the cluster leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Framework {
    pub name: String,

    #[serde(default)]
    pub hostname: String,

    /// Resolved address; empty when the framework host could not be resolved
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub port: String,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_LOST")]
    Lost,
}

/// Task running on a cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub node_id: NodeId,
    pub name: String,
    pub state: TaskState,

    /// Declared ports in declaration order
    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Candidate addresses keyed by source (`mesos`, `docker`, `label:<name>`, ...)
    #[serde(default)]
    pub addresses: HashMap<String, String>,
}

impl Task {
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// Candidate address reported by the given source, if non-empty
    pub fn address_from(&self, source: &str) -> Option<&str> {
        self.addresses
            .get(source)
            .map(String::as_str)
            .filter(|address| !address.is_empty())
    }
}

/// Service registration published on a node's agent
///
/// Equality covers every field; tags compare as a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: BTreeSet<String>,
}

impl ServiceRecord {
    pub fn new<I, S>(id: String, name: &str, address: &str, port: u16, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            name: sanitize_service_name(name),
            address: address.to_string(),
            port,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// Make a name acceptable to the registry backend
///
/// Underscores are dropped. Any other character outside `[A-Za-z0-9-]` is
/// replaced with a dash rather than stripped, so `web.api` stays
/// distinguishable from `webapi`. The result is lower-cased.
pub fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Probe definition carried by a health check
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckSpec {
    Http(String),
    Tcp(String),
    Script(String),
}

impl CheckSpec {
    pub fn template(&self) -> &str {
        match self {
            CheckSpec::Http(value) | CheckSpec::Tcp(value) | CheckSpec::Script(value) => value,
        }
    }

    /// Same variant with a different template body
    pub fn with_template(&self, template: String) -> Self {
        match self {
            CheckSpec::Http(_) => CheckSpec::Http(template),
            CheckSpec::Tcp(_) => CheckSpec::Tcp(template),
            CheckSpec::Script(_) => CheckSpec::Script(template),
        }
    }
}

/// Reusable, unbound health-check template stored in the KV store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckDefinition {
    pub id: String,
    pub name: String,
    pub spec: CheckSpec,
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

/// Health check bound to a concrete service registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub spec: CheckSpec,
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

/// Agent connection state as tracked by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Unknown,
    Connecting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Unknown => write!(f, "unknown"),
            AgentState::Connecting => write!(f, "connecting"),
            AgentState::Healthy => write!(f, "healthy"),
            AgentState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_host_parsing() {
        let mut snapshot = ClusterSnapshot {
            leader: "master@10.10.10.8:5050".to_string(),
            ..Default::default()
        };
        assert_eq!(snapshot.leader_host(), Some("10.10.10.8"));

        snapshot.leader = "10.10.10.9:5050".to_string();
        assert_eq!(snapshot.leader_host(), Some("10.10.10.9"));

        snapshot.leader = String::new();
        assert_eq!(snapshot.leader_host(), None);
    }

    #[test]
    fn test_sanitize_service_name() {
        assert_eq!(sanitize_service_name("My_App"), "myapp");
        assert_eq!(sanitize_service_name("group/web.server"), "group-web-server");
        assert_eq!(sanitize_service_name("nginx-bridge"), "nginx-bridge");
    }

    #[test]
    fn test_service_record_tag_order_is_irrelevant() {
        let a = ServiceRecord::new("p:1".to_string(), "svc", "10.0.0.1", 80, ["a", "b"]);
        let b = ServiceRecord::new("p:1".to_string(), "svc", "10.0.0.1", 80, ["b", "a"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_task_state_wire_names() {
        let state: TaskState = serde_json::from_str("\"TASK_RUNNING\"").unwrap();
        assert_eq!(state, TaskState::Running);
    }

    #[test]
    fn test_short_hostname() {
        assert_eq!(short_hostname("slave-1.cluster.local"), "slave-1");
        assert_eq!(short_hostname("slave-1"), "slave-1");
    }
}
