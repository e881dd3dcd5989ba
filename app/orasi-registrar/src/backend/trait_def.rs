//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Registry backend trait definitions

use crate::{
    error::RegistrarError,
    types::{HealthCheckRecord, Node, ServiceRecord},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Operations offered by the registry agent running on a single node
#[async_trait]
pub trait RegistryAgent: Send + Sync {
    /// Register (or replace) a service
    async fn register_service(&self, record: &ServiceRecord) -> Result<(), RegistrarError>;

    /// Remove a service by id
    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistrarError>;

    /// Register (or replace) a health check
    async fn register_check(&self, record: &HealthCheckRecord) -> Result<(), RegistrarError>;

    /// Remove a health check by id
    async fn deregister_check(&self, check_id: &str) -> Result<(), RegistrarError>;

    /// Services registered on the agent whose id starts with `prefix`
    async fn list_services(&self, prefix: &str) -> Result<Vec<ServiceRecord>, RegistrarError>;

    /// Checks registered on the agent
    async fn list_checks(&self) -> Result<Vec<RegisteredCheck>, RegistrarError>;

    /// Verify the agent answers requests
    async fn liveness_probe(&self) -> Result<(), RegistrarError>;
}

/// Cluster-wide catalog, reachable even when a node's agent is down
#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn catalog_deregister(
        &self,
        request: &CatalogDeregistration,
    ) -> Result<(), RegistrarError>;
}

/// Key-value store holding health-check templates
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All pairs whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, RegistrarError>;
}

/// Opens agent handles for cluster nodes
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Connect to the node's agent; implementations must probe liveness
    /// before handing out the handle.
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RegistryAgent>, RegistrarError>;
}

/// Check as reported back by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredCheck {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub status: String,
}

/// Catalog-level removal of a service or check registered on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogDeregistration {
    pub node: String,

    #[serde(rename = "ServiceID", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,

    #[serde(rename = "CheckID", skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl CatalogDeregistration {
    pub fn service(node: &str, service_id: &str) -> Self {
        Self {
            node: node.to_string(),
            service_id: Some(service_id.to_string()),
            check_id: None,
            datacenter: None,
        }
    }

    pub fn check(node: &str, check_id: &str) -> Self {
        Self {
            node: node.to_string(),
            service_id: None,
            check_id: Some(check_id.to_string()),
            datacenter: None,
        }
    }
}

/// Raw key-value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}
