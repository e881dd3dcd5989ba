//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Directory of per-node registry agent handles
//!
//! Node agent state moves `Unknown -> Connecting -> Healthy`, drops to
//! `Unhealthy` on any operational error and goes back through `Connecting`
//! on the next discovery.

use crate::{
    backend::{AgentConnector, RegistryAgent},
    error::RegistrarError,
    types::{AgentState, Node, NodeId},
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};

struct AgentEntry {
    state: AgentState,
    address: String,
    handle: Option<Arc<dyn RegistryAgent>>,
}

/// Health-tracked handles to every member's registry agent
pub struct AgentDirectory {
    connector: Arc<dyn AgentConnector>,
    agents: RwLock<HashMap<NodeId, AgentEntry>>,
    connect_timeout: Duration,
}

impl AgentDirectory {
    pub fn new(connector: Arc<dyn AgentConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            agents: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Connect to members that have no healthy handle yet
    ///
    /// Members are connected concurrently; a failure only affects that
    /// member. Returns the number of members that became healthy.
    pub async fn discover(&self, members: &[Node]) -> usize {
        let pending: Vec<&Node> = {
            let mut agents = self.agents.write().await;
            let pending: Vec<&Node> = members
                .iter()
                .filter(|node| {
                    agents.get(&node.id).map_or(true, |entry| {
                        entry.state != AgentState::Healthy || entry.address != node.address
                    })
                })
                .collect();

            for node in &pending {
                agents.insert(
                    node.id.clone(),
                    AgentEntry {
                        state: AgentState::Connecting,
                        address: node.address.clone(),
                        handle: None,
                    },
                );
            }
            pending
        };

        if pending.is_empty() {
            return 0;
        }

        debug!("Connecting to {} registry agents", pending.len());
        let results = join_all(pending.iter().map(|node| self.connect(node))).await;

        let mut connected = 0;
        let mut agents = self.agents.write().await;
        for (node, result) in pending.into_iter().zip(results) {
            let entry = match result {
                Ok(handle) => {
                    connected += 1;
                    trace!("Connected to registry agent of node {}", node.id);
                    AgentEntry {
                        state: AgentState::Healthy,
                        address: node.address.clone(),
                        handle: Some(handle),
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to connect to registry agent of node {} at {}: {}",
                        node.id, node.address, e
                    );
                    AgentEntry {
                        state: AgentState::Unhealthy,
                        address: node.address.clone(),
                        handle: None,
                    }
                }
            };
            agents.insert(node.id.clone(), entry);
        }

        info!(
            "Agent discovery finished: {} connected, {} tracked",
            connected,
            agents.len()
        );
        connected
    }

    async fn connect(&self, node: &Node) -> Result<Arc<dyn RegistryAgent>, RegistrarError> {
        tokio::time::timeout(self.connect_timeout, self.connector.connect(node)).await?
    }

    /// Handle for a healthy member
    pub async fn get(&self, node_id: &str) -> Option<Arc<dyn RegistryAgent>> {
        let agents = self.agents.read().await;
        agents
            .get(node_id)
            .filter(|entry| entry.state == AgentState::Healthy)
            .and_then(|entry| entry.handle.clone())
    }

    pub async fn state(&self, node_id: &str) -> AgentState {
        self.agents
            .read()
            .await
            .get(node_id)
            .map_or(AgentState::Unknown, |entry| entry.state)
    }

    /// Drop the handle so the next discovery reconnects the node
    pub async fn mark_unhealthy(&self, node_id: &str) {
        if let Some(entry) = self.agents.write().await.get_mut(node_id) {
            if entry.state != AgentState::Unhealthy {
                debug!("Marking registry agent of node {} unhealthy", node_id);
            }
            entry.state = AgentState::Unhealthy;
            entry.handle = None;
        }
    }

    pub async fn healthy_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|entry| entry.state == AgentState::Healthy)
            .count()
    }
}
