//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Per-node registration bookkeeping

use crate::{
    delta::{check_delta, service_delta, CheckDeltaMode},
    types::{HealthCheckRecord, Node, NodeId, ServiceRecord},
};
use std::collections::HashMap;

/// Last confirmed and newly desired records of one node
///
/// `current_*` is rebuilt from scratch every cycle. `previous_*` only moves
/// forward once the node has completed a cleanup stage.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistrationState {
    pub node_id: NodeId,

    /// Short hostname, the node name used by the catalog
    pub hostname: String,

    pub previous_services: Vec<ServiceRecord>,
    pub current_services: Vec<ServiceRecord>,
    pub previous_checks: Vec<HealthCheckRecord>,
    pub current_checks: Vec<HealthCheckRecord>,

    pub healthy: bool,

    /// Completed cycles for this node
    pub cycle_count: u64,
}

impl NodeRegistrationState {
    pub fn new(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            hostname: node.short_hostname().to_string(),
            ..Default::default()
        }
    }

    /// Replace the desired records for this cycle
    pub fn set_current(&mut self, services: Vec<ServiceRecord>, checks: Vec<HealthCheckRecord>) {
        self.current_services = services;
        self.current_checks = checks;
    }

    pub fn service_additions(&self) -> Vec<ServiceRecord> {
        service_delta(&self.previous_services, &self.current_services)
    }

    /// Previous services that are no longer desired
    ///
    /// A record whose content changed keeps its id and was already replaced
    /// by the register stage, so it is not removed.
    pub fn service_removals(&self) -> Vec<ServiceRecord> {
        service_delta(&self.current_services, &self.previous_services)
            .into_iter()
            .filter(|stale| !self.current_services.iter().any(|record| record.id == stale.id))
            .collect()
    }

    pub fn check_additions(&self) -> Vec<HealthCheckRecord> {
        check_delta(
            &self.previous_checks,
            &self.current_checks,
            CheckDeltaMode::Add,
        )
    }

    pub fn check_removals(&self) -> Vec<HealthCheckRecord> {
        check_delta(
            &self.current_checks,
            &self.previous_checks,
            CheckDeltaMode::Purge,
        )
    }

    /// Whether the cycle in progress ends with a cache invalidation
    pub fn is_refresh_cycle(&self, cache_refresh: u32) -> bool {
        (self.cycle_count + 1) % u64::from(cache_refresh.max(1)) == 0
    }

    /// Close the cycle for this node
    ///
    /// Rotates current into previous, or drops previous entirely every
    /// `cache_refresh` cycles so the next register stage re-adds everything.
    /// Returns true when the cache was dropped.
    pub fn complete_cycle(&mut self, cache_refresh: u32) -> bool {
        let dropped = self.is_refresh_cycle(cache_refresh);
        self.cycle_count += 1;

        if dropped {
            self.previous_services.clear();
            self.previous_checks.clear();
            self.current_services.clear();
            self.current_checks.clear();
        } else {
            self.previous_services = std::mem::take(&mut self.current_services);
            self.previous_checks = std::mem::take(&mut self.current_checks);
        }

        dropped
    }
}

/// Registration state of every node seen so far
#[derive(Debug, Default)]
pub struct RegistrationCache {
    nodes: HashMap<NodeId, NodeRegistrationState>,
}

impl RegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a member, created on first sight
    pub fn ensure(&mut self, node: &Node) -> &mut NodeRegistrationState {
        let state = self
            .nodes
            .entry(node.id.clone())
            .or_insert_with(|| NodeRegistrationState::new(node));
        state.hostname = node.short_hostname().to_string();
        state
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRegistrationState> {
        self.nodes.get(node_id)
    }

    /// Hand a node's state to the task processing it
    pub fn take(&mut self, node_id: &str) -> Option<NodeRegistrationState> {
        self.nodes.remove(node_id)
    }

    /// Return a node's state after processing
    pub fn restore(&mut self, state: NodeRegistrationState) {
        self.nodes.insert(state.node_id.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
