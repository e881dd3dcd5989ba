//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Metrics collection for the Orasi registrar

use std::time::Duration;

const CYCLES_TOTAL: &str = "orasi_registrar_cycles_total";
const CYCLE_DURATION: &str = "orasi_registrar_cycle_duration_seconds";
const REGISTRATIONS_TOTAL: &str = "orasi_registrar_registrations_total";
const DEREGISTRATIONS_TOTAL: &str = "orasi_registrar_deregistrations_total";
const CATALOG_FALLBACKS_TOTAL: &str = "orasi_registrar_catalog_fallbacks_total";
const ORPHANED_RECORDS_TOTAL: &str = "orasi_registrar_orphaned_records_total";
const NODE_FAILURES_TOTAL: &str = "orasi_registrar_node_failures_total";
const CACHE_DROPS_TOTAL: &str = "orasi_registrar_cache_drops_total";

/// Metrics collection for the registrar
#[derive(Clone, Default)]
pub struct RegistrarMetrics;

impl RegistrarMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Record one completed cycle
    pub fn record_cycle(&self, duration: Duration) {
        metrics::counter!(CYCLES_TOTAL, 1);
        metrics::histogram!(CYCLE_DURATION, duration.as_secs_f64());
    }

    /// Records added to agents, `kind` is `service` or `check`
    pub fn increment_registrations(&self, kind: &'static str, count: u64) {
        if count > 0 {
            metrics::counter!(REGISTRATIONS_TOTAL, count, "kind" => kind);
        }
    }

    pub fn increment_deregistrations(&self, kind: &'static str, count: u64) {
        if count > 0 {
            metrics::counter!(DEREGISTRATIONS_TOTAL, count, "kind" => kind);
        }
    }

    pub fn increment_catalog_fallbacks(&self) {
        metrics::counter!(CATALOG_FALLBACKS_TOTAL, 1);
    }

    /// Records that could be removed neither by the agent nor the catalog
    pub fn increment_orphaned_records(&self) {
        metrics::counter!(ORPHANED_RECORDS_TOTAL, 1);
    }

    pub fn increment_node_failures(&self, stage: &'static str) {
        metrics::counter!(NODE_FAILURES_TOTAL, 1, "stage" => stage);
    }

    pub fn increment_cache_drops(&self) {
        metrics::counter!(CACHE_DROPS_TOTAL, 1);
    }
}
