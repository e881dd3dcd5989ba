//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Health-check template catalog
//!
//! Templates live in the KV store under `healthchecks/<name>` as the JSON of
//! a Consul check registration. The catalog is polled on its own cadence and
//! each reconciliation cycle works against one immutable snapshot, so every
//! task in a cycle sees the same template set.
//!
//! Templates may reference `{IP}` and `{PORT}`; they are replaced with the
//! address and port of the service the check is bound to.

use crate::{
    backend::{KvPair, KvStore},
    error::RegistrarError,
    types::{CheckSpec, HealthCheckDefinition, HealthCheckRecord, PORT_UNSET},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// KV prefix holding health-check templates
pub const HEALTH_CHECK_PREFIX: &str = "healthchecks/";

const IP_PLACEHOLDER: &str = "{IP}";
const PORT_PLACEHOLDER: &str = "{PORT}";

/// Immutable set of health-check templates keyed by name
#[derive(Debug, Clone, Default)]
pub struct HealthCheckCatalog {
    templates: HashMap<String, Vec<u8>>,
}

impl HealthCheckCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from raw KV pairs, ignoring keys outside the prefix
    pub fn from_pairs(pairs: Vec<KvPair>) -> Self {
        let templates = pairs
            .into_iter()
            .filter_map(|pair| {
                pair.key
                    .strip_prefix(HEALTH_CHECK_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), pair.value))
            })
            .collect();

        Self { templates }
    }

    /// Add or replace a template
    pub fn insert(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.templates.insert(name.to_string(), value.into());
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Look up a template by name
    ///
    /// A missing key yields `LookupMiss`, which callers treat as "no check"
    /// rather than a failure.
    pub fn lookup(&self, name: &str) -> Result<HealthCheckDefinition, RegistrarError> {
        let raw = self.templates.get(name).ok_or_else(|| {
            RegistrarError::LookupMiss(format!("{}{}", HEALTH_CHECK_PREFIX, name))
        })?;

        parse_definition(raw).map_err(|e| {
            RegistrarError::Serialization(format!(
                "Failed to decode healthcheck {}{}: {}",
                HEALTH_CHECK_PREFIX, name, e
            ))
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCheckDefinition {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "HTTP", default)]
    http: Option<String>,
    #[serde(rename = "TCP", default)]
    tcp: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
}

fn parse_definition(raw: &[u8]) -> Result<HealthCheckDefinition, RegistrarError> {
    let raw: RawCheckDefinition = serde_json::from_slice(raw)?;

    let mut specs = [
        raw.http.filter(|v| !v.is_empty()).map(CheckSpec::Http),
        raw.tcp.filter(|v| !v.is_empty()).map(CheckSpec::Tcp),
        raw.script.filter(|v| !v.is_empty()).map(CheckSpec::Script),
    ]
    .into_iter()
    .flatten();

    let spec = specs.next().ok_or_else(|| {
        RegistrarError::Serialization("Check defines none of HTTP, TCP or Script".to_string())
    })?;
    if specs.next().is_some() {
        return Err(RegistrarError::Serialization(
            "Check defines more than one of HTTP, TCP or Script".to_string(),
        ));
    }

    let id = if raw.id.is_empty() {
        raw.name.clone()
    } else {
        raw.id
    };
    if id.is_empty() {
        return Err(RegistrarError::Serialization(
            "Check has neither an ID nor a Name".to_string(),
        ));
    }

    Ok(HealthCheckDefinition {
        id,
        name: raw.name,
        spec,
        interval: raw.interval,
        timeout: raw.timeout,
    })
}

impl HealthCheckDefinition {
    /// Bind the template to a concrete service instance
    ///
    /// The resulting check id is `<template id>:<service id>`, so the same
    /// template yields a distinct check per service.
    pub fn bind(
        &self,
        service_id: &str,
        address: &str,
        port: u16,
    ) -> Result<HealthCheckRecord, RegistrarError> {
        let template = self.spec.template();
        if template.contains(PORT_PLACEHOLDER) && port == PORT_UNSET {
            return Err(RegistrarError::TemplateSubstitution(format!(
                "Invalid port for substitution in healthcheck {} of service {}",
                template, service_id
            )));
        }

        let bound = template
            .replace(PORT_PLACEHOLDER, &port.to_string())
            .replace(IP_PLACEHOLDER, address);

        Ok(HealthCheckRecord {
            id: format!("{}:{}", self.id, service_id),
            name: self.name.clone(),
            service_id: service_id.to_string(),
            spec: self.spec.with_template(bound),
            interval: self.interval.clone(),
            timeout: self.timeout.clone(),
        })
    }
}

/// Polls the KV store and publishes catalog snapshots
pub struct HealthCheckWatcher {
    store: Arc<dyn KvStore>,
    current: RwLock<Arc<HealthCheckCatalog>>,
    interval: Duration,
}

impl HealthCheckWatcher {
    pub fn new(store: Arc<dyn KvStore>, interval: Duration) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(HealthCheckCatalog::new())),
            interval,
        }
    }

    /// Fetch the templates once and swap in the new snapshot
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, RegistrarError> {
        let pairs = self.store.list(HEALTH_CHECK_PREFIX).await?;
        let catalog = HealthCheckCatalog::from_pairs(pairs);
        let count = catalog.len();

        *self.current.write().await = Arc::new(catalog);
        debug!("Loaded {} healthcheck templates", count);
        Ok(count)
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<HealthCheckCatalog> {
        self.current.read().await.clone()
    }

    /// Start polling in the background
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.interval);

            loop {
                interval.tick().await;

                if let Err(e) = watcher.refresh().await {
                    error!("Failed to refresh healthcheck templates: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryRegistry;

    const HTTP_CHECK: &str =
        r#"{"ID":"http","Name":"HTTP","HTTP":"http://{IP}:{PORT}/health","Interval":"10s"}"#;
    const SCRIPT_CHECK: &str = r#"{"ID":"ping","Name":"Ping","Script":"ping -c1 {IP}"}"#;

    #[test]
    fn test_lookup_and_bind() {
        let mut catalog = HealthCheckCatalog::new();
        catalog.insert("http", HTTP_CHECK);

        let definition = catalog.lookup("http").unwrap();
        let record = definition.bind("mesos-dns:s1:t1:8080", "10.0.0.5", 8080).unwrap();

        assert_eq!(record.id, "http:mesos-dns:s1:t1:8080");
        assert_eq!(record.service_id, "mesos-dns:s1:t1:8080");
        assert_eq!(
            record.spec,
            CheckSpec::Http("http://10.0.0.5:8080/health".to_string())
        );
        assert_eq!(record.interval.as_deref(), Some("10s"));
    }

    #[test]
    fn test_port_placeholder_requires_port() {
        let mut catalog = HealthCheckCatalog::new();
        catalog.insert("http", HTTP_CHECK);
        catalog.insert("ping", SCRIPT_CHECK);

        let http = catalog.lookup("http").unwrap();
        assert!(matches!(
            http.bind("mesos-dns:s1:t1", "10.0.0.5", PORT_UNSET),
            Err(RegistrarError::TemplateSubstitution(_))
        ));

        // Templates without {PORT} bind fine against an unset port
        let ping = catalog.lookup("ping").unwrap();
        let record = ping.bind("mesos-dns:s1:t1", "10.0.0.5", PORT_UNSET).unwrap();
        assert_eq!(record.spec, CheckSpec::Script("ping -c1 10.0.0.5".to_string()));
    }

    #[test]
    fn test_lookup_misses_are_not_fatal() {
        let mut catalog = HealthCheckCatalog::new();
        catalog.insert("broken", "{not json");
        catalog.insert("empty", r#"{"ID":"empty","Name":"Empty"}"#);
        catalog.insert(
            "both",
            r#"{"ID":"both","HTTP":"http://{IP}","TCP":"{IP}:{PORT}"}"#,
        );

        assert!(matches!(
            catalog.lookup("absent"),
            Err(RegistrarError::LookupMiss(key)) if key == "healthchecks/absent"
        ));
        assert!(matches!(
            catalog.lookup("broken"),
            Err(RegistrarError::Serialization(_))
        ));
        assert!(catalog.lookup("empty").is_err());
        assert!(catalog.lookup("both").is_err());
    }

    #[test]
    fn test_from_pairs_strips_prefix() {
        let catalog = HealthCheckCatalog::from_pairs(vec![
            KvPair {
                key: "healthchecks/http".to_string(),
                value: HTTP_CHECK.as_bytes().to_vec(),
            },
            KvPair {
                key: "healthchecks/".to_string(),
                value: Vec::new(),
            },
            KvPair {
                key: "other/http".to_string(),
                value: HTTP_CHECK.as_bytes().to_vec(),
            },
        ]);

        assert_eq!(catalog.len(), 1);
        assert!(catalog.lookup("http").is_ok());
    }

    #[tokio::test]
    async fn test_watcher_refresh_publishes_snapshot() {
        let registry = InMemoryRegistry::new();
        registry.put_kv("healthchecks/http", HTTP_CHECK).await;

        let watcher = HealthCheckWatcher::new(Arc::new(registry.clone()), Duration::from_secs(30));
        let before = watcher.snapshot().await;
        assert!(before.is_empty());

        assert_eq!(watcher.refresh().await.unwrap(), 1);
        let after = watcher.snapshot().await;
        assert!(after.lookup("http").is_ok());

        // Earlier snapshots are unaffected by later refreshes
        registry.put_kv("healthchecks/ping", SCRIPT_CHECK).await;
        watcher.refresh().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(watcher.snapshot().await.len(), 2);
    }
}
