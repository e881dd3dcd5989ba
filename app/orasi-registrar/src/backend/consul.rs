//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Consul registry backend implementation
//!
//! One [`ConsulClient`] speaks the Consul HTTP API of a single agent. The
//! same client type serves the node-local agent operations, the catalog
//! fallback and the KV reads; only the address differs.

use super::trait_def::{
    AgentConnector, CatalogApi, CatalogDeregistration, KvPair, KvStore, RegisteredCheck,
    RegistryAgent,
};
use crate::{
    config::ConsulConfig,
    error::RegistrarError,
    types::{CheckSpec, HealthCheckRecord, Node, ServiceRecord, PORT_UNSET},
};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Consul HTTP API client bound to one agent address
#[derive(Clone)]
pub struct ConsulClient {
    http_client: HttpClient,
    base_url: String,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulClient {
    /// Create a client for the agent at `host_port`
    pub fn new(host_port: &str, config: &ConsulConfig) -> Result<Self, RegistrarError> {
        Ok(Self::with_http_client(
            build_http_client(config)?,
            host_port,
            config,
        ))
    }

    fn with_http_client(http_client: HttpClient, host_port: &str, config: &ConsulConfig) -> Self {
        Self {
            http_client,
            base_url: config.base_url(host_port),
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build an authenticated request against the Consul API
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1{}", self.base_url, path);
        let mut request = self.http_client.request(method, &url);

        if let Some(ref token) = self.token {
            request = request.header("X-Consul-Token", token);
        }

        request
    }

    /// Send a request, turning non-success statuses into `on_status` errors
    async fn send(
        &self,
        request: RequestBuilder,
        context: &str,
        on_status: fn(String) -> RegistrarError,
    ) -> Result<Response, RegistrarError> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(on_status(format!(
                "{} on {}: HTTP {} - {}",
                context, self.base_url, status, error_text
            )));
        }

        Ok(response)
    }
}

fn build_http_client(config: &ConsulConfig) -> Result<HttpClient, RegistrarError> {
    HttpClient::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| RegistrarError::Connection(format!("Failed to build HTTP client: {}", e)))
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistrationBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    address: &'a str,
    #[serde(skip_serializing_if = "is_unset_port")]
    port: u16,
    tags: Vec<&'a str>,
}

impl<'a> From<&'a ServiceRecord> for ServiceRegistrationBody<'a> {
    fn from(record: &'a ServiceRecord) -> Self {
        Self {
            id: &record.id,
            name: &record.name,
            address: &record.address,
            port: record.port,
            tags: record.tags.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckRegistrationBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<&'a str>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
}

impl<'a> From<&'a HealthCheckRecord> for CheckRegistrationBody<'a> {
    fn from(record: &'a HealthCheckRecord) -> Self {
        let (http, tcp, script) = match &record.spec {
            CheckSpec::Http(url) => (Some(url.as_str()), None, None),
            CheckSpec::Tcp(address) => (None, Some(address.as_str()), None),
            CheckSpec::Script(command) => (None, None, Some(command.as_str())),
        };

        Self {
            id: &record.id,
            name: &record.name,
            service_id: &record.service_id,
            http,
            tcp,
            script,
            interval: record.interval.as_deref(),
            timeout: record.timeout.as_deref(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheckEntry {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

fn is_empty(value: &&str) -> bool {
    value.is_empty()
}

fn is_unset_port(port: &u16) -> bool {
    *port == PORT_UNSET
}

#[async_trait]
impl RegistryAgent for ConsulClient {
    async fn register_service(&self, record: &ServiceRecord) -> Result<(), RegistrarError> {
        trace!("Registering service {} on {}", record.id, self.base_url);

        let body = ServiceRegistrationBody::from(record);
        let request = self
            .request(Method::PUT, "/agent/service/register")
            .json(&body);
        self.send(
            request,
            &format!("Failed to register service {}", record.id),
            RegistrarError::Registration,
        )
        .await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistrarError> {
        trace!("Deregistering service {} on {}", service_id, self.base_url);

        let request = self.request(
            Method::PUT,
            &format!("/agent/service/deregister/{}", service_id),
        );
        self.send(
            request,
            &format!("Failed to deregister service {}", service_id),
            RegistrarError::Deregistration,
        )
        .await?;
        Ok(())
    }

    async fn register_check(&self, record: &HealthCheckRecord) -> Result<(), RegistrarError> {
        trace!(
            "Registering check {} for service {} on {}",
            record.id,
            record.service_id,
            self.base_url
        );

        let body = CheckRegistrationBody::from(record);
        let request = self.request(Method::PUT, "/agent/check/register").json(&body);
        self.send(
            request,
            &format!("Failed to register check {}", record.id),
            RegistrarError::Registration,
        )
        .await?;
        Ok(())
    }

    async fn deregister_check(&self, check_id: &str) -> Result<(), RegistrarError> {
        trace!("Deregistering check {} on {}", check_id, self.base_url);

        let request = self.request(Method::PUT, &format!("/agent/check/deregister/{}", check_id));
        self.send(
            request,
            &format!("Failed to deregister check {}", check_id),
            RegistrarError::Deregistration,
        )
        .await?;
        Ok(())
    }

    async fn list_services(&self, prefix: &str) -> Result<Vec<ServiceRecord>, RegistrarError> {
        let request = self.request(Method::GET, "/agent/services");
        let response = self
            .send(request, "Failed to list services", RegistrarError::Network)
            .await?;

        let services: HashMap<String, AgentServiceEntry> = response.json().await?;
        let mut records: Vec<ServiceRecord> = services
            .into_values()
            .filter(|service| service.id.split(':').next() == Some(prefix))
            .map(|service| ServiceRecord {
                id: service.id,
                name: service.service,
                address: service.address,
                port: service.port,
                tags: service.tags.unwrap_or_default().into_iter().collect(),
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(
            "Found {} services with prefix {} on {}",
            records.len(),
            prefix,
            self.base_url
        );
        Ok(records)
    }

    async fn list_checks(&self) -> Result<Vec<RegisteredCheck>, RegistrarError> {
        let request = self.request(Method::GET, "/agent/checks");
        let response = self
            .send(request, "Failed to list checks", RegistrarError::Network)
            .await?;

        let checks: HashMap<String, AgentCheckEntry> = response.json().await?;
        let mut checks: Vec<RegisteredCheck> = checks
            .into_values()
            .map(|check| RegisteredCheck {
                id: check.check_id,
                name: check.name,
                service_id: check.service_id,
                status: check.status,
            })
            .collect();
        checks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(checks)
    }

    async fn liveness_probe(&self) -> Result<(), RegistrarError> {
        let request = self.request(Method::GET, "/agent/self");
        self.send(request, "Liveness probe failed", RegistrarError::Connection)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogApi for ConsulClient {
    async fn catalog_deregister(
        &self,
        request: &CatalogDeregistration,
    ) -> Result<(), RegistrarError> {
        let mut body = request.clone();
        if body.datacenter.is_none() {
            body.datacenter = self.datacenter.clone();
        }

        let target = body
            .service_id
            .as_deref()
            .or(body.check_id.as_deref())
            .unwrap_or_default()
            .to_string();
        let http_request = self.request(Method::PUT, "/catalog/deregister").json(&body);
        self.send(
            http_request,
            &format!(
                "Failed to deregister {} of node {} from catalog",
                target, body.node
            ),
            RegistrarError::CatalogFallback,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for ConsulClient {
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, RegistrarError> {
        let mut request = self
            .request(Method::GET, &format!("/kv/{}", prefix))
            .query(&[("recurse", "true")]);
        if let Some(ref datacenter) = self.datacenter {
            request = request.query(&[("dc", datacenter)]);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(RegistrarError::Network(format!(
                "Failed to list KV prefix {} on {}: HTTP {}",
                prefix,
                self.base_url,
                response.status()
            )));
        }

        let entries: Vec<KvEntry> = response.json().await?;
        entries
            .into_iter()
            .map(|entry| {
                let value = match entry.value {
                    Some(encoded) => base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| {
                            RegistrarError::Serialization(format!(
                                "Invalid base64 value for key {}: {}",
                                entry.key, e
                            ))
                        })?,
                    None => Vec::new(),
                };
                Ok(KvPair {
                    key: entry.key,
                    value,
                })
            })
            .collect()
    }
}

/// Connects to the Consul agent running on each cluster node
pub struct ConsulConnector {
    config: ConsulConfig,
    http_client: HttpClient,
    agent_port: u16,
}

impl ConsulConnector {
    pub fn new(config: &ConsulConfig) -> Result<Self, RegistrarError> {
        Ok(Self {
            config: config.clone(),
            http_client: build_http_client(config)?,
            agent_port: config.resolved_agent_port()?,
        })
    }

    /// Client for the initially configured agent, used for catalog and KV calls
    pub fn seed_client(&self) -> ConsulClient {
        ConsulClient::with_http_client(self.http_client.clone(), &self.config.address, &self.config)
    }
}

#[async_trait]
impl AgentConnector for ConsulConnector {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RegistryAgent>, RegistrarError> {
        let host_port = format!("{}:{}", node.address, self.agent_port);
        let client =
            ConsulClient::with_http_client(self.http_client.clone(), &host_port, &self.config);

        client.liveness_probe().await.map_err(|e| {
            RegistrarError::Connection(format!(
                "Consul agent for node {} is not responding: {}",
                node.id, e
            ))
        })?;

        trace!("Connected to consul agent at {}", host_port);
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::StatusCode,
        routing::{get, put},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

    async fn spawn_fake_consul() -> (String, Recorded) {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));

        let services = recorded.clone();
        let checks = recorded.clone();
        let catalog = recorded.clone();

        let app = Router::new()
            .route(
                "/v1/agent/self",
                get(|| async { Json(json!({"Config": {"NodeName": "node-1"}})) }),
            )
            .route(
                "/v1/agent/service/register",
                put(move |Json(body): Json<Value>| async move {
                    services.lock().unwrap().push(("service".to_string(), body));
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/agent/check/register",
                put(move |Json(body): Json<Value>| async move {
                    checks.lock().unwrap().push(("check".to_string(), body));
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/agent/service/deregister/:id",
                put(|Path(id): Path<String>| async move {
                    if id == "missing" {
                        StatusCode::NOT_FOUND
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/v1/catalog/deregister",
                put(move |Json(body): Json<Value>| async move {
                    catalog.lock().unwrap().push(("catalog".to_string(), body));
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/agent/services",
                get(|| async {
                    Json(json!({
                        "mesos-dns:S1": {
                            "ID": "mesos-dns:S1",
                            "Service": "mesos",
                            "Tags": ["slave", "s1"],
                            "Port": 5051,
                            "Address": "10.0.0.1"
                        },
                        "consul": {
                            "ID": "consul",
                            "Service": "consul",
                            "Tags": null,
                            "Port": 8300,
                            "Address": ""
                        }
                    }))
                }),
            )
            .route(
                "/v1/kv/*key",
                get(|| async {
                    let value = base64::engine::general_purpose::STANDARD
                        .encode(r#"{"ID":"http","Name":"HTTP","HTTP":"http://{IP}:{PORT}/"}"#);
                    Json(json!([{"Key": "healthchecks/http", "Value": value}]))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr.to_string(), recorded)
    }

    fn test_config(address: &str) -> ConsulConfig {
        ConsulConfig {
            address: address.to_string(),
            token: Some("secret".to_string()),
            datacenter: Some("dc1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_service_body() {
        let (address, recorded) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        let record = ServiceRecord::new(
            "mesos-dns:s3:task-1".to_string(),
            "nginx",
            "10.0.0.3",
            PORT_UNSET,
            ["s3"],
        );
        client.register_service(&record).await.unwrap();

        let recorded = recorded.lock().unwrap();
        let (kind, body) = &recorded[0];
        assert_eq!(kind, "service");
        assert_eq!(body["ID"], "mesos-dns:s3:task-1");
        assert_eq!(body["Name"], "nginx");
        assert_eq!(body["Tags"], json!(["s3"]));
        assert!(body.get("Port").is_none());
    }

    #[tokio::test]
    async fn test_register_check_body() {
        let (address, recorded) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        let record = HealthCheckRecord {
            id: "http:mesos-dns:s3:task-1:80".to_string(),
            name: "HTTP".to_string(),
            service_id: "mesos-dns:s3:task-1:80".to_string(),
            spec: CheckSpec::Http("http://10.0.0.3:80/".to_string()),
            interval: Some("10s".to_string()),
            timeout: None,
        };
        client.register_check(&record).await.unwrap();

        let recorded = recorded.lock().unwrap();
        let (_, body) = &recorded[0];
        assert_eq!(body["HTTP"], "http://10.0.0.3:80/");
        assert_eq!(body["ServiceID"], "mesos-dns:s3:task-1:80");
        assert_eq!(body["Interval"], "10s");
        assert!(body.get("TCP").is_none());
    }

    #[tokio::test]
    async fn test_deregister_failure_is_reported() {
        let (address, _) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        assert!(client.deregister_service("mesos-dns:S1").await.is_ok());
        assert!(matches!(
            client.deregister_service("missing").await,
            Err(RegistrarError::Deregistration(_))
        ));
    }

    #[tokio::test]
    async fn test_list_services_filters_prefix() {
        let (address, _) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        let services = client.list_services("mesos-dns").await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "mesos-dns:S1");
        assert_eq!(services[0].port, 5051);
        assert!(services[0].tags.contains("slave"));
    }

    #[tokio::test]
    async fn test_catalog_deregister_uses_datacenter() {
        let (address, recorded) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        client
            .catalog_deregister(&CatalogDeregistration::service("s1", "mesos-dns:S1"))
            .await
            .unwrap();

        let recorded = recorded.lock().unwrap();
        let (_, body) = &recorded[0];
        assert_eq!(body["Node"], "s1");
        assert_eq!(body["ServiceID"], "mesos-dns:S1");
        assert_eq!(body["Datacenter"], "dc1");
        assert!(body.get("CheckID").is_none());
    }

    #[tokio::test]
    async fn test_kv_list_decodes_values() {
        let (address, _) = spawn_fake_consul().await;
        let client = ConsulClient::new(&address, &test_config(&address)).unwrap();

        let pairs = client.list("healthchecks/").await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "healthchecks/http");
        assert!(String::from_utf8(pairs[0].value.clone())
            .unwrap()
            .contains("{IP}"));
    }

    #[tokio::test]
    async fn test_connector_probes_liveness() {
        let (address, _) = spawn_fake_consul().await;
        let (host, port) = address.rsplit_once(':').unwrap();
        let connector = ConsulConnector::new(&test_config(&address)).unwrap();

        let node = Node {
            id: "S1".to_string(),
            hostname: "s1.cluster".to_string(),
            address: host.to_string(),
            port: port.to_string(),
            is_master: false,
            is_leader: false,
        };
        assert!(connector.connect(&node).await.is_ok());

        // Nothing listens on port 1
        let unreachable = ConsulConnector::new(&ConsulConfig {
            agent_port: Some(1),
            ..test_config(&address)
        })
        .unwrap();
        assert!(matches!(
            unreachable.connect(&node).await,
            Err(RegistrarError::Connection(_))
        ));
    }
}
