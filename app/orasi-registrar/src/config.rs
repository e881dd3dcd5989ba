//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Configuration for Orasi Registrar

use crate::error::RegistrarError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the registrar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Prefix of every registration id owned by the registrar
    pub service_prefix: String,

    /// Service name used for node records
    pub node_service_name: String,

    /// Ordered task address sources
    pub ip_sources: Vec<IpSource>,

    /// Labels applied to tasks after launch
    pub deferred_labels: Vec<DeferredLabel>,

    /// Task label listing health-check template names
    pub health_check_label: String,

    /// Number of cycles between cache invalidations
    pub cache_refresh: u32,

    /// Skip listing agent services when the cache is invalidated
    pub cache_only: bool,

    /// Reconciliation cadence in seconds
    pub refresh_seconds: u64,

    /// Health-check template poll cadence in seconds
    pub health_check_poll_seconds: u64,

    /// Cluster snapshot document read by the binary
    pub state_file: String,

    /// Consul connection settings
    pub consul: ConsulConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            service_prefix: "mesos-dns".to_string(),
            node_service_name: "mesos".to_string(),
            ip_sources: vec![IpSource::NetInfo, IpSource::Mesos, IpSource::Host],
            deferred_labels: vec![DeferredLabel::default()],
            health_check_label: "ConsulHealthCheckKeys".to_string(),
            cache_refresh: 10,
            cache_only: false,
            refresh_seconds: 60,
            health_check_poll_seconds: 30,
            state_file: "state.json".to_string(),
            consul: ConsulConfig::default(),
        }
    }
}

impl RegistrarConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistrarError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistrarError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            RegistrarError::Configuration(format!("Failed to parse config file: {}", e))
        })
    }

    /// Apply overrides from environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("CONSUL_ADDRESS") {
            self.consul.address = address;
        }
        if let Ok(token) = std::env::var("CONSUL_TOKEN") {
            self.consul.token = Some(token);
        }
        if let Ok(datacenter) = std::env::var("CONSUL_DATACENTER") {
            self.consul.datacenter = Some(datacenter);
        }
        if let Ok(prefix) = std::env::var("REGISTRAR_SERVICE_PREFIX") {
            self.service_prefix = prefix;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.cache_refresh == 0 {
            return Err(RegistrarError::Configuration(
                "Cache refresh must be greater than 0".to_string(),
            ));
        }

        if self.service_prefix.is_empty() {
            return Err(RegistrarError::Configuration(
                "Service prefix cannot be empty".to_string(),
            ));
        }

        if self.ip_sources.is_empty() {
            return Err(RegistrarError::Configuration(
                "At least one IP source must be configured".to_string(),
            ));
        }

        if self.refresh_seconds == 0 {
            return Err(RegistrarError::Configuration(
                "Refresh interval must be greater than 0".to_string(),
            ));
        }

        self.consul.validate()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }

    pub fn health_check_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_poll_seconds.max(1))
    }
}

/// Consul connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    /// Initial agent address (`host:port`), also used for catalog and KV calls
    pub address: String,

    pub datacenter: Option<String>,

    /// `http` or `https`
    pub scheme: String,

    /// ACL token, passed through untouched
    pub token: Option<String>,

    /// Port of the per-node agents; defaults to the port of `address`
    pub agent_port: Option<u16>,

    /// Timeout applied to every agent request
    pub request_timeout_secs: u64,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            datacenter: None,
            scheme: "http".to_string(),
            token: None,
            agent_port: None,
            request_timeout_secs: 5,
        }
    }
}

impl ConsulConfig {
    pub fn validate(&self) -> Result<(), RegistrarError> {
        if self.address.is_empty() {
            return Err(RegistrarError::Configuration(
                "Consul address cannot be empty".to_string(),
            ));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(RegistrarError::Configuration(format!(
                "Unsupported Consul scheme: {}",
                self.scheme
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(RegistrarError::Configuration(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        self.resolved_agent_port().map(|_| ())
    }

    /// Port used to reach the agent on every node
    pub fn resolved_agent_port(&self) -> Result<u16, RegistrarError> {
        if let Some(port) = self.agent_port {
            return Ok(port);
        }

        match self.address.rsplit_once(':') {
            Some((_, port)) => port.parse().map_err(|_| {
                RegistrarError::Configuration(format!(
                    "Invalid port in Consul address: {}",
                    self.address
                ))
            }),
            None => Ok(8500),
        }
    }

    /// Base URL for the given `host:port`
    pub fn base_url(&self, host_port: &str) -> String {
        if host_port.starts_with("http://") || host_port.starts_with("https://") {
            host_port.trim_end_matches('/').to_string()
        } else {
            format!("{}://{}", self.scheme, host_port)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Source consulted when resolving a task address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpSource {
    Mesos,
    Docker,
    NetInfo,
    Host,
    /// The owning node's address
    Fallback,
    /// Address published under a task status label
    Label(String),
}

impl fmt::Display for IpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpSource::Mesos => write!(f, "mesos"),
            IpSource::Docker => write!(f, "docker"),
            IpSource::NetInfo => write!(f, "netinfo"),
            IpSource::Host => write!(f, "host"),
            IpSource::Fallback => write!(f, "fallback"),
            IpSource::Label(name) => write!(f, "label:{}", name),
        }
    }
}

impl FromStr for IpSource {
    type Err = RegistrarError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = value.strip_prefix("label") {
            return match rest.strip_prefix(':') {
                Some(name) if !name.is_empty() => Ok(IpSource::Label(name.to_string())),
                _ => Err(RegistrarError::Configuration(
                    "Lookup order label is not in proper format `label:labelname`".to_string(),
                )),
            };
        }

        match value {
            "mesos" => Ok(IpSource::Mesos),
            "docker" => Ok(IpSource::Docker),
            "netinfo" => Ok(IpSource::NetInfo),
            "host" => Ok(IpSource::Host),
            "fallback" => Ok(IpSource::Fallback),
            other => Err(RegistrarError::Configuration(format!(
                "Unknown IP source: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for IpSource {
    type Error = RegistrarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpSource> for String {
    fn from(source: IpSource) -> Self {
        source.to_string()
    }
}

/// Label that is applied to a task asynchronously after it starts
///
/// While `pending_marker` is present on the task and `label` has not been
/// published yet, the task address is not known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredLabel {
    pub label: String,
    pub pending_marker: String,
}

impl Default for DeferredLabel {
    fn default() -> Self {
        Self {
            label: "CalicoDocker.NetworkSettings.IPAddress".to_string(),
            pending_marker: "CALICO_IP".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RegistrarConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_cache_refresh_is_rejected() {
        let config = RegistrarConfig {
            cache_refresh: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistrarError::Configuration(_))
        ));
    }

    #[test]
    fn test_ip_source_parsing() {
        assert_eq!("docker".parse::<IpSource>().unwrap(), IpSource::Docker);
        assert_eq!(
            "label:CalicoDocker.NetworkSettings.IPAddress"
                .parse::<IpSource>()
                .unwrap(),
            IpSource::Label("CalicoDocker.NetworkSettings.IPAddress".to_string())
        );
        assert!("label".parse::<IpSource>().is_err());
        assert!("label:".parse::<IpSource>().is_err());
        assert!("rkt".parse::<IpSource>().is_err());
    }

    #[test]
    fn test_agent_port_from_address() {
        let consul = ConsulConfig {
            address: "10.0.0.1:8501".to_string(),
            ..Default::default()
        };
        assert_eq!(consul.resolved_agent_port().unwrap(), 8501);

        let consul = ConsulConfig {
            agent_port: Some(9000),
            ..consul
        };
        assert_eq!(consul.resolved_agent_port().unwrap(), 9000);
    }

    #[test]
    fn test_config_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
service_prefix = "orasi"
ip_sources = ["docker", "label:Calico.IP", "host"]
cache_refresh = 3

[consul]
address = "consul.service:8500"
token = "secret"
"#
        )
        .unwrap();

        let config = RegistrarConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service_prefix, "orasi");
        assert_eq!(config.cache_refresh, 3);
        assert_eq!(
            config.ip_sources,
            vec![
                IpSource::Docker,
                IpSource::Label("Calico.IP".to_string()),
                IpSource::Host
            ]
        );
        assert_eq!(config.consul.token.as_deref(), Some("secret"));
        assert_eq!(config.consul.scheme, "http");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_ip_source_in_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"ip_sources = ["label"]"#).unwrap();
        assert!(RegistrarConfig::from_file(file.path()).is_err());
    }
}
