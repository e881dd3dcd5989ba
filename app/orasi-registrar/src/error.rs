//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Error types for Orasi Registrar

use thiserror::Error;

/// Error type for registrar operations
#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Deregistration error: {0}")]
    Deregistration(String),

    #[error("Catalog fallback error: {0}")]
    CatalogFallback(String),

    #[error("Port parse error: {0}")]
    PortParse(String),

    #[error("Template substitution error: {0}")]
    TemplateSubstitution(String),

    #[error("Lookup miss: {0}")]
    LookupMiss(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for RegistrarError {
    fn from(err: std::io::Error) -> Self {
        RegistrarError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RegistrarError {
    fn from(err: serde_json::Error) -> Self {
        RegistrarError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RegistrarError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        RegistrarError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for RegistrarError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RegistrarError::Timeout(err.to_string())
        } else if err.is_connect() {
            RegistrarError::Connection(err.to_string())
        } else {
            RegistrarError::Network(err.to_string())
        }
    }
}
