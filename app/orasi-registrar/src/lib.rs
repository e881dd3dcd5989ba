//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Orasi Registrar - publishes cluster workload topology to per-node registry agents

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod delta;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod service;
pub mod synthesizer;
pub mod types;

/// Registrar version
pub const REGISTRAR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registrar name
pub const REGISTRAR_NAME: &str = "orasi-registrar";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/registrar.toml";

// Re-export main types for convenience
pub use catalog::{HealthCheckCatalog, HealthCheckWatcher};
pub use config::RegistrarConfig;
pub use error::RegistrarError;
pub use reconciler::{CycleReport, NodeOutcome, Reconciler};
pub use service::{FileSnapshotSource, RegistrarService, ServiceHandle, SnapshotSource};
pub use types::*;

/// Result type for registrar operations
pub type RegistrarResult<T> = Result<T, RegistrarError>;
