//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Registry backend implementations

pub mod consul;
pub mod memory;
pub mod trait_def;

// Re-export main types for convenience
pub use consul::{ConsulClient, ConsulConnector};
pub use memory::{InMemoryAgent, InMemoryRegistry};
pub use trait_def::{
    AgentConnector, CatalogApi, CatalogDeregistration, KvPair, KvStore, RegisteredCheck,
    RegistryAgent,
};
