//! VirtinkCluster and VirtinkMachine reconcilers
//!
//! This crate holds the reconciliation engine of the Virtink infrastructure
//! provider:
//! - `cluster`: control plane Service, endpoint and node address ledger
//! - `machine`: one Virtink VM (plus its DataVolumes) per VirtinkMachine
//! - `address`: static node address pool and annotation templates
//! - `builder`: pure constructors of the dependent objects
//! - `infra`: resolution of the store that holds VMs, volumes and Services

pub mod address;
pub mod builder;
pub mod client;
pub mod cluster;
pub mod context;
pub mod infra;
pub mod lifecycle;
pub mod machine;
pub mod persist;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{InfraClient, InfraClientImpl, KubeClient, KubeClientImpl, Lookup};
pub use context::Context;
pub use infra::{InfraConnector, KubeconfigConnector};

pub use capvirt_common::{Error, Result};
