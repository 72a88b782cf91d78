//! Common types for capvirt: CRDs, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod ownership;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer placed on VirtinkCluster and VirtinkMachine objects
pub const FINALIZER: &str = "capch.cluster.x-k8s.io";

/// Field manager used for every patch issued by the provider
pub const FIELD_MANAGER: &str = "capvirt-controller-manager";

/// Label set by Cluster API on every object belonging to a workload cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label set by Cluster API on control plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Port the workload cluster API server listens on
pub const CONTROL_PLANE_PORT: i32 = 6443;

/// Secret key holding the kubeconfig of the infrastructure cluster
pub const INFRA_KUBECONFIG_KEY: &str = "kubeconfig";

/// Secret key holding bootstrap data written by the bootstrap provider
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Scheme prefix of every providerID set by this provider
pub const PROVIDER_ID_SCHEME: &str = "virtink";
