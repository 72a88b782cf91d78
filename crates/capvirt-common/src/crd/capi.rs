//! Cluster API core resources (cluster.x-k8s.io/v1beta1)
//!
//! Typed down to the fields an infrastructure provider reads: the
//! infrastructure reference and readiness of a `Cluster`, and the cluster
//! name and bootstrap secret of a `Machine`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API group of the Cluster API core resources
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Specification of a Cluster API `Cluster`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reference to the infrastructure cluster object (our VirtinkCluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Observed state of a Cluster API `Cluster`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Set by Cluster API once the infrastructure cluster reports ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Cluster {
    /// Whether Cluster API considers the infrastructure ready
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.infrastructure_ready)
    }
}

/// Specification of a Cluster API `Machine`
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning Cluster API `Cluster`
    #[serde(default)]
    pub cluster_name: String,

    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Bootstrap section of a `Machine`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding the bootstrap data, set once the bootstrap provider is done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
