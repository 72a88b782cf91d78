//! VirtinkMachineTemplate and VirtinkClusterTemplate
//!
//! Served so that Cluster API MachineDeployments, KubeadmControlPlanes and
//! ClusterClasses can stamp out VirtinkMachines and VirtinkClusters. Nothing
//! in capvirt reconciles them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{TemplateMeta, VirtinkClusterSpec, VirtinkMachineSpec};

/// Specification for a VirtinkMachineTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VirtinkMachineTemplate",
    plural = "virtinkmachinetemplates",
    namespaced
)]
pub struct VirtinkMachineTemplateSpec {
    /// Template of the generated VirtinkMachines
    pub template: VirtinkMachineTemplateResource,
}

/// Machine template body
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VirtinkMachineTemplateResource {
    /// Labels and annotations of the generated machines
    #[serde(default)]
    pub metadata: TemplateMeta,
    /// Spec of the generated machines
    pub spec: VirtinkMachineSpec,
}

/// Specification for a VirtinkClusterTemplate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VirtinkClusterTemplate",
    plural = "virtinkclustertemplates",
    namespaced
)]
pub struct VirtinkClusterTemplateSpec {
    /// Template of the generated VirtinkCluster
    pub template: VirtinkClusterTemplateResource,
}

/// Cluster template body
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VirtinkClusterTemplateResource {
    /// Spec of the generated cluster
    pub spec: VirtinkClusterSpec,
}
