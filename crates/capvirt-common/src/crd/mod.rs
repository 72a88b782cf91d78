//! Custom Resource Definitions served and consumed by capvirt
//!
//! `cluster`, `machine` and `templates` hold the provider's own
//! `infrastructure.cluster.x-k8s.io` resources. `capi`, `virtink` and `cdi`
//! type the subset of foreign resources the reconcilers read or create.

pub mod capi;
pub mod cdi;
mod cluster;
mod machine;
mod templates;
pub mod virtink;

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cluster::{
    AnnotationTemplate, ApiEndpoint, ControlPlaneServiceTemplate, NodeAddress,
    NodeAddressConfig, SecretReference, ServiceType, VirtinkCluster, VirtinkClusterSpec,
    VirtinkClusterStatus,
};
pub use machine::{
    DataVolumeTemplate, DataVolumeTemplateMeta, VirtinkMachine, VirtinkMachineSpec,
    VirtinkMachineStatus, VolumeTemplate,
};
pub use templates::{
    VirtinkClusterTemplate, VirtinkClusterTemplateResource, VirtinkClusterTemplateSpec,
    VirtinkMachineTemplate, VirtinkMachineTemplateResource, VirtinkMachineTemplateSpec,
};

/// API group of the provider's own resources
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// Labels and annotations carried by an embedded template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    /// Labels copied onto the generated object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations copied onto the generated object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Schema for fields that embed another project's API verbatim.
///
/// The API server keeps whatever the user wrote instead of pruning it
/// against a schema we do not own.
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Label Cluster API uses to discover which API version of a provider
/// implements its v1beta1 contract
pub const CAPI_CONTRACT_LABEL: &str = "cluster.x-k8s.io/v1beta1";

/// All CRDs served by the provider, labeled for Cluster API contract discovery
pub fn provider_crds() -> Vec<CustomResourceDefinition> {
    let mut crds = vec![
        VirtinkCluster::crd(),
        VirtinkMachine::crd(),
        VirtinkClusterTemplate::crd(),
        VirtinkMachineTemplate::crd(),
    ];
    for crd in &mut crds {
        crd.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(CAPI_CONTRACT_LABEL.to_string(), "v1beta1".to_string());
    }
    crds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserved_fields_keep_unknown_keys() {
        let schema = preserve_unknown_fields(&mut SchemaGenerator::default());
        let json = serde_json::to_value(schema).expect("schema serializes");
        assert_eq!(json["type"], "object");
        assert_eq!(json["x-kubernetes-preserve-unknown-fields"], true);
    }

    #[test]
    fn own_crds_live_in_the_infrastructure_group() {
        assert_eq!(VirtinkCluster::crd().spec.group, INFRASTRUCTURE_GROUP);
        assert_eq!(VirtinkMachine::crd().spec.group, INFRASTRUCTURE_GROUP);
        assert_eq!(VirtinkClusterTemplate::crd().spec.group, INFRASTRUCTURE_GROUP);
        assert_eq!(VirtinkMachineTemplate::crd().spec.group, INFRASTRUCTURE_GROUP);
    }

    #[test]
    fn crd_names_match_cluster_api_contract() {
        assert_eq!(
            VirtinkCluster::crd().metadata.name.as_deref(),
            Some("virtinkclusters.infrastructure.cluster.x-k8s.io")
        );
        assert_eq!(
            VirtinkMachine::crd().metadata.name.as_deref(),
            Some("virtinkmachines.infrastructure.cluster.x-k8s.io")
        );
    }

    #[test]
    fn provider_crds_carry_the_contract_label() {
        let crds = provider_crds();
        assert_eq!(crds.len(), 4);
        for crd in crds {
            let labels = crd.metadata.labels.expect("labels set");
            assert_eq!(labels.get(CAPI_CONTRACT_LABEL).map(String::as_str), Some("v1beta1"));
        }
    }
}
