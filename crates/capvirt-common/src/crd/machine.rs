//! VirtinkMachine Custom Resource Definition
//!
//! A VirtinkMachine is the infrastructure counterpart of a Cluster API
//! `Machine`. It carries the Virtink VM spec to run plus the DataVolumes that
//! must exist before the VM is created.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::virtink::VirtualMachineSpec;
use super::{preserve_unknown_fields, TemplateMeta};
use crate::CLUSTER_NAME_LABEL;

/// Specification for a VirtinkMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VirtinkMachine",
    plural = "virtinkmachines",
    shortname = "vtm",
    status = "VirtinkMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Failure","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtinkMachineSpec {
    /// `virtink://<vm uid>`, set once the VM exists
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Virtink VM spec the machine's VM is built from
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub vm_spec: VirtualMachineSpec,

    /// Namespace of the VM and its volumes, the machine's namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_namespace: Option<String>,

    /// DataVolumes created before the VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_templates: Vec<VolumeTemplate>,
}

/// Precursor volume of a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTemplate {
    /// DataVolume to create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeTemplate>,
}

/// DataVolume template; the created object is named `<machine>-<metadata.name>`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeTemplate {
    /// Name, labels and annotations of the DataVolume
    #[serde(default)]
    pub metadata: DataVolumeTemplateMeta,

    /// CDI DataVolume spec
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: BTreeMap<String, Value>,
}

/// Metadata of a DataVolume template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeTemplateMeta {
    /// Template name, also the name of the VM volume that mounts it
    #[serde(default)]
    pub name: String,

    /// Labels and annotations copied onto the DataVolume
    #[serde(flatten)]
    pub meta: TemplateMeta,
}

/// Status for a VirtinkMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtinkMachineStatus {
    /// Whether the VM is running
    #[serde(default)]
    pub ready: bool,

    /// Terminal failure code, never cleared once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Human readable terminal failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl VirtinkMachine {
    /// Namespace the VM and its volumes live in
    pub fn vm_namespace(&self) -> String {
        self.spec
            .vm_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace().unwrap_or_default())
    }

    /// Name of the Cluster API cluster this machine belongs to
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()?
            .get(CLUSTER_NAME_LABEL)
            .map(String::as_str)
    }

    /// Whether a terminal failure has been recorded
    pub fn has_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.failure_reason.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(vm_namespace: Option<&str>) -> VirtinkMachine {
        let mut machine = VirtinkMachine::new(
            "m-0",
            VirtinkMachineSpec {
                vm_namespace: vm_namespace.map(str::to_string),
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("capi".to_string());
        machine
    }

    #[test]
    fn vm_namespace_defaults_to_machine_namespace() {
        assert_eq!(sample(None).vm_namespace(), "capi");
        assert_eq!(sample(Some("")).vm_namespace(), "capi");
        assert_eq!(sample(Some("vms")).vm_namespace(), "vms");
    }

    #[test]
    fn provider_id_uses_capi_field_name() {
        let mut machine = sample(None);
        machine.spec.provider_id = Some("virtink://abc".to_string());
        let json = serde_json::to_value(&machine.spec).expect("serializes");
        assert_eq!(json["providerID"], "virtink://abc");
    }

    #[test]
    fn volume_templates_parse() {
        let spec: VirtinkMachineSpec = serde_json::from_value(json!({
            "vmSpec": {"instance": {}},
            "volumeTemplates": [{
                "dataVolume": {
                    "metadata": {"name": "root", "labels": {"tier": "os"}},
                    "spec": {"source": {"registry": {"url": "docker://img"}}}
                }
            }]
        }))
        .expect("valid spec");

        let dv = spec.volume_templates[0].data_volume.as_ref().expect("dv");
        assert_eq!(dv.metadata.name, "root");
        assert_eq!(dv.metadata.meta.labels.get("tier"), Some(&"os".to_string()));
        assert!(dv.spec.contains_key("source"));
    }

    #[test]
    fn failure_is_read_from_status() {
        let mut machine = sample(None);
        assert!(!machine.has_failed());
        machine.status = Some(VirtinkMachineStatus {
            failure_reason: Some("UpdateError".to_string()),
            ..Default::default()
        });
        assert!(machine.has_failed());
    }
}
