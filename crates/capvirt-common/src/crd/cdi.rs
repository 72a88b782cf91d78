//! CDI `DataVolume` (cdi.kubevirt.io/v1beta1)
//!
//! capvirt only creates, looks up and deletes DataVolumes; the spec is passed
//! through untouched from the machine's volume templates.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Specification of a CDI DataVolume
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    plural = "datavolumes",
    namespaced,
    schema = "disabled"
)]
pub struct DataVolumeSpec {
    /// Source, storage and other CDI fields
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}
