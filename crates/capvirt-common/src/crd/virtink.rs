//! Virtink `VirtualMachine` (virt.virtink.smartx.com/v1alpha1)
//!
//! Only the fields the machine reconciler reads or rewrites are typed. Every
//! other field is carried through `extra` so a VM spec written by a user
//! reaches the Virtink API unchanged.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Specification of a Virtink virtual machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "virt.virtink.smartx.com",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    status = "VirtualMachineStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Restart behavior of the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    /// Guest hardware
    #[serde(default)]
    pub instance: Instance,

    /// Volumes backing the instance disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VirtualMachineSpec {
    /// Run policy with Virtink's default applied
    pub fn effective_run_policy(&self) -> RunPolicy {
        self.run_policy.unwrap_or(RunPolicy::Once)
    }
}

/// How Virtink restarts a VM after it stops
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RunPolicy {
    /// Always restart
    Always,
    /// Restart only after a failure
    RerunOnFailure,
    /// Run once
    Once,
    /// Started and stopped by the user
    Manual,
    /// Never run
    Halted,
}

/// Guest hardware of a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Disks attached to the guest, each backed by a volume of the same name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Disk attached to the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Disk {
    /// Disk name, matching a volume name
    pub name: String,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Volume backing a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,

    /// Cloud-init NoCloud data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitVolumeSource>,

    /// Volume backed by a CDI DataVolume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeVolumeSource>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Cloud-init volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitVolumeSource {
    /// Base64 encoded user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_base64: Option<String>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// DataVolume volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeVolumeSource {
    /// Name of the DataVolume in the VM's namespace
    pub volume_name: String,
}

/// Observed state of a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VmPhase>,

    /// Fields not interpreted by capvirt
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Lifecycle phase reported by Virtink
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum VmPhase {
    /// Accepted, not yet scheduled
    Pending,
    /// Looking for a node
    Scheduling,
    /// Bound to a node, not yet started
    Scheduled,
    /// Guest is running
    Running,
    /// Guest exited cleanly
    Succeeded,
    /// Guest exited with an error
    Failed,
    /// Any phase newer than this client knows about
    #[serde(other)]
    Unknown,
}

impl VirtualMachine {
    /// Current phase, `Unknown` when the VM has not reported one
    pub fn phase(&self) -> VmPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(VmPhase::Unknown)
    }
}
