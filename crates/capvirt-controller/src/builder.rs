//! Constructors for the objects the reconcilers create
//!
//! Everything here is pure: inputs are the provider's own objects plus what
//! was read from the owner chain, output is an object ready to be created.
//! Names are derived from the owner so that the next pass finds the same
//! object again instead of creating a second one.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use capvirt_common::crd::capi::{Cluster, Machine};
use capvirt_common::crd::cdi::{DataVolume, DataVolumeSpec};
use capvirt_common::crd::virtink::{CloudInitVolumeSource, Disk, VirtualMachine, Volume};
use capvirt_common::crd::{AnnotationTemplate, NodeAddress, VirtinkCluster, VirtinkMachine};
use capvirt_common::ownership::{Owner, Placement};
use capvirt_common::{Error, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, CONTROL_PLANE_PORT};

use crate::address::render_annotations;

/// Name of the disk and volume carrying bootstrap data
pub const CLOUD_INIT_VOLUME: &str = "cloud-init";

/// Name of the DataVolume created for a machine's volume template
pub fn data_volume_name(machine_name: &str, volume_name: &str) -> String {
    format!("{machine_name}-{volume_name}")
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then_some(map)
}

/// DataVolumes for every `dataVolume` entry of `spec.volumeTemplates`
pub fn build_data_volumes(
    machine: &VirtinkMachine,
    owner: &Owner,
    placement: Placement,
) -> Result<Vec<DataVolume>, Error> {
    let machine_name = machine.name_any();
    let namespace = machine.vm_namespace();
    let mut volumes = Vec::new();

    for (i, template) in machine.spec.volume_templates.iter().enumerate() {
        let Some(template) = &template.data_volume else {
            continue;
        };
        if template.metadata.name.is_empty() {
            return Err(Error::validation_for_field(
                format!("{}/{machine_name}", machine.namespace().unwrap_or_default()),
                format!("spec.volumeTemplates[{i}].dataVolume.metadata.name"),
                "volume template has no name",
            ));
        }

        let mut dv = DataVolume::new(
            &data_volume_name(&machine_name, &template.metadata.name),
            DataVolumeSpec {
                fields: template.spec.clone(),
            },
        );
        dv.metadata.namespace = Some(namespace.clone());
        dv.metadata.labels = non_empty(template.metadata.meta.labels.clone());
        dv.metadata.annotations = non_empty(template.metadata.meta.annotations.clone());
        owner.stamp(&mut dv.metadata, placement);
        volumes.push(dv);
    }

    Ok(volumes)
}

/// Inputs of [`build_vm`] read from the owner chain
pub struct VmSource<'a> {
    /// The machine the VM backs
    pub machine: &'a VirtinkMachine,
    /// Cluster API Machine owning `machine`
    pub owner_machine: &'a Machine,
    /// The machine's ledger entry, if it has one
    pub node_address: Option<&'a NodeAddress>,
    /// Annotation templates of the VirtinkCluster
    pub annotation_templates: &'a [AnnotationTemplate],
    /// Contents of the bootstrap Secret's `value` key
    pub bootstrap_data: &'a [u8],
}

/// The VirtualMachine backing a machine
pub fn build_vm(source: &VmSource<'_>, owner: &Owner, placement: Placement) -> VirtualMachine {
    let machine = source.machine;
    let name = machine.name_any();

    let mut spec = machine.spec.vm_spec.clone();
    for volume in &mut spec.volumes {
        if let Some(dv) = volume.data_volume.as_mut() {
            dv.volume_name = data_volume_name(&name, &dv.volume_name);
        }
    }

    spec.instance.disks.retain(|d| d.name != CLOUD_INIT_VOLUME);
    spec.instance.disks.push(Disk {
        name: CLOUD_INIT_VOLUME.to_string(),
        extra: BTreeMap::new(),
    });
    spec.volumes.retain(|v| v.name != CLOUD_INIT_VOLUME);
    spec.volumes.push(Volume {
        name: CLOUD_INIT_VOLUME.to_string(),
        cloud_init: Some(CloudInitVolumeSource {
            user_data_base64: Some(STANDARD.encode(source.bootstrap_data)),
            extra: BTreeMap::new(),
        }),
        data_volume: None,
        extra: BTreeMap::new(),
    });

    let mut labels = machine.labels().clone();
    let cluster_name = &source.owner_machine.spec.cluster_name;
    if !cluster_name.is_empty() {
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.clone());
    }

    let mut annotations = machine.annotations().clone();
    if let Some(address) = source.node_address {
        render_annotations(&mut annotations, source.annotation_templates, address);
    }

    let mut vm = VirtualMachine::new(&name, spec);
    vm.metadata.namespace = Some(machine.vm_namespace());
    vm.metadata.labels = non_empty(labels);
    vm.metadata.annotations = non_empty(annotations);
    owner.stamp(&mut vm.metadata, placement);
    vm
}

/// The Service fronting the workload cluster's API servers
pub fn build_control_plane_service(
    cluster: &VirtinkCluster,
    owner_cluster: &Cluster,
    owner: &Owner,
    placement: Placement,
) -> Service {
    let template = &cluster.spec.control_plane_service_template;

    let mut metadata = ObjectMeta {
        name: Some(cluster.name_any()),
        namespace: cluster.namespace(),
        labels: non_empty(template.metadata.labels.clone()),
        annotations: non_empty(template.metadata.annotations.clone()),
        ..Default::default()
    };
    owner.stamp(&mut metadata, placement);

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(template.service_type().to_string()),
            selector: Some(BTreeMap::from([
                (CLUSTER_NAME_LABEL.to_string(), owner_cluster.name_any()),
                (CONTROL_PLANE_LABEL.to_string(), String::new()),
            ])),
            ports: Some(vec![ServicePort {
                port: CONTROL_PLANE_PORT,
                target_port: Some(IntOrString::Int(CONTROL_PLANE_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
