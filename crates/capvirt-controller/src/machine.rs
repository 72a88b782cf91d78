//! VirtinkMachine reconciliation
//!
//! Each pass works on a copy of the machine, walks it through
//! registration, prerequisite checks, volume and VM provisioning and status
//! projection, then persists whatever changed in one patch. Dependents are
//! found by derived name and only treated as the machine's own when their
//! provenance says so.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use capvirt_common::crd::capi::{Cluster, Machine, CAPI_GROUP};
use capvirt_common::crd::virtink::{RunPolicy, VirtualMachine, VmPhase};
use capvirt_common::crd::{VirtinkCluster, VirtinkMachine};
use capvirt_common::events::{actions, reasons};
use capvirt_common::kube_utils::secret_value;
use capvirt_common::ownership::{find_owner_reference, Owner};
use capvirt_common::{Error, BOOTSTRAP_DATA_KEY, PROVIDER_ID_SCHEME};

use crate::address::{needs_address, render_annotations, validate_template};
use crate::builder::{build_data_volumes, build_vm, data_volume_name, VmSource};
use crate::client::{InfraClient, Lookup};
use crate::context::Context;
use crate::infra::resolve_infra_client;
use crate::lifecycle::{
    add_finalizer, has_finalizer, remove_finalizer, requeue_after_error, FINALIZER_REQUEUE,
    PREREQUISITE_REQUEUE,
};
use crate::persist::ObjectPatch;

/// Requeue while the VM is being created or started
pub const VM_PENDING_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue while an owned VM is being deleted
pub const VM_DELETION_REQUEUE: Duration = Duration::from_secs(5);
/// Periodic resync of a healthy machine
pub const HEALTHY_REQUEUE: Duration = Duration::from_secs(30);

/// `status.failureReason` of a machine whose VM stopped for good
pub const TERMINAL_FAILURE_REASON: &str = "UpdateError";
/// `status.failureMessage` of a machine whose VM stopped for good
pub const TERMINAL_FAILURE_MESSAGE: &str = "VM has reached final state";

/// What a VM phase means for the machine, given the VM's run policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    /// Not running yet, or phase unknown
    Provisioning,
    /// Guest is up
    Ready,
    /// Guest stopped and Virtink will start it again
    Restarting,
    /// Guest stopped and will never run again
    Terminal,
}

/// Map a VM phase to the machine's state
///
/// Phases this client does not know are never treated as ready.
pub fn project_phase(phase: VmPhase, policy: RunPolicy) -> Projection {
    match phase {
        VmPhase::Pending | VmPhase::Scheduling | VmPhase::Scheduled | VmPhase::Unknown => {
            Projection::Provisioning
        }
        VmPhase::Running => Projection::Ready,
        VmPhase::Failed => match policy {
            RunPolicy::Halted | RunPolicy::Once => Projection::Terminal,
            RunPolicy::Always | RunPolicy::RerunOnFailure | RunPolicy::Manual => {
                Projection::Restarting
            }
        },
        VmPhase::Succeeded => match policy {
            RunPolicy::Halted | RunPolicy::Once | RunPolicy::RerunOnFailure => {
                Projection::Terminal
            }
            RunPolicy::Always | RunPolicy::Manual => Projection::Restarting,
        },
    }
}

/// Reconcile a VirtinkMachine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<VirtinkMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    debug!("reconciling machine");

    let mut working = machine.as_ref().clone();
    let action = reconcile_machine(&mut working, &ctx).await?;

    let patch = ObjectPatch::between(machine.as_ref(), &working)?;
    if !patch.is_empty() {
        ctx.kube
            .patch_virtink_machine(&namespace, &name, &patch)
            .await?;
    }

    // Announced only after the failure is stored
    if working.has_failed() && !machine.has_failed() {
        publish(
            &ctx,
            &working,
            EventType::Warning,
            reasons::VM_FAILED,
            actions::RECONCILE,
            format!("VM of machine {namespace}/{name} has reached a final state"),
        )
        .await;
    }
    Ok(action)
}

/// Error policy for the machine controller
pub fn error_policy(machine: Arc<VirtinkMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    let object = format!(
        "{}/{}",
        machine.namespace().unwrap_or_default(),
        machine.name_any()
    );
    requeue_after_error("VirtinkMachine", &object, error)
}

async fn reconcile_machine(machine: &mut VirtinkMachine, ctx: &Context) -> Result<Action, Error> {
    if machine.meta().deletion_timestamp.is_some() {
        if !has_finalizer(machine) {
            return Ok(Action::await_change());
        }
        return reconcile_delete(machine, ctx).await;
    }

    if !has_finalizer(machine) {
        info!("adding finalizer");
        add_finalizer(machine);
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    if machine.has_failed() {
        debug!("machine has failed, waiting for it to be replaced");
        return Ok(Action::await_change());
    }

    reconcile_normal(machine, ctx).await
}

async fn owner_machine(machine: &VirtinkMachine, ctx: &Context) -> Result<Lookup<Machine>, Error> {
    let Some(owner) = find_owner_reference(machine.meta(), CAPI_GROUP, "Machine") else {
        return Ok(Lookup::NotFound);
    };
    let namespace = machine.namespace().unwrap_or_default();
    Ok(ctx.kube.get_capi_machine(&namespace, &owner.name).await?.into())
}

async fn capi_cluster(machine: &VirtinkMachine, ctx: &Context) -> Result<Lookup<Cluster>, Error> {
    let Some(cluster_name) = machine.cluster_name() else {
        return Ok(Lookup::NotFound);
    };
    let namespace = machine.namespace().unwrap_or_default();
    Ok(ctx.kube.get_capi_cluster(&namespace, cluster_name).await?.into())
}

async fn virtink_cluster(
    cluster: &Cluster,
    default_namespace: &str,
    ctx: &Context,
) -> Result<Lookup<VirtinkCluster>, Error> {
    let Some(infra_ref) = cluster.spec.infrastructure_ref.as_ref() else {
        return Ok(Lookup::NotFound);
    };
    if infra_ref.kind.as_deref() != Some("VirtinkCluster") {
        return Ok(Lookup::NotFound);
    }
    let Some(name) = infra_ref.name.as_deref() else {
        return Ok(Lookup::NotFound);
    };
    let namespace = infra_ref
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(default_namespace);
    Ok(ctx.kube.get_virtink_cluster(namespace, name).await?.into())
}

async fn publish(
    ctx: &Context,
    machine: &VirtinkMachine,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&machine.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

async fn reconcile_normal(machine: &mut VirtinkMachine, ctx: &Context) -> Result<Action, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let Lookup::Found(owner_machine) = owner_machine(machine, ctx).await? else {
        debug!("waiting for the owner Machine");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    };
    let Lookup::Found(cluster) = capi_cluster(machine, ctx).await? else {
        debug!("waiting for the Cluster");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    };
    if !cluster.infrastructure_ready() {
        debug!(cluster = %cluster.name_any(), "cluster infrastructure not ready yet");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    }
    let Some(secret_name) = owner_machine.spec.bootstrap.data_secret_name.clone() else {
        debug!("waiting for bootstrap data");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    };
    let Lookup::Found(infra_cluster) = virtink_cluster(&cluster, &namespace, ctx).await? else {
        debug!(cluster = %cluster.name_any(), "waiting for the VirtinkCluster");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    };

    let templates = infra_cluster.annotation_templates();
    for template in templates {
        validate_template(&template.value)?;
    }
    let node_address = infra_cluster.address_of(&name).cloned();
    if node_address.is_none() && needs_address(machine, templates) {
        debug!("waiting for a node address");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    }

    let infra = resolve_infra_client(
        ctx,
        infra_cluster.spec.infra_cluster_secret_ref.as_ref(),
        &namespace,
    )
    .await?;
    let owner = Owner::of(&*machine)?;
    let vm_namespace = machine.vm_namespace();

    let vm = infra
        .get_vm(&vm_namespace, &name)
        .await?
        .filter(|vm| owner.owns(&vm.metadata));

    let bootstrap_data = match vm {
        Some(_) => None,
        None => {
            let Some(secret) = ctx.kube.get_secret(&namespace, &secret_name).await? else {
                debug!(secret = %secret_name, "waiting for the bootstrap Secret");
                return Ok(Action::requeue(PREREQUISITE_REQUEUE));
            };
            let Some(data) = secret_value(&secret, BOOTSTRAP_DATA_KEY) else {
                debug!(secret = %secret_name, "bootstrap Secret has no data yet");
                return Ok(Action::requeue(PREREQUISITE_REQUEUE));
            };
            Some(data.to_vec())
        }
    };

    if let Some(address) = &node_address {
        let mut annotations = machine.annotations().clone();
        render_annotations(&mut annotations, templates, address);
        if annotations != *machine.annotations() {
            debug!(ip = %address.ip, "rendering node address into annotations");
            machine.metadata.annotations = Some(annotations);
        }
    }

    ensure_data_volumes(machine, &owner, infra.as_ref(), ctx).await?;

    let vm = match (vm, bootstrap_data) {
        (Some(vm), _) => vm,
        (None, data) => {
            let source = VmSource {
                machine,
                owner_machine: &owner_machine,
                node_address: node_address.as_ref(),
                annotation_templates: templates,
                bootstrap_data: data.as_deref().unwrap_or_default(),
            };
            let vm = build_vm(&source, &owner, infra.placement());
            infra.create_vm(&vm).await?;
            info!(namespace = %vm_namespace, "created VirtualMachine");
            publish(
                ctx,
                machine,
                EventType::Normal,
                reasons::CREATED_VM,
                actions::CREATE,
                format!("Created VM {vm_namespace}/{name}"),
            )
            .await;
            return Ok(Action::requeue(VM_PENDING_REQUEUE));
        }
    };

    project_status(machine, &vm)
}

async fn ensure_data_volumes(
    machine: &VirtinkMachine,
    owner: &Owner,
    infra: &dyn InfraClient,
    ctx: &Context,
) -> Result<(), Error> {
    for dv in build_data_volumes(machine, owner, infra.placement())? {
        let namespace = dv.namespace().unwrap_or_default();
        let dv_name = dv.name_any();

        if let Some(existing) = infra.get_data_volume(&namespace, &dv_name).await? {
            if owner.owns(&existing.metadata) {
                continue;
            }
            warn!(data_volume = %dv_name, "DataVolume exists but belongs to someone else");
        }
        if infra.get_pvc(&namespace, &dv_name).await?.is_some() {
            debug!(data_volume = %dv_name, "volume already populated");
            continue;
        }

        infra.create_data_volume(&dv).await?;
        info!(data_volume = %dv_name, "created DataVolume");
        publish(
            ctx,
            machine,
            EventType::Normal,
            reasons::CREATED_DATA_VOLUME,
            actions::CREATE,
            format!("Created DataVolume {namespace}/{dv_name}"),
        )
        .await;
    }
    Ok(())
}

fn project_status(machine: &mut VirtinkMachine, vm: &VirtualMachine) -> Result<Action, Error> {
    let uid = vm.metadata.uid.as_deref().ok_or_else(|| {
        Error::internal_with_context("VirtualMachine", format!("{} has no uid", vm.name_any()))
    })?;
    machine.spec.provider_id = Some(format!("{PROVIDER_ID_SCHEME}://{uid}"));

    let phase = vm.phase();
    let policy = vm.spec.effective_run_policy();
    let status = machine.status.get_or_insert_with(Default::default);

    match project_phase(phase, policy) {
        Projection::Provisioning => {
            debug!(?phase, "VM not running yet");
            status.ready = false;
            Ok(Action::requeue(VM_PENDING_REQUEUE))
        }
        Projection::Restarting => {
            debug!(?phase, ?policy, "VM stopped and will be restarted");
            status.ready = false;
            Ok(Action::requeue(VM_PENDING_REQUEUE))
        }
        Projection::Ready => {
            if !status.ready {
                info!("VM is running, machine ready");
            }
            status.ready = true;
            Ok(Action::requeue(HEALTHY_REQUEUE))
        }
        Projection::Terminal => {
            warn!(?phase, ?policy, "VM has reached a final state");
            status.ready = false;
            status.failure_reason = Some(TERMINAL_FAILURE_REASON.to_string());
            status.failure_message = Some(TERMINAL_FAILURE_MESSAGE.to_string());
            Ok(Action::await_change())
        }
    }
}

/// Infra client for a machine being deleted
///
/// Falls back to the management store when the cluster chain is already
/// gone.
async fn deletion_infra(
    machine: &VirtinkMachine,
    ctx: &Context,
) -> Result<Arc<dyn InfraClient>, Error> {
    let namespace = machine.namespace().unwrap_or_default();
    let infra_cluster = match capi_cluster(machine, ctx).await? {
        Lookup::Found(cluster) => virtink_cluster(&cluster, &namespace, ctx).await?,
        Lookup::NotFound => Lookup::NotFound,
    };
    match infra_cluster {
        Lookup::Found(infra_cluster) => {
            resolve_infra_client(
                ctx,
                infra_cluster.spec.infra_cluster_secret_ref.as_ref(),
                &namespace,
            )
            .await
        }
        Lookup::NotFound => {
            warn!("VirtinkCluster no longer resolvable, cleaning up in the management cluster");
            Ok(Arc::clone(&ctx.management_infra))
        }
    }
}

async fn reconcile_delete(machine: &mut VirtinkMachine, ctx: &Context) -> Result<Action, Error> {
    let name = machine.name_any();
    let vm_namespace = machine.vm_namespace();
    let owner = Owner::of(&*machine)?;
    let infra = deletion_infra(machine, ctx).await?;

    if let Some(vm) = infra.get_vm(&vm_namespace, &name).await? {
        if owner.owns(&vm.metadata) {
            if vm.metadata.deletion_timestamp.is_none() {
                infra.delete_vm(&vm_namespace, &name).await?;
                info!(namespace = %vm_namespace, "deleted VirtualMachine");
                publish(
                    ctx,
                    machine,
                    EventType::Normal,
                    reasons::DELETED_VM,
                    actions::DELETE,
                    format!("Deleted VM {vm_namespace}/{name}"),
                )
                .await;
            }
            return Ok(Action::requeue(VM_DELETION_REQUEUE));
        }
        warn!("VM with this machine's name belongs to someone else, leaving it");
    }

    let volume_names = machine
        .spec
        .volume_templates
        .iter()
        .filter_map(|t| t.data_volume.as_ref())
        .filter(|dv| !dv.metadata.name.is_empty())
        .map(|dv| data_volume_name(&name, &dv.metadata.name));
    for dv_name in volume_names {
        let Some(dv) = infra.get_data_volume(&vm_namespace, &dv_name).await? else {
            continue;
        };
        if !owner.owns(&dv.metadata) {
            continue;
        }
        infra.delete_data_volume(&vm_namespace, &dv_name).await?;
        info!(data_volume = %dv_name, "deleted DataVolume");
        publish(
            ctx,
            machine,
            EventType::Normal,
            reasons::DELETED_DATA_VOLUME,
            actions::DELETE,
            format!("Deleted DataVolume {vm_namespace}/{dv_name}"),
        )
        .await;
    }

    info!("removing finalizer");
    remove_finalizer(machine);
    Ok(Action::await_change())
}
