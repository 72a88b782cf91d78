//! VirtinkCluster reconciliation
//!
//! A VirtinkCluster owns the Service fronting the workload cluster's API
//! servers and the ledger of node addresses handed to its machines. The
//! ledger lives in `status.nodeAddresses` and is only ever written here, so
//! two machines can never be given the same address.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use capvirt_common::crd::capi::{Cluster, CAPI_GROUP};
use capvirt_common::crd::{ApiEndpoint, ServiceType, VirtinkCluster};
use capvirt_common::events::{actions, reasons};
use capvirt_common::ownership::{find_owner_reference, Owner};
use capvirt_common::{Error, CONTROL_PLANE_PORT};

use crate::address::allocate;
use crate::builder::build_control_plane_service;
use crate::client::Lookup;
use crate::context::Context;
use crate::infra::resolve_infra_client;
use crate::lifecycle::{
    add_finalizer, has_finalizer, remove_finalizer, requeue_after_error, FINALIZER_REQUEUE,
    PREREQUISITE_REQUEUE,
};
use crate::persist::ObjectPatch;

/// Requeue while a LoadBalancer Service has no ingress
pub const INGRESS_REQUEUE: Duration = Duration::from_secs(5);
/// Periodic resync of a ready cluster
pub const READY_REQUEUE: Duration = Duration::from_secs(60);

/// Reconcile a VirtinkCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<VirtinkCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    debug!("reconciling cluster");

    let mut working = cluster.as_ref().clone();
    let action = reconcile_cluster(&mut working, &ctx).await?;

    let patch = ObjectPatch::between(cluster.as_ref(), &working)?;
    if !patch.is_empty() {
        ctx.kube
            .patch_virtink_cluster(&namespace, &name, &patch)
            .await?;
    }
    Ok(action)
}

/// Error policy for the cluster controller
pub fn error_policy(cluster: Arc<VirtinkCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let object = format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    );
    requeue_after_error("VirtinkCluster", &object, error)
}

async fn reconcile_cluster(cluster: &mut VirtinkCluster, ctx: &Context) -> Result<Action, Error> {
    if cluster.meta().deletion_timestamp.is_some() {
        if !has_finalizer(cluster) {
            return Ok(Action::await_change());
        }
        return reconcile_delete(cluster, ctx).await;
    }

    if !has_finalizer(cluster) {
        info!("adding finalizer");
        add_finalizer(cluster);
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    reconcile_normal(cluster, ctx).await
}

async fn owner_cluster(cluster: &VirtinkCluster, ctx: &Context) -> Result<Lookup<Cluster>, Error> {
    let Some(owner) = find_owner_reference(cluster.meta(), CAPI_GROUP, "Cluster") else {
        return Ok(Lookup::NotFound);
    };
    let namespace = cluster.namespace().unwrap_or_default();
    Ok(ctx.kube.get_capi_cluster(&namespace, &owner.name).await?.into())
}

/// Host clients should use to reach the control plane through `service`
///
/// `None` while a LoadBalancer has not been given an ingress yet.
pub fn control_plane_host(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() == Some(ServiceType::LoadBalancer.as_str()) {
        let ingress = service
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .first()?;
        return ingress
            .ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| ingress.hostname.clone().filter(|h| !h.is_empty()));
    }
    spec.cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
}

async fn publish(
    ctx: &Context,
    cluster: &VirtinkCluster,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&cluster.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

async fn reconcile_normal(cluster: &mut VirtinkCluster, ctx: &Context) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let Lookup::Found(owner_cluster) = owner_cluster(cluster, ctx).await? else {
        debug!("waiting for the owner Cluster");
        return Ok(Action::requeue(PREREQUISITE_REQUEUE));
    };

    let infra = resolve_infra_client(
        ctx,
        cluster.spec.infra_cluster_secret_ref.as_ref(),
        &namespace,
    )
    .await?;
    let owner = Owner::of(&*cluster)?;

    let existing = infra
        .get_service(&namespace, &name)
        .await?
        .filter(|svc| owner.owns(&svc.metadata));
    let service = match existing {
        Some(service) => service,
        None => {
            let service =
                build_control_plane_service(cluster, &owner_cluster, &owner, infra.placement());
            let created = infra.create_service(&service).await?;
            let service_type = cluster.spec.control_plane_service_template.service_type();
            info!(%service_type, "created control plane Service");
            publish(
                ctx,
                cluster,
                EventType::Normal,
                reasons::CREATED_CONTROL_PLANE_SERVICE,
                actions::CREATE,
                format!("Created {service_type} Service {namespace}/{name}"),
            )
            .await;
            created
        }
    };

    let Some(host) = control_plane_host(&service) else {
        debug!("waiting for the control plane Service to get an address");
        return Ok(Action::requeue(INGRESS_REQUEUE));
    };
    if cluster.spec.control_plane_endpoint.as_ref().map(|e| e.host.as_str()) != Some(host.as_str()) {
        info!(%host, port = CONTROL_PLANE_PORT, "control plane endpoint known");
    }
    cluster.spec.control_plane_endpoint = Some(ApiEndpoint {
        host,
        port: CONTROL_PLANE_PORT,
    });

    if let Some(config) = cluster.spec.node_address_config.clone() {
        let machines = ctx
            .kube
            .list_virtink_machines(&namespace, &owner_cluster.name_any())
            .await?;
        let ledger = cluster
            .status
            .as_ref()
            .map(|s| s.node_addresses.clone())
            .unwrap_or_default();
        let id = format!("{namespace}/{name}");
        let allocated = {
            let mut rng = rand::thread_rng();
            allocate(&id, &config, &ledger, &machines, &mut rng)
        };
        let next = match allocated {
            Ok(next) => next,
            Err(error @ Error::AddressPoolExhausted { .. }) => {
                warn!(%error, "node address pool exhausted");
                publish(
                    ctx,
                    cluster,
                    EventType::Warning,
                    reasons::ADDRESS_POOL_EXHAUSTED,
                    actions::ALLOCATE,
                    error.to_string(),
                )
                .await;
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        for entry in next.iter().filter(|e| !ledger.contains(e)) {
            info!(machine = %entry.machine_name, ip = %entry.ip, "allocated node address");
        }
        cluster
            .status
            .get_or_insert_with(Default::default)
            .node_addresses = next;
    }

    cluster.status.get_or_insert_with(Default::default).ready = true;
    Ok(Action::requeue(READY_REQUEUE))
}

async fn reconcile_delete(cluster: &mut VirtinkCluster, ctx: &Context) -> Result<Action, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let owner = Owner::of(&*cluster)?;

    let infra = resolve_infra_client(
        ctx,
        cluster.spec.infra_cluster_secret_ref.as_ref(),
        &namespace,
    )
    .await?;

    match infra.get_service(&namespace, &name).await? {
        Some(service) if owner.owns(&service.metadata) => {
            infra.delete_service(&namespace, &name).await?;
            info!("deleted control plane Service");
            publish(
                ctx,
                cluster,
                EventType::Normal,
                reasons::DELETED_CONTROL_PLANE_SERVICE,
                actions::DELETE,
                format!("Deleted Service {namespace}/{name}"),
            )
            .await;
        }
        Some(_) => warn!("Service with this cluster's name belongs to someone else, leaving it"),
        None => debug!("control plane Service already gone"),
    }

    info!("removing finalizer");
    remove_finalizer(cluster);
    Ok(Action::await_change())
}
