//! Controller runner - builds the controller futures of the provider
//!
//! Construction stays separate from `main` so the watch mappings can be
//! tested without a cluster.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use capvirt_common::crd::capi::CAPI_GROUP;
use capvirt_common::crd::{VirtinkCluster, VirtinkMachine};
use capvirt_common::ownership::find_owner_reference;
use capvirt_controller::{cluster, machine, Context};

/// Watcher timeout (seconds) - must be less than the client read timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be polled
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// VirtinkClusters a machine event should wake up
///
/// A cluster matches when it lives in the machine's namespace and is owned by
/// the Cluster API cluster named in the machine's cluster-name label.
pub fn clusters_for_machine(
    clusters: &[Arc<VirtinkCluster>],
    machine: &VirtinkMachine,
) -> Vec<ObjectRef<VirtinkCluster>> {
    let (Some(namespace), Some(cluster_name)) = (machine.namespace(), machine.cluster_name())
    else {
        return Vec::new();
    };
    clusters
        .iter()
        .filter(|c| c.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|c| {
            find_owner_reference(c.meta(), CAPI_GROUP, "Cluster")
                .is_some_and(|owner| owner.name == cluster_name)
        })
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}

/// Build the VirtinkCluster and VirtinkMachine controllers
///
/// Machine changes also trigger their cluster, so new machines are given an
/// address without waiting for the periodic resync.
pub fn build_controllers(client: Client, concurrency: u16) -> Vec<ControllerFuture> {
    let ctx = Arc::new(Context::new(client.clone()));
    let config = ControllerConfig::default().concurrency(concurrency);

    let clusters: Api<VirtinkCluster> = Api::all(client.clone());
    let machines: Api<VirtinkMachine> = Api::all(client);

    tracing::info!(concurrency, "- VirtinkCluster controller");
    let cluster_controller = Controller::new(clusters, watcher_config()).with_config(config.clone());
    let store = cluster_controller.store();
    let cluster_controller = cluster_controller
        .watches(machines.clone(), watcher_config(), move |machine| {
            clusters_for_machine(&store.state(), &machine)
        })
        .shutdown_on_signal()
        .run(cluster::reconcile, cluster::error_policy, Arc::clone(&ctx))
        .for_each(log_reconcile_result("VirtinkCluster"));

    tracing::info!(concurrency, "- VirtinkMachine controller");
    let machine_controller = Controller::new(machines, watcher_config())
        .with_config(config)
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, ctx)
        .for_each(log_reconcile_result("VirtinkMachine"));

    vec![Box::pin(cluster_controller), Box::pin(machine_controller)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvirt_common::crd::{VirtinkClusterSpec, VirtinkMachineSpec};
    use capvirt_common::CLUSTER_NAME_LABEL;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn cluster(namespace: &str, name: &str, owner: &str) -> Arc<VirtinkCluster> {
        let mut c = VirtinkCluster::new(name, VirtinkClusterSpec::default());
        c.metadata.namespace = Some(namespace.to_string());
        c.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "cluster.x-k8s.io/v1beta1".to_string(),
            kind: "Cluster".to_string(),
            name: owner.to_string(),
            uid: format!("uid-{owner}"),
            ..Default::default()
        }]);
        Arc::new(c)
    }

    fn machine(namespace: &str, cluster_name: Option<&str>) -> VirtinkMachine {
        let mut m = VirtinkMachine::new("m-0", VirtinkMachineSpec::default());
        m.metadata.namespace = Some(namespace.to_string());
        m.metadata.labels = cluster_name
            .map(|name| BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), name.to_string())]));
        m
    }

    #[test]
    fn machine_wakes_the_cluster_owned_by_its_capi_cluster() {
        let clusters = vec![
            cluster("capi", "demo-infra", "demo"),
            cluster("capi", "other-infra", "other"),
            cluster("elsewhere", "demo-infra", "demo"),
        ];

        let refs = clusters_for_machine(&clusters, &machine("capi", Some("demo")));
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "demo-infra");
        assert_eq!(refs[0].namespace.as_deref(), Some("capi"));
    }

    #[test]
    fn unlabeled_machine_wakes_nothing() {
        let clusters = vec![cluster("capi", "demo-infra", "demo")];
        assert!(clusters_for_machine(&clusters, &machine("capi", None)).is_empty());
    }
}
