//! Shared state handed to every reconcile pass

use std::sync::Arc;

use kube::Client;

use capvirt_common::events::{EventPublisher, KubeEventPublisher, CONTROLLER_NAME};

use crate::client::{InfraClient, InfraClientImpl, KubeClient, KubeClientImpl};
use crate::infra::{InfraConnector, KubeconfigConnector};

/// Controller context shared by the cluster and machine reconcilers
pub struct Context {
    /// Management cluster operations
    pub kube: Arc<dyn KubeClient>,
    /// VM, volume and Service operations against the management cluster
    pub management_infra: Arc<dyn InfraClient>,
    /// Builds clients for separate infrastructure clusters
    pub connector: Arc<dyn InfraConnector>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context with every collaborator backed by `client`
    pub fn new(client: Client) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client.clone())),
            management_infra: Arc::new(InfraClientImpl::management(client.clone())),
            connector: Arc::new(KubeconfigConnector),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        management_infra: Arc<dyn InfraClient>,
        connector: Arc<dyn InfraConnector>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            management_infra,
            connector,
            events,
        }
    }
}
