//! Store access used by the reconcilers
//!
//! Two traits split the stores a pass talks to. [`KubeClient`] is always the
//! management cluster: the Cluster API owner chain, bootstrap and credential
//! Secrets, and the provider's own objects. [`InfraClient`] is whichever
//! cluster holds the VMs, DataVolumes and the control plane Service; it is
//! the management cluster unless a VirtinkCluster points at a kubeconfig.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

use capvirt_common::crd::capi::{Cluster, Machine};
use capvirt_common::crd::cdi::DataVolume;
use capvirt_common::crd::virtink::VirtualMachine;
use capvirt_common::crd::{VirtinkCluster, VirtinkMachine};
use capvirt_common::ownership::Placement;
use capvirt_common::{Error, CLUSTER_NAME_LABEL};

use crate::persist::{apply_patch, ObjectPatch};

/// Outcome of following a reference to another object
///
/// Transient store failures are reported through the surrounding `Result`,
/// so a caller always knows whether "absent" is an answer or a guess.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup<T> {
    /// The referenced object exists
    Found(T),
    /// The reference is unset or points at nothing
    NotFound,
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Lookup::NotFound, Lookup::Found)
    }
}

/// Management cluster operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Cluster API Machine
    async fn get_capi_machine(&self, namespace: &str, name: &str)
        -> Result<Option<Machine>, Error>;

    /// Get a Cluster API Cluster
    async fn get_capi_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<Cluster>, Error>;

    /// Get a VirtinkCluster
    async fn get_virtink_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtinkCluster>, Error>;

    /// List the VirtinkMachines labeled as members of a Cluster API cluster
    async fn list_virtink_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<VirtinkMachine>, Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Persist the changes a pass made to a VirtinkMachine
    async fn patch_virtink_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error>;

    /// Persist the changes a pass made to a VirtinkCluster
    async fn patch_virtink_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error>;
}

/// Operations on the cluster that runs the VMs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraClient: Send + Sync {
    /// Where objects created through this client live relative to the
    /// provider's own objects
    fn placement(&self) -> Placement;

    /// Get a Virtink VirtualMachine
    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error>;

    /// Create a Virtink VirtualMachine
    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error>;

    /// Delete a Virtink VirtualMachine; absent VMs are not an error
    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a CDI DataVolume
    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, Error>;

    /// Create a CDI DataVolume
    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume, Error>;

    /// Delete a CDI DataVolume; absent volumes are not an error
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Delete a Service; absent Services are not an error
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

async fn get_opt<K>(client: &Client, namespace: &str, name: &str) -> Result<Option<K>, Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.get_opt(name)
        .await
        .map_err(|e| Error::store(format!("get {} {namespace}/{name}", K::kind(&())), e))
}

async fn create<K>(client: &Client, obj: &K) -> Result<K, Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + serde::Serialize
        + std::fmt::Debug,
{
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let name = obj.meta().name.clone().unwrap_or_default();
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    api.create(&PostParams::default(), obj)
        .await
        .map_err(|e| Error::store(format!("create {} {namespace}/{name}", K::kind(&())), e))
}

async fn delete<K>(client: &Client, namespace: &str, name: &str) -> Result<(), Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(Error::store(
            format!("delete {} {namespace}/{name}", K::kind(&())),
            e,
        )),
    }
}

/// Real Kubernetes client implementation of [`KubeClient`]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_capi_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Machine>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn get_capi_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Cluster>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn get_virtink_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtinkCluster>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn list_virtink_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<VirtinkMachine>, Error> {
        let api: Api<VirtinkMachine> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        let list = api.list(&params).await.map_err(|e| {
            Error::store(
                format!("list VirtinkMachines of cluster {namespace}/{cluster_name}"),
                e,
            )
        })?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn patch_virtink_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error> {
        let api: Api<VirtinkMachine> = Api::namespaced(self.client.clone(), namespace);
        apply_patch(&api, name, patch).await
    }

    async fn patch_virtink_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error> {
        let api: Api<VirtinkCluster> = Api::namespaced(self.client.clone(), namespace);
        apply_patch(&api, name, patch).await
    }
}

/// Real Kubernetes client implementation of [`InfraClient`]
pub struct InfraClientImpl {
    client: Client,
    placement: Placement,
}

impl InfraClientImpl {
    /// Client for VMs living next to the provider's own objects
    pub fn management(client: Client) -> Self {
        Self {
            client,
            placement: Placement::Local,
        }
    }

    /// Client for a separate infrastructure cluster
    pub fn remote(client: Client) -> Self {
        Self {
            client,
            placement: Placement::Remote,
        }
    }
}

#[async_trait]
impl InfraClient for InfraClientImpl {
    fn placement(&self) -> Placement {
        self.placement
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error> {
        create(&self.client, vm).await
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete::<VirtualMachine>(&self.client, namespace, name).await
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume, Error> {
        create(&self.client, dv).await
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete::<DataVolume>(&self.client, namespace, name).await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        get_opt(&self.client, namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        create(&self.client, service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete::<Service>(&self.client, namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_from_option() {
        assert_eq!(Lookup::from(Some(3)), Lookup::Found(3));
        assert_eq!(Lookup::<i32>::from(None), Lookup::NotFound);
    }
}
