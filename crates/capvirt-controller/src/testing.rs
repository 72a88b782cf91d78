//! Test doubles shared by the reconciler tests
//!
//! The management cluster is a `MockKubeClient` answering from a shared
//! [`World`]; the infrastructure cluster is an in-memory [`FakeInfra`] that
//! assigns UIDs on create and logs every mutation in order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, Secret, Service, ServiceStatus,
};
use k8s_openapi::ByteString;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use capvirt_common::crd::capi::{Cluster, Machine};
use capvirt_common::crd::cdi::DataVolume;
use capvirt_common::crd::virtink::{VirtualMachine, VirtualMachineStatus, VmPhase};
use capvirt_common::crd::{VirtinkCluster, VirtinkMachine};
use capvirt_common::events::EventPublisher;
use capvirt_common::ownership::Placement;
use capvirt_common::Error;

use crate::client::{InfraClient, MockKubeClient};
use crate::persist::ObjectPatch;

/// Namespace every fixture lives in
pub(crate) const NS: &str = "capi";

pub(crate) fn secret(key: &str, value: &[u8]) -> Secret {
    Secret {
        data: Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))])),
        ..Default::default()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn conflict(what: &str) -> kube::Error {
    api_error(409, "AlreadyExists", format!("{what} already exists"))
}

fn stale(what: &str) -> Error {
    Error::store(
        format!("patch {what}"),
        api_error(409, "Conflict", "the object has been modified".to_string()),
    )
}

fn unavailable(what: &str) -> Error {
    Error::store(
        format!("get {what}"),
        api_error(503, "ServiceUnavailable", "etcdserver: leader changed".to_string()),
    )
}

/// State of the management cluster as seen by `MockKubeClient`
#[derive(Default)]
pub(crate) struct World {
    pub capi_machines: BTreeMap<String, Machine>,
    pub capi_clusters: BTreeMap<String, Cluster>,
    pub virtink_clusters: BTreeMap<String, VirtinkCluster>,
    pub virtink_machines: Vec<VirtinkMachine>,
    pub secrets: BTreeMap<String, Secret>,
    pub machine_patches: Vec<ObjectPatch>,
    pub cluster_patches: Vec<ObjectPatch>,
    /// Patches fail with 409 as if another writer got there first
    pub stale_patches: bool,
    /// Reads of Cluster API Machines fail with 503
    pub machines_unavailable: bool,
}

pub(crate) type SharedWorld = Arc<Mutex<World>>;

/// `MockKubeClient` reading from and recording into `world`
pub(crate) fn mock_kube(world: &SharedWorld) -> MockKubeClient {
    let mut mock = MockKubeClient::new();

    let w = Arc::clone(world);
    mock.expect_get_capi_machine().returning(move |_, name| {
        let world = w.lock().expect("world");
        if world.machines_unavailable {
            return Err(unavailable(&format!("Machine {name}")));
        }
        Ok(world.capi_machines.get(name).cloned())
    });
    let w = Arc::clone(world);
    mock.expect_get_capi_cluster()
        .returning(move |_, name| Ok(w.lock().expect("world").capi_clusters.get(name).cloned()));
    let w = Arc::clone(world);
    mock.expect_get_virtink_cluster().returning(move |_, name| {
        Ok(w.lock().expect("world").virtink_clusters.get(name).cloned())
    });
    let w = Arc::clone(world);
    mock.expect_list_virtink_machines().returning(move |_, cluster_name| {
        Ok(w.lock()
            .expect("world")
            .virtink_machines
            .iter()
            .filter(|m| m.cluster_name() == Some(cluster_name))
            .cloned()
            .collect())
    });
    let w = Arc::clone(world);
    mock.expect_get_secret()
        .returning(move |_, name| Ok(w.lock().expect("world").secrets.get(name).cloned()));
    let w = Arc::clone(world);
    mock.expect_patch_virtink_machine().returning(move |_, name, patch| {
        let mut world = w.lock().expect("world");
        if world.stale_patches {
            return Err(stale(&format!("VirtinkMachine {name}")));
        }
        world.machine_patches.push(patch.clone());
        Ok(())
    });
    let w = Arc::clone(world);
    mock.expect_patch_virtink_cluster().returning(move |_, name, patch| {
        let mut world = w.lock().expect("world");
        if world.stale_patches {
            return Err(stale(&format!("VirtinkCluster {name}")));
        }
        world.cluster_patches.push(patch.clone());
        Ok(())
    });

    mock
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            if value.is_null() {
                existing.remove(key);
            } else {
                merge_patch(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// What the API server would store after `patch`
pub(crate) fn apply_patch_to<K>(obj: &K, patch: &ObjectPatch) -> K
where
    K: Resource + Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(obj).expect("serializable");
    if let Some(object) = &patch.object {
        merge_patch(&mut value, object);
    }
    if let Some(status) = &patch.status {
        let mut wrapped = Map::new();
        wrapped.insert("status".to_string(), status.clone());
        merge_patch(&mut value, &Value::Object(wrapped));
    }
    let mut next: K = serde_json::from_value(value).expect("deserializable");
    let version = obj
        .meta()
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    next.meta_mut().resource_version = Some((version + 1).to_string());
    next
}

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct InfraState {
    vms: BTreeMap<Key, VirtualMachine>,
    data_volumes: BTreeMap<Key, DataVolume>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    services: BTreeMap<Key, Service>,
    log: Vec<String>,
    next_uid: u32,
}

impl InfraState {
    fn stamp<K: Resource>(&mut self, obj: &mut K) {
        self.next_uid += 1;
        obj.meta_mut().uid = Some(format!("uid-{}", self.next_uid));
        obj.meta_mut().resource_version = Some("1".to_string());
    }
}

/// In-memory infrastructure cluster
pub(crate) struct FakeInfra {
    placement: Placement,
    state: Mutex<InfraState>,
}

impl FakeInfra {
    pub fn new(placement: Placement) -> Self {
        Self {
            placement,
            state: Mutex::new(InfraState::default()),
        }
    }

    /// Every create and delete, in order, as `"<verb> <Kind> <ns>/<name>"`
    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("infra").log.clone()
    }

    pub fn insert_vm(&self, mut vm: VirtualMachine) {
        let mut state = self.state.lock().expect("infra");
        if vm.metadata.uid.is_none() {
            state.stamp(&mut vm);
        }
        state.vms.insert(key_of(&vm), vm);
    }

    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        self.state.lock().expect("infra").pvcs.insert(key_of(&pvc), pvc);
    }

    pub fn insert_service(&self, service: Service) {
        self.state
            .lock()
            .expect("infra")
            .services
            .insert(key_of(&service), service);
    }

    pub fn vm(&self, namespace: &str, name: &str) -> Option<VirtualMachine> {
        self.state
            .lock()
            .expect("infra")
            .vms
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn data_volume(&self, namespace: &str, name: &str) -> Option<DataVolume> {
        self.state
            .lock()
            .expect("infra")
            .data_volumes
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .expect("infra")
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn set_vm_phase(&self, namespace: &str, name: &str, phase: VmPhase) {
        let mut state = self.state.lock().expect("infra");
        if let Some(vm) = state.vms.get_mut(&key(namespace, name)) {
            vm.status = Some(VirtualMachineStatus {
                phase: Some(phase),
                ..Default::default()
            });
        }
    }

    pub fn set_load_balancer_ingress(&self, namespace: &str, name: &str, ip: &str) {
        let mut state = self.state.lock().expect("infra");
        if let Some(service) = state.services.get_mut(&key(namespace, name)) {
            let ingress = k8s_openapi::api::core::v1::LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            };
            service.status = Some(ServiceStatus {
                load_balancer: Some(k8s_openapi::api::core::v1::LoadBalancerStatus {
                    ingress: Some(vec![ingress]),
                }),
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl InfraClient for FakeInfra {
    fn placement(&self) -> Placement {
        self.placement
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        Ok(self.vm(namespace, name))
    }

    async fn create_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error> {
        let mut state = self.state.lock().expect("infra");
        let k = key_of(vm);
        if state.vms.contains_key(&k) {
            return Err(Error::store("create VirtualMachine", conflict(&vm.name_any())));
        }
        let mut created = vm.clone();
        state.stamp(&mut created);
        state.log.push(format!("create VirtualMachine {}/{}", k.0, k.1));
        state.vms.insert(k, created.clone());
        Ok(created)
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().expect("infra");
        if state.vms.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete VirtualMachine {namespace}/{name}"));
        }
        Ok(())
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, Error> {
        Ok(self.data_volume(namespace, name))
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume, Error> {
        let mut state = self.state.lock().expect("infra");
        let k = key_of(dv);
        if state.data_volumes.contains_key(&k) {
            return Err(Error::store("create DataVolume", conflict(&dv.name_any())));
        }
        let mut created = dv.clone();
        state.stamp(&mut created);
        state.log.push(format!("create DataVolume {}/{}", k.0, k.1));
        state.data_volumes.insert(k, created.clone());
        Ok(created)
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().expect("infra");
        if state.data_volumes.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete DataVolume {namespace}/{name}"));
        }
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self
            .state
            .lock()
            .expect("infra")
            .pvcs
            .get(&key(namespace, name))
            .cloned())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let mut state = self.state.lock().expect("infra");
        let k = key_of(service);
        if state.services.contains_key(&k) {
            return Err(Error::store("create Service", conflict(&service.name_any())));
        }
        let mut created = service.clone();
        state.stamp(&mut created);
        if let Some(spec) = created.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.10".to_string());
        }
        state.log.push(format!("create Service {}/{}", k.0, k.1));
        state.services.insert(k, created.clone());
        Ok(created)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().expect("infra");
        if state.services.remove(&key(namespace, name)).is_some() {
            state.log.push(format!("delete Service {namespace}/{name}"));
        }
        Ok(())
    }
}

/// A published event
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedEvent {
    pub reason: String,
    pub warning: bool,
    pub note: Option<String>,
}

/// Event publisher keeping everything it was given
#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("events")
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("events").clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().expect("events").push(RecordedEvent {
            reason: reason.to_string(),
            warning: matches!(type_, EventType::Warning),
            note,
        });
    }
}
