//! Kubernetes Event recording for the capvirt reconcilers.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconcile pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting controller name shown on every Event
pub const CONTROLLER_NAME: &str = "capvirt-controller-manager";

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "CreatedVM")
    /// * `action` - What action was taken (e.g. "Create")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A DataVolume was created from a machine volume template
    pub const CREATED_DATA_VOLUME: &str = "CreatedDataVolume";
    /// A DataVolume owned by a machine was deleted
    pub const DELETED_DATA_VOLUME: &str = "DeletedDataVolume";
    /// The backing VirtualMachine was created
    pub const CREATED_VM: &str = "CreatedVM";
    /// The backing VirtualMachine was deleted
    pub const DELETED_VM: &str = "DeletedVM";
    /// The backing VirtualMachine reached a final state it will not leave
    pub const VM_FAILED: &str = "VMFailed";
    /// The control plane Service was created
    pub const CREATED_CONTROL_PLANE_SERVICE: &str = "CreatedControlPlaneService";
    /// The control plane Service was deleted
    pub const DELETED_CONTROL_PLANE_SERVICE: &str = "DeletedControlPlaneService";
    /// No address is left in the node address pool
    pub const ADDRESS_POOL_EXHAUSTED: &str = "AddressPoolExhausted";
}

/// Well-known event action strings.
pub mod actions {
    /// A dependent object was created
    pub const CREATE: &str = "Create";
    /// A dependent object was deleted
    pub const DELETE: &str = "Delete";
    /// Status was projected from a dependent object
    pub const RECONCILE: &str = "Reconcile";
    /// Node addresses were allocated
    pub const ALLOCATE: &str = "Allocate";
}
