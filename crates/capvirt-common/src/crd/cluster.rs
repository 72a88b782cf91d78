//! VirtinkCluster Custom Resource Definition
//!
//! A VirtinkCluster is the infrastructure counterpart of a Cluster API
//! `Cluster`. It owns the Service fronting the workload control plane and the
//! ledger of static node addresses handed out to the cluster's machines.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::TemplateMeta;

/// Specification for a VirtinkCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VirtinkCluster",
    plural = "virtinkclusters",
    shortname = "vc",
    status = "VirtinkClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.controlPlaneEndpoint.port"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtinkClusterSpec {
    /// Endpoint of the workload cluster API server, filled in by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// Metadata and type of the Service fronting the control plane machines
    #[serde(default)]
    pub control_plane_service_template: ControlPlaneServiceTemplate,

    /// Secret holding a kubeconfig for the cluster that runs the VMs
    ///
    /// When absent, VMs, volumes and the control plane Service are created in
    /// the management cluster itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_cluster_secret_ref: Option<SecretReference>,

    /// Static node addresses handed out to the cluster's machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_address_config: Option<NodeAddressConfig>,
}

/// Host and port of an API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: i32,
}

impl ApiEndpoint {
    /// Whether both host and port are set
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// Template for the Service fronting the control plane machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneServiceTemplate {
    /// Labels and annotations copied onto the Service
    #[serde(default)]
    pub metadata: TemplateMeta,

    /// Service type, NodePort when unset
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<ServiceType>,
}

impl ControlPlaneServiceTemplate {
    /// Effective Service type
    pub fn service_type(&self) -> ServiceType {
        self.type_.unwrap_or_default()
    }
}

/// Kubernetes Service type for the control plane Service
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    /// Reachable from inside the infrastructure cluster only
    ClusterIP,
    /// Reachable through every node of the infrastructure cluster
    #[default]
    NodePort,
    /// Reachable through an external load balancer
    LoadBalancer,
}

impl ServiceType {
    /// Name as used in `Service.spec.type`
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a Secret, defaulting to the referrer's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretReference {
    /// Namespace of the secret, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }
}

/// Static address pool and the annotations that expose addresses to machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NodeAddressConfig {
    /// Pool entries in allocation order
    ///
    /// Each entry is a single address (`10.0.0.5`), an inclusive range
    /// (`10.0.0.5-10.0.0.9`) or a CIDR block (`10.0.0.0/29`).
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Annotations added to every machine of the cluster
    ///
    /// Values may contain `$IP_ADDRESS` and `$MAC_ADDRESS`, replaced with the
    /// machine's allocated address and generated MAC.
    #[serde(default)]
    pub annotations: Vec<AnnotationTemplate>,
}

/// Annotation added to machines, with placeholders in its value
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AnnotationTemplate {
    /// Annotation key
    pub name: String,
    /// Annotation value template
    pub value: String,
}

/// Status for a VirtinkCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtinkClusterStatus {
    /// Whether the control plane endpoint is known
    #[serde(default)]
    pub ready: bool,

    /// Address ledger, one entry per machine holding an address
    #[serde(default)]
    pub node_addresses: Vec<NodeAddress>,
}

impl VirtinkClusterStatus {
    /// Ledger entry of the named machine
    pub fn address_of(&self, machine_name: &str) -> Option<&NodeAddress> {
        self.node_addresses
            .iter()
            .find(|entry| entry.machine_name == machine_name)
    }
}

/// Network identity allocated to one machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    /// Name of the VirtinkMachine holding the address
    pub machine_name: String,
    /// Allocated IP address
    pub ip: String,
    /// Generated MAC address
    pub mac: String,
}

impl VirtinkCluster {
    /// Annotation templates of the address pool, empty when unconfigured
    pub fn annotation_templates(&self) -> &[AnnotationTemplate] {
        self.spec
            .node_address_config
            .as_ref()
            .map(|c| c.annotations.as_slice())
            .unwrap_or_default()
    }

    /// Address ledger entry of the named machine
    pub fn address_of(&self, machine_name: &str) -> Option<&NodeAddress> {
        self.status.as_ref()?.address_of(machine_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_defaults_to_node_port() {
        let template: ControlPlaneServiceTemplate =
            serde_json::from_value(serde_json::json!({})).expect("valid template");
        assert_eq!(template.service_type(), ServiceType::NodePort);

        let template: ControlPlaneServiceTemplate =
            serde_json::from_value(serde_json::json!({"type": "LoadBalancer"}))
                .expect("valid template");
        assert_eq!(template.service_type(), ServiceType::LoadBalancer);
    }

    #[test]
    fn spec_parses_from_camel_case_manifest() {
        let spec: VirtinkClusterSpec = serde_json::from_value(serde_json::json!({
            "controlPlaneServiceTemplate": {
                "metadata": {"labels": {"team": "infra"}},
                "type": "ClusterIP"
            },
            "infraClusterSecretRef": {"name": "infra-kubeconfig"},
            "nodeAddressConfig": {
                "addresses": ["10.0.0.5", "10.0.0.6"],
                "annotations": [{"name": "ip", "value": "$IP_ADDRESS"}]
            }
        }))
        .expect("valid spec");

        assert_eq!(
            spec.control_plane_service_template.metadata.labels.get("team"),
            Some(&"infra".to_string())
        );
        let secret = spec.infra_cluster_secret_ref.expect("secret ref");
        assert_eq!(secret.namespace_or("capi"), "capi");
        let pool = spec.node_address_config.expect("pool");
        assert_eq!(pool.addresses.len(), 2);
        assert_eq!(pool.annotations[0].value, "$IP_ADDRESS");
    }

    #[test]
    fn empty_ledger_is_serialized_so_pruning_can_clear_it() {
        let status = VirtinkClusterStatus::default();
        let json = serde_json::to_value(&status).expect("serializes");
        assert_eq!(json["nodeAddresses"], serde_json::json!([]));
    }

    #[test]
    fn ledger_lookup_by_machine_name() {
        let mut cluster = VirtinkCluster::new("demo", VirtinkClusterSpec::default());
        assert!(cluster.address_of("m-0").is_none());
        cluster.status = Some(VirtinkClusterStatus {
            ready: true,
            node_addresses: vec![NodeAddress {
                machine_name: "m-0".to_string(),
                ip: "10.0.0.5".to_string(),
                mac: "52:54:00:00:00:01".to_string(),
            }],
        });
        assert_eq!(cluster.address_of("m-0").map(|a| a.ip.as_str()), Some("10.0.0.5"));
        assert!(cluster.address_of("m-1").is_none());
    }

    #[test]
    fn endpoint_validity() {
        assert!(!ApiEndpoint::default().is_valid());
        assert!(ApiEndpoint {
            host: "10.96.0.10".to_string(),
            port: 6443
        }
        .is_valid());
    }
}
