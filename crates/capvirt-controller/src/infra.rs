//! Resolution of the cluster that holds VMs, volumes and Services
//!
//! A VirtinkCluster without `infraClusterSecretRef` runs its machines next to
//! itself. With a reference, every pass reads the kubeconfig from the Secret
//! and talks to that cluster instead; the capability is obtained once per
//! pass and never stored on the context.

use std::sync::Arc;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use capvirt_common::crd::SecretReference;
use capvirt_common::kube_utils::{client_from_kubeconfig, kubeconfig_from_secret};
use capvirt_common::{Error, INFRA_KUBECONFIG_KEY};

use crate::client::{InfraClient, InfraClientImpl};
use crate::context::Context;

/// Builds an [`InfraClient`] for a kubeconfig read from a Secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraConnector: Send + Sync {
    /// Connect to the cluster described by `kubeconfig`
    ///
    /// `secret_id` names the Secret the kubeconfig came from, for errors.
    async fn connect(
        &self,
        kubeconfig: Kubeconfig,
        secret_id: &str,
    ) -> Result<Arc<dyn InfraClient>, Error>;
}

/// Connector building real kube clients
pub struct KubeconfigConnector;

#[async_trait]
impl InfraConnector for KubeconfigConnector {
    async fn connect(
        &self,
        kubeconfig: Kubeconfig,
        secret_id: &str,
    ) -> Result<Arc<dyn InfraClient>, Error> {
        let client = client_from_kubeconfig(kubeconfig)
            .await
            .map_err(|e| Error::infra_cluster(secret_id, e.to_string()))?;
        Ok(Arc::new(InfraClientImpl::remote(client)))
    }
}

/// Client for the store referenced by `secret_ref`, or the management store
///
/// `default_namespace` is used when the reference has no namespace. A
/// missing Secret, a missing `kubeconfig` key or an unusable kubeconfig is an
/// [`Error::InfraCluster`].
pub async fn resolve_infra_client(
    ctx: &Context,
    secret_ref: Option<&SecretReference>,
    default_namespace: &str,
) -> Result<Arc<dyn InfraClient>, Error> {
    let Some(secret_ref) = secret_ref else {
        return Ok(Arc::clone(&ctx.management_infra));
    };

    let namespace = secret_ref.namespace_or(default_namespace);
    let secret_id = format!("{namespace}/{}", secret_ref.name);
    let secret = ctx
        .kube
        .get_secret(namespace, &secret_ref.name)
        .await?
        .ok_or_else(|| Error::infra_cluster(&secret_id, "secret not found"))?;

    let kubeconfig = kubeconfig_from_secret(&secret, INFRA_KUBECONFIG_KEY, &secret_id)?;
    debug!(secret = %secret_id, "connecting to infrastructure cluster");
    ctx.connector.connect(kubeconfig, &secret_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::testing::{secret, FakeInfra, RecordingEvents};
    use capvirt_common::ownership::Placement;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: infra
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: infra
  context:
    cluster: infra
    user: admin
current-context: infra
users:
- name: admin
  user:
    token: abc
"#;

    fn context(kube: MockKubeClient, connector: MockInfraConnector) -> Context {
        Context::for_testing(
            Arc::new(kube),
            Arc::new(FakeInfra::new(Placement::Local)),
            Arc::new(connector),
            Arc::new(RecordingEvents::default()),
        )
    }

    fn secret_ref(namespace: Option<&str>) -> SecretReference {
        SecretReference {
            name: "infra-kubeconfig".to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn absent_reference_uses_the_management_store() {
        let ctx = context(MockKubeClient::new(), MockInfraConnector::new());
        let infra = resolve_infra_client(&ctx, None, "capi").await.expect("management");
        assert_eq!(infra.placement(), Placement::Local);
    }

    #[tokio::test]
    async fn reference_connects_with_the_stored_kubeconfig() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|ns, name| {
            assert_eq!((ns, name), ("capi", "infra-kubeconfig"));
            Ok(Some(secret("kubeconfig", KUBECONFIG.as_bytes())))
        });
        let mut connector = MockInfraConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|kubeconfig, secret_id| {
                assert_eq!(kubeconfig.current_context.as_deref(), Some("infra"));
                assert_eq!(secret_id, "capi/infra-kubeconfig");
                Ok(Arc::new(FakeInfra::new(Placement::Remote)))
            });

        let ctx = context(kube, connector);
        let infra = resolve_infra_client(&ctx, Some(&secret_ref(None)), "capi")
            .await
            .expect("remote");
        assert_eq!(infra.placement(), Placement::Remote);
    }

    #[tokio::test]
    async fn explicit_namespace_wins() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|ns, _| {
            assert_eq!(ns, "infra-creds");
            Ok(Some(secret("kubeconfig", KUBECONFIG.as_bytes())))
        });
        let mut connector = MockInfraConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Ok(Arc::new(FakeInfra::new(Placement::Remote))));

        let ctx = context(kube, connector);
        assert!(resolve_infra_client(&ctx, Some(&secret_ref(Some("infra-creds"))), "capi")
            .await
            .is_ok());
    }

    /// Story: a dangling credential reference stops the pass with a
    /// configuration error naming the Secret
    #[tokio::test]
    async fn story_missing_secret_is_fatal() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        let mut connector = MockInfraConnector::new();
        connector.expect_connect().never();

        let ctx = context(kube, connector);
        let err = resolve_infra_client(&ctx, Some(&secret_ref(None)), "capi")
            .await
            .err()
            .expect("missing secret");
        assert!(matches!(err, Error::InfraCluster { .. }));
        assert!(err.to_string().contains("capi/infra-kubeconfig"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn secret_without_kubeconfig_key_is_fatal() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(secret("config", KUBECONFIG.as_bytes()))));
        let mut connector = MockInfraConnector::new();
        connector.expect_connect().never();

        let ctx = context(kube, connector);
        let err = resolve_infra_client(&ctx, Some(&secret_ref(None)), "capi")
            .await
            .err()
            .expect("missing key");
        assert!(matches!(err, Error::InfraCluster { .. }));
    }
}
