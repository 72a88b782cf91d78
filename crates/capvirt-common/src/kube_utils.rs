//! Shared Kubernetes utilities using kube-rs

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read and parse the kubeconfig stored under `key` in a secret
///
/// `secret_id` is only used for error messages.
pub fn kubeconfig_from_secret(
    secret: &Secret,
    key: &str,
    secret_id: &str,
) -> Result<Kubeconfig, Error> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| Error::infra_cluster(secret_id, format!("secret has no key {key}")))?;

    let text = std::str::from_utf8(&data.0)
        .map_err(|e| Error::infra_cluster(secret_id, format!("kubeconfig is not UTF-8: {e}")))?;

    Kubeconfig::from_yaml(text)
        .map_err(|e| Error::infra_cluster(secret_id, format!("failed to parse kubeconfig: {e}")))
}

/// Build a client for the cluster described by `kubeconfig` with default timeouts
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    client_from_kubeconfig_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
        .await
}

async fn client_from_kubeconfig_with_timeout(
    kubeconfig: Kubeconfig,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {e}"))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// Build a client for the cluster the process runs in (or the local kubeconfig)
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {e}"))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// Read a secret value as bytes, `None` when the key is absent
pub fn secret_value<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.as_slice())
}
