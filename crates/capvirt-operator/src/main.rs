//! capvirt operator - Cluster API infrastructure provider for Virtink

mod controller_runner;

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use capvirt_common::crd::provider_crds;
use capvirt_common::kube_utils::create_client;
use capvirt_common::leader_election::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
use capvirt_common::telemetry::{init_telemetry, TelemetryConfig};
use capvirt_common::FIELD_MANAGER;

use crate::controller_runner::build_controllers;

/// Cluster API infrastructure provider running workload clusters on Virtink VMs
#[derive(Parser, Debug)]
#[command(name = "capvirt-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the provider CRDs as YAML and exit
    Crd,
    /// Run the VirtinkCluster and VirtinkMachine controllers
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Install or update the provider CRDs before starting
    #[arg(long, env = "CAPVIRT_INSTALL_CRDS")]
    install_crds: bool,

    /// Objects of one kind reconciled in parallel
    #[arg(long, env = "CAPVIRT_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,

    /// Only reconcile while holding the leader Lease
    #[arg(long, env = "CAPVIRT_LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace of the leader Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "capvirt-system")]
    leader_election_namespace: String,

    /// Leader identity, the hostname when unset
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Log JSON lines instead of human readable text
    #[arg(long, env = "CAPVIRT_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            println!("{}", crd_manifests()?);
            Ok(())
        }
        Commands::Run(args) => run(args).await,
    }
}

/// All provider CRDs as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let docs = provider_crds()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .with_context(|| format!("failed to serialize CRD {}", crd.name_any()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Install the provider CRDs with server-side apply
///
/// Keeps the stored CRD versions in step with the running binary.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in provider_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("failed to install CRD {name}"))?;
    }
    Ok(())
}

fn default_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("capvirt-{}", std::process::id()))
}

async fn leadership_lost(guard: &mut Option<LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "capvirt-operator".to_string(),
        json: args.log_json,
    })?;
    tracing::info!("capvirt operator starting");

    let client = create_client()
        .await
        .context("failed to create Kubernetes client")?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let mut guard = if args.leader_elect {
        let identity = args.identity.clone().unwrap_or_else(default_identity);
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &args.leader_election_namespace,
            &identity,
        ));
        tracing::info!(%identity, namespace = %args.leader_election_namespace, "waiting for leadership");
        let guard = elector.acquire().await;
        tracing::info!(%identity, "acquired leadership");
        Some(guard)
    } else {
        None
    };

    let controllers = futures::future::join_all(build_controllers(client, args.concurrency));

    tokio::select! {
        _ = controllers => {
            tracing::info!("controllers stopped");
        }
        _ = leadership_lost(&mut guard) => {
            tracing::error!("leadership lost, exiting");
            anyhow::bail!("leadership lost");
        }
    }

    if let Some(guard) = &guard {
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "failed to release leadership");
        }
    }

    tracing::info!("capvirt operator shutting down");
    Ok(())
}
