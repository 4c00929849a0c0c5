//! Strata Operator - reconciles DataCluster resources into Flux Helm objects

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use strata_cluster::Context;
use strata_common::crd::DataCluster;
use strata_common::crd_registry::CrdRegistry;
use strata_common::telemetry::{init_telemetry, TelemetryConfig};
use strata_common::FIELD_MANAGER;
use strata_operator::config::OperatorConfig;
use strata_operator::controller_runner::build_data_cluster_controller;

/// Strata - deploys data-plane clusters through Flux HelmReleases
#[derive(Parser, Debug)]
#[command(name = "strata-operator", version, about, long_about = None)]
struct Cli {
    /// Print the DataCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&DataCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.config.log_json,
        ..Default::default()
    })?;

    run_controller(cli.config).await
}

/// Apply the DataCluster CRD so its schema always matches this binary
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = DataCluster::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing DataCluster CRD...");
    crds.patch(&name, &params, &Patch::Apply(&crd))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install DataCluster CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if config.skip_crd_install {
        tracing::info!("Skipping DataCluster CRD install");
    } else {
        ensure_crd_installed(&client).await?;
    }

    let registry = Arc::new(CrdRegistry::discover(client.clone()).await);
    let missing = registry.missing_required();
    if !missing.is_empty() {
        tracing::warn!(
            ?missing,
            "Flux CRDs not found; reconciles will fail until they are installed"
        );
    }

    let ctx = Arc::new(
        Context::builder(client.clone(), registry)
            .config(config.to_reconciler_config())
            .build(),
    );

    tracing::info!(
        requeue_dependencies = ?config.requeue_dependencies,
        reconcile_timeout = ?config.reconcile_timeout,
        "Starting Strata operator"
    );
    build_data_cluster_controller(client, ctx, config.watch_namespace()).await;

    tracing::info!("Shutting down");
    Ok(())
}
