//! kube-external-sync - replicate annotated resources across namespaces

use anyhow::Context;
use clap::Parser;

use extsync_common::kube_utils::create_client;
use extsync_common::telemetry::init_telemetry;
use extsync_operator::config::Cli;
use extsync_operator::runner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&cli.telemetry()).context("failed to initialize logging")?;

    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .context("failed to create Kubernetes client")?;

    runner::run(&cli, client).await
}
