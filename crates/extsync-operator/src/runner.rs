//! Wires the namespace directory, one engine per kind and the liveness
//! endpoint together and runs them until shutdown.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tracing::{info, warn};

use extsync_common::crd::IngressRoute;
use extsync_replicator::{
    KubeResourceApi, NamespaceDirectory, Replicable, Replicator, ReplicatorConfig,
};

use crate::config::Cli;
use crate::liveness::{serve_liveness, Liveness};

/// Name under which the namespace inventory reports readiness
const NAMESPACE_COMPONENT: &str = "Namespace";

/// Run the controller until a shutdown signal arrives or a task exits
pub async fn run(cli: &Cli, client: Client) -> anyhow::Result<()> {
    let config = cli.replicator_config();
    let directory = Arc::new(NamespaceDirectory::new());
    let mut liveness = Liveness::default();
    liveness.register(NAMESPACE_COMPONENT, directory.synced_flag());

    let mut tasks = JoinSet::new();

    // Engines subscribe before the directory starts so no namespace event is missed
    spawn_replicator::<Service>(&mut tasks, &client, &directory, &config, &mut liveness);
    spawn_replicator::<Ingress>(&mut tasks, &client, &directory, &config, &mut liveness);
    if cli.enable_traefik {
        spawn_replicator::<IngressRoute>(&mut tasks, &client, &directory, &config, &mut liveness);
    }

    tasks.spawn(Arc::clone(&directory).run(client.clone()));
    tasks.spawn(serve_liveness(liveness, cli.liveness_port));

    info!(
        traefik = cli.enable_traefik,
        resync_period = ?config.resync_period,
        default_hostname = ?config.default_hostname,
        "kube-external-sync started"
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(result) = tasks.join_next() => {
            match result {
                Ok(()) => warn!("A controller task exited, shutting down"),
                Err(e) => warn!(error = %e, "A controller task failed, shutting down"),
            }
        }
    }

    tasks.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn spawn_replicator<K: Replicable>(
    tasks: &mut JoinSet<()>,
    client: &Client,
    directory: &Arc<NamespaceDirectory>,
    config: &ReplicatorConfig,
    liveness: &mut Liveness,
) {
    let engine: Replicator<K, KubeResourceApi<K>> = Replicator::new(
        KubeResourceApi::new(client.clone()),
        directory.clone(),
        config,
    );
    liveness.register(engine.kind().to_string(), engine.synced_flag());

    let events = watcher::watcher(Api::<K>::all(client.clone()), watcher::Config::default())
        .default_backoff();
    let namespace_events = directory.subscribe();

    tasks.spawn(engine.run(events, namespace_events));
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
