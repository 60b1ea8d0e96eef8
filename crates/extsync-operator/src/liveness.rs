//! Liveness endpoint
//!
//! `GET /healthz` answers 200 once the namespace inventory and every
//! replication engine completed their initial listing, 503 before that. The
//! body names the components that are not ready yet:
//!
//! ```json
//! {"notReady":["IngressRoute"]}
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Synced flags of the running components
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    components: Vec<(String, Arc<AtomicBool>)>,
}

impl Liveness {
    /// Track the synced flag of a named component
    pub fn register(&mut self, name: impl Into<String>, synced: Arc<AtomicBool>) {
        self.components.push((name.into(), synced));
    }

    /// Names of components that have not synced yet
    pub fn not_ready(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, synced)| !synced.load(Ordering::SeqCst))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Body of a liveness response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessReport {
    /// Components still performing their initial listing
    pub not_ready: Vec<String>,
}

/// Router serving `/healthz`
pub fn liveness_router(liveness: Arc<Liveness>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(liveness)
}

async fn healthz(State(liveness): State<Arc<Liveness>>) -> (StatusCode, Json<LivenessReport>) {
    let not_ready = liveness.not_ready();
    let status = if not_ready.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(LivenessReport { not_ready }))
}

/// Serve the liveness endpoint on all interfaces until the server fails
pub async fn serve_liveness(liveness: Liveness, port: u16) {
    let app = liveness_router(Arc::new(liveness));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "Liveness endpoint started");
            l
        }
        Err(e) => {
            error!(error = %e, port, "Failed to bind liveness port");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Liveness server error");
    }
}
