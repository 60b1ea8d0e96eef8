//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use extsync_common::telemetry::{LogFormat, TelemetryConfig};
use extsync_replicator::ReplicatorConfig;

/// Replicates annotated Services, Ingresses and IngressRoutes across namespaces
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-external-sync", version, about, long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig file (in-cluster config is used when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Base log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (plain or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "plain")]
    pub log_format: LogFormat,

    /// Port of the liveness endpoint
    #[arg(short = 'p', long, env = "LIVENESS_PORT", default_value_t = 8080)]
    pub liveness_port: u16,

    /// Interval between full resyncs (e.g. 30m, 1h, 600s)
    #[arg(long, env = "RESYNC_PERIOD", default_value = "30m", value_parser = parse_duration)]
    pub resync_period: Duration,

    /// Hostname localized into Ingress/IngressRoute replicas of sources
    /// without a top-level-domain annotation
    #[arg(long, env = "DEFAULT_INGRESS_HOSTNAME")]
    pub default_ingress_hostname: Option<String>,

    /// Also replicate Traefik IngressRoutes
    #[arg(long, env = "ENABLE_TRAEFIK")]
    pub enable_traefik: bool,
}

impl Cli {
    /// Logging settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }

    /// Settings shared by every replication engine
    pub fn replicator_config(&self) -> ReplicatorConfig {
        ReplicatorConfig {
            resync_period: self.resync_period,
            default_hostname: self
                .default_ingress_hostname
                .as_deref()
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(str::to_string),
        }
    }
}

/// Parse a duration string like "1h", "30m", "3600s" or raw seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{}', expected e.g. 1h, 30m, 3600s", s);

    let secs: u64 = if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .ok_or_else(invalid)?
    } else if let Some(minutes) = s.strip_suffix('m') {
        minutes
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .ok_or_else(invalid)?
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().map_err(|_| invalid())?
    } else {
        s.parse().map_err(|_| invalid())?
    };

    if secs == 0 {
        return Err(format!("duration '{}' must be greater than zero", s));
    }
    Ok(Duration::from_secs(secs))
}
