//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use tracing::debug;

use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_EXTSYNC};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts.
///
/// Without a path the configuration is inferred (in-cluster service account,
/// then `KUBECONFIG` / `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => {
            debug!("Inferring cluster configuration");
            Config::infer().await.map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to infer config: {}", e),
                )
            })?
        }
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Cache key of a namespaced object in the `namespace/name` form
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Build a `namespace/name` key from its parts
pub fn key_of(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// True when the object carries the managed-by marker of this controller
pub fn is_managed<K: Resource>(obj: &K) -> bool {
    obj.labels()
        .get(LABEL_MANAGED_BY)
        .is_some_and(|v| v == LABEL_MANAGED_BY_EXTSYNC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(namespace: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn object_key_joins_namespace_and_name() {
        assert_eq!(object_key(&config_map("team-a", &[])), "team-a/settings");
        assert_eq!(key_of("team-b", "api"), "team-b/api");
    }

    #[test]
    fn is_managed_requires_exact_marker() {
        assert!(is_managed(&config_map(
            "a",
            &[(LABEL_MANAGED_BY, LABEL_MANAGED_BY_EXTSYNC)]
        )));
        assert!(!is_managed(&config_map("a", &[(LABEL_MANAGED_BY, "helm")])));
        assert!(!is_managed(&config_map("a", &[])));
    }
}
