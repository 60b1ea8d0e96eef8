//! Services are replicated as ExternalName aliases of the source

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use extsync_common::{DEFAULT_EXTERNAL_NAME_SUFFIX, EXTERNAL_NAME_SUFFIX};

use super::{annotation, replica_metadata, ReplicaOptions, Replicable};

impl Replicable for Service {
    fn build_replica(&self, namespace: &str, _options: &ReplicaOptions) -> Self {
        let suffix = annotation(&self.metadata, EXTERNAL_NAME_SUFFIX)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_EXTERNAL_NAME_SUFFIX);
        let external_name = format!(
            "{}.{}.{}",
            self.metadata.name.as_deref().unwrap_or_default(),
            self.metadata.namespace.as_deref().unwrap_or_default(),
            suffix
        );

        let ports = self
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|port| ServicePort {
                        node_port: None,
                        ..port.clone()
                    })
                    .collect()
            });

        Service {
            metadata: replica_metadata(&self.metadata, namespace),
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some(external_name),
                ports,
                ..Default::default()
            }),
            status: None,
        }
    }
}
