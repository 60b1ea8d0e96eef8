//! Ingress replicas with hosts localized to the target namespace

use k8s_openapi::api::networking::v1::{Ingress, IngressRule, IngressSpec, IngressTLS};

use extsync_common::TLD_SECRET_NAME;

use super::{annotation, replica_metadata, top_level_domain, ReplicaOptions, Replicable};
use crate::rewrite::localize_host;

impl Replicable for Ingress {
    fn build_replica(&self, namespace: &str, options: &ReplicaOptions) -> Self {
        let base = options.hostname_base(&self.metadata);
        let source = self.spec.as_ref();

        let rules = source.and_then(|spec| spec.rules.as_ref()).map(|rules| {
            rules
                .iter()
                .map(|rule| IngressRule {
                    host: match base {
                        Some(base) => Some(localize_host(namespace, base)),
                        None => rule
                            .host
                            .as_deref()
                            .filter(|host| !host.is_empty())
                            .map(|host| localize_host(namespace, host)),
                    },
                    http: rule.http.clone(),
                })
                .collect()
        });

        let tls = match top_level_domain(&self.metadata) {
            Some(tld) => Some(vec![IngressTLS {
                secret_name: annotation(&self.metadata, TLD_SECRET_NAME).map(str::to_string),
                hosts: Some(vec![localize_host(namespace, tld)]),
            }]),
            None => source.and_then(|spec| spec.tls.as_ref()).map(|entries| {
                entries
                    .iter()
                    .map(|entry| IngressTLS {
                        secret_name: entry.secret_name.clone(),
                        hosts: entry.hosts.as_ref().map(|hosts| {
                            hosts
                                .iter()
                                .map(|host| {
                                    localize_host(namespace, base.unwrap_or(host.as_str()))
                                })
                                .collect()
                        }),
                    })
                    .collect()
            }),
        };

        Ingress {
            metadata: replica_metadata(&self.metadata, namespace),
            spec: Some(IngressSpec {
                ingress_class_name: source.and_then(|spec| spec.ingress_class_name.clone()),
                default_backend: source.and_then(|spec| spec.default_backend.clone()),
                rules,
                tls,
            }),
            status: None,
        }
    }
}
