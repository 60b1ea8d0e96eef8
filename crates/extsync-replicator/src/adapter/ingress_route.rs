//! Traefik IngressRoute replicas with rewritten `Host(...)` rules

use extsync_common::crd::{IngressRoute, IngressRouteSpec, Route, RouteTls, TlsDomain};
use extsync_common::TLD_SECRET_NAME;

use super::{annotation, replica_metadata, top_level_domain, ReplicaOptions, Replicable};
use crate::rewrite::{localize_host, rewrite_match};

impl Replicable for IngressRoute {
    fn build_replica(&self, namespace: &str, options: &ReplicaOptions) -> Self {
        let fallback = options.hostname_base(&self.metadata);

        let routes = self
            .spec
            .routes
            .iter()
            .map(|route| Route {
                match_expr: rewrite_match(namespace, &route.match_expr, fallback),
                ..route.clone()
            })
            .collect();

        let tls = self.spec.tls.as_ref().map(|tls| {
            let (secret_name, domains) = match top_level_domain(&self.metadata) {
                Some(tld) => (
                    annotation(&self.metadata, TLD_SECRET_NAME).map(str::to_string),
                    vec![TlsDomain {
                        main: localize_host(namespace, tld),
                        sans: Vec::new(),
                    }],
                ),
                None => (
                    tls.secret_name.clone(),
                    tls.domains
                        .iter()
                        .map(|domain| TlsDomain {
                            main: localize_host(namespace, &domain.main),
                            sans: domain
                                .sans
                                .iter()
                                .map(|san| localize_host(namespace, san))
                                .collect(),
                        })
                        .collect(),
                ),
            };
            RouteTls {
                secret_name,
                domains,
                ..tls.clone()
            }
        });

        IngressRoute {
            metadata: replica_metadata(&self.metadata, namespace),
            spec: IngressRouteSpec {
                entry_points: self.spec.entry_points.clone(),
                routes,
                tls,
            },
        }
    }
}
