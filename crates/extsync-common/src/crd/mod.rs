//! Custom resource types replicated by kube-external-sync
//!
//! Only the Rust types live here. Installing the CRDs is left to the
//! projects that own them (Traefik ships its own manifests).

mod ingress_route;

pub use ingress_route::{
    IngressRoute, IngressRouteSpec, MiddlewareRef, Route, RouteTls, TlsDomain, TlsReference,
};
