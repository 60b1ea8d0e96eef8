//! Traefik IngressRoute custom resource
//!
//! Mirrors the subset of `traefik.containo.us/v1alpha1` IngressRoute that
//! matters for replication. Backend service entries are kept as raw JSON so
//! every field Traefik supports survives a round trip untouched.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// IngressRoute routes HTTP traffic through Traefik.
///
/// Example:
/// ```yaml
/// apiVersion: traefik.containo.us/v1alpha1
/// kind: IngressRoute
/// metadata:
///   name: web
///   annotations:
///     kube-external-sync.io/replicate-to: "preview-.*"
/// spec:
///   entryPoints: [websecure]
///   routes:
///     - kind: Rule
///       match: Host(`web.example.com`) && PathPrefix(`/`)
///       services:
///         - name: web
///           port: 80
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "traefik.containo.us",
    version = "v1alpha1",
    kind = "IngressRoute",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteSpec {
    /// Entry points the routes are attached to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,

    /// Routing rules
    #[serde(default)]
    pub routes: Vec<Route>,

    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

/// A single routing rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Rule kind, always "Rule" for IngressRoute
    pub kind: String,

    /// Traefik rule expression, e.g. "Host(`a.example.com`) && PathPrefix(`/`)"
    #[serde(rename = "match")]
    pub match_expr: String,

    /// Rule priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Middlewares applied to the route
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareRef>,

    /// Backend services, passed through verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<serde_json::Value>,
}

/// Reference to a Traefik Middleware
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MiddlewareRef {
    /// Middleware name
    pub name: String,
    /// Namespace of the middleware (defaults to the route's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// TLS section of an IngressRoute
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    /// Secret holding the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// TLSOption reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<TlsReference>,

    /// TLSStore reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<TlsReference>,

    /// ACME certificate resolver name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,

    /// Domains the certificate is requested for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<TlsDomain>,
}

/// Reference to a TLSOption or TLSStore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TlsReference {
    /// Object name
    pub name: String,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Certificate domain with optional subject alternative names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TlsDomain {
    /// Main domain
    pub main: String,
    /// Subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn deserializes_traefik_manifest() {
        let json = serde_json::json!({
            "apiVersion": "traefik.containo.us/v1alpha1",
            "kind": "IngressRoute",
            "metadata": {"name": "web", "namespace": "team-a"},
            "spec": {
                "entryPoints": ["websecure"],
                "routes": [{
                    "kind": "Rule",
                    "match": "Host(`web.example.com`)",
                    "priority": 10,
                    "middlewares": [{"name": "strip"}],
                    "services": [{"name": "web", "port": 80, "weight": 2}]
                }],
                "tls": {
                    "certResolver": "le",
                    "domains": [{"main": "web.example.com", "sans": ["www.example.com"]}]
                }
            }
        });

        let route: IngressRoute = serde_json::from_value(json).unwrap();
        assert_eq!(route.spec.entry_points, vec!["websecure"]);
        assert_eq!(route.spec.routes[0].match_expr, "Host(`web.example.com`)");
        assert_eq!(route.spec.routes[0].priority, Some(10));
        assert_eq!(route.spec.routes[0].services[0]["weight"], 2);
        let tls = route.spec.tls.unwrap();
        assert_eq!(tls.cert_resolver.as_deref(), Some("le"));
        assert_eq!(tls.domains[0].sans, vec!["www.example.com"]);
    }

    #[test]
    fn match_field_serializes_under_its_traefik_name() {
        let route = Route {
            kind: "Rule".to_string(),
            match_expr: "PathPrefix(`/`)".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&route).unwrap();
        assert_eq!(value["match"], "PathPrefix(`/`)");
        assert!(value.get("priority").is_none());
    }

    #[test]
    fn resource_identity() {
        assert_eq!(IngressRoute::kind(&()), "IngressRoute");
        assert_eq!(IngressRoute::group(&()), "traefik.containo.us");
        assert_eq!(IngressRoute::api_version(&()), "traefik.containo.us/v1alpha1");
    }
}
