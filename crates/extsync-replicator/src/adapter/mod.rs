//! Replica payload construction
//!
//! Each replicated kind implements [`Replicable`], turning a source object
//! into the object that should exist in a target namespace. The metadata
//! rules are shared by every kind and live in [`replica_metadata`].

mod ingress;
mod ingress_route;
mod service;

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use extsync_common::{
    is_true, CONTROLLED_ANNOTATIONS, KEEP_OWNER_REFERENCES, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_EXTSYNC, REPLICATED_AT, REPLICATED_FROM, REPLICATED_FROM_VERSION,
    STRIP_ANNOTATIONS, STRIP_LABELS, TOP_LEVEL_DOMAIN,
};

/// A namespaced kind the engine can replicate
pub trait Replicable:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Build the replica of `self` for `namespace`
    fn build_replica(&self, namespace: &str, options: &ReplicaOptions) -> Self;
}

/// Settings shared by every replica built for one kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaOptions {
    /// Hostname used when a source has no `top-level-domain` annotation
    pub default_hostname: Option<String>,
}

impl ReplicaOptions {
    /// Hostname replicas are localized from: the source's
    /// `top-level-domain` annotation, else the configured default.
    pub fn hostname_base<'a>(&'a self, source: &'a ObjectMeta) -> Option<&'a str> {
        top_level_domain(source).or_else(|| {
            self.default_hostname
                .as_deref()
                .filter(|host| !host.is_empty())
        })
    }
}

/// Non-empty `top-level-domain` annotation of a source
pub(crate) fn top_level_domain(source: &ObjectMeta) -> Option<&str> {
    source
        .annotations
        .as_ref()
        .and_then(|a| a.get(TOP_LEVEL_DOMAIN))
        .map(String::as_str)
        .filter(|tld| !tld.is_empty())
}

/// Annotation value of a source, if set
pub(crate) fn annotation<'a>(source: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    source
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Metadata of the replica of `source` in `namespace`
pub fn replica_metadata(source: &ObjectMeta, namespace: &str) -> ObjectMeta {
    let annotations = source.annotations.as_ref();

    let mut labels: BTreeMap<String, String> = if is_true(annotations, STRIP_LABELS) {
        BTreeMap::new()
    } else {
        source
            .labels
            .iter()
            .flatten()
            .filter(|(key, _)| key.as_str() != LABEL_MANAGED_BY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_EXTSYNC.to_string(),
    );

    let mut replica_annotations: BTreeMap<String, String> =
        if is_true(annotations, STRIP_ANNOTATIONS) {
            BTreeMap::new()
        } else {
            annotations
                .into_iter()
                .flatten()
                .filter(|(key, _)| !CONTROLLED_ANNOTATIONS.contains(&key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
    replica_annotations.insert(
        REPLICATED_FROM.to_string(),
        format!(
            "{}/{}",
            source.namespace.as_deref().unwrap_or_default(),
            source.name.as_deref().unwrap_or_default()
        ),
    );
    replica_annotations.insert(
        REPLICATED_AT.to_string(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    replica_annotations.insert(
        REPLICATED_FROM_VERSION.to_string(),
        source.resource_version.clone().unwrap_or_default(),
    );

    let owner_references = if is_true(annotations, KEEP_OWNER_REFERENCES) {
        source.owner_references.clone()
    } else {
        None
    };

    ObjectMeta {
        name: source.name.clone(),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: Some(replica_annotations),
        owner_references,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use extsync_common::{LAST_APPLIED_CONFIGURATION, REPLICATE_TO};

    fn map(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn source_meta(annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("api".to_string()),
            namespace: Some("finance".to_string()),
            resource_version: Some("42".to_string()),
            uid: Some("uid-1".to_string()),
            labels: map(&[("app", "api"), (LABEL_MANAGED_BY, "helm")]),
            annotations: map(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "api".to_string(),
                uid: "owner".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn copies_user_metadata_and_marks_replica() {
        let meta = replica_metadata(
            &source_meta(&[
                (REPLICATE_TO, "hr"),
                (LAST_APPLIED_CONFIGURATION, "{}"),
                ("team", "payments"),
            ]),
            "hr",
        );

        assert_eq!(meta.name.as_deref(), Some("api"));
        assert_eq!(meta.namespace.as_deref(), Some("hr"));
        assert!(meta.uid.is_none());
        assert!(meta.resource_version.is_none());
        assert!(meta.owner_references.is_none());

        let labels = meta.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("api"));
        assert_eq!(
            labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(LABEL_MANAGED_BY_EXTSYNC)
        );

        let annotations = meta.annotations.unwrap();
        assert_eq!(annotations.get("team").map(String::as_str), Some("payments"));
        assert!(!annotations.contains_key(REPLICATE_TO));
        assert!(!annotations.contains_key(LAST_APPLIED_CONFIGURATION));
        assert_eq!(
            annotations.get(REPLICATED_FROM).map(String::as_str),
            Some("finance/api")
        );
        assert_eq!(
            annotations.get(REPLICATED_FROM_VERSION).map(String::as_str),
            Some("42")
        );
        let at = annotations.get(REPLICATED_AT).unwrap();
        assert!(DateTime::parse_from_rfc3339(at).is_ok());
    }

    #[test]
    fn strip_flags_drop_copied_metadata() {
        let meta = replica_metadata(
            &source_meta(&[
                (STRIP_LABELS, "true"),
                (STRIP_ANNOTATIONS, "true"),
                ("team", "payments"),
            ]),
            "hr",
        );

        let labels = meta.labels.unwrap();
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key(LABEL_MANAGED_BY));

        let annotations = meta.annotations.unwrap();
        assert!(!annotations.contains_key("team"));
        assert!(annotations.contains_key(REPLICATED_FROM));
        assert!(annotations.contains_key(REPLICATED_FROM_VERSION));
    }

    #[test]
    fn owner_references_kept_on_request() {
        let meta = replica_metadata(&source_meta(&[(KEEP_OWNER_REFERENCES, "true")]), "hr");
        assert_eq!(meta.owner_references.unwrap()[0].name, "api");
    }

    #[test]
    fn hostname_base_prefers_annotation_over_default() {
        let options = ReplicaOptions {
            default_hostname: Some("*.default.io".to_string()),
        };
        let with_tld = source_meta(&[(TOP_LEVEL_DOMAIN, "x.example.com")]);
        assert_eq!(options.hostname_base(&with_tld), Some("x.example.com"));

        let without = source_meta(&[]);
        assert_eq!(options.hostname_base(&without), Some("*.default.io"));

        let empty_tld = source_meta(&[(TOP_LEVEL_DOMAIN, "")]);
        assert_eq!(options.hostname_base(&empty_tld), Some("*.default.io"));

        assert_eq!(ReplicaOptions::default().hostname_base(&without), None);
    }
}
