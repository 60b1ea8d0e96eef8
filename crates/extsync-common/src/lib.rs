//! Common types for kube-external-sync: annotations, errors, CRDs and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix shared by every annotation this controller reads or writes
pub const ANNOTATION_PREFIX: &str = "kube-external-sync.io";

// =============================================================================
// Source annotations (user-facing)
// =============================================================================

/// Comma-separated list of namespace name patterns to replicate into
pub const REPLICATE_TO: &str = "kube-external-sync.io/replicate-to";

/// Label selector over namespace labels to replicate into
pub const REPLICATE_TO_MATCHING: &str = "kube-external-sync.io/replicate-to-matching";

/// When "true", source labels are not copied onto replicas
pub const STRIP_LABELS: &str = "kube-external-sync.io/strip-labels";

/// When "true", source annotations are not copied onto replicas
pub const STRIP_ANNOTATIONS: &str = "kube-external-sync.io/strip-annotations";

/// Hostname whose leftmost label is replaced by the target namespace
pub const TOP_LEVEL_DOMAIN: &str = "kube-external-sync.io/top-level-domain";

/// TLS secret used together with [`TOP_LEVEL_DOMAIN`]
pub const TLD_SECRET_NAME: &str = "kube-external-sync.io/tld-secret-name";

/// DNS suffix used to build the ExternalName of replicated Services
pub const EXTERNAL_NAME_SUFFIX: &str = "kube-external-sync.io/external-name-suffix";

/// When "true", owner references are kept on replicas
pub const KEEP_OWNER_REFERENCES: &str = "kube-external-sync.io/keep-owner-references";

// =============================================================================
// Provenance annotations (controller-written)
// =============================================================================

/// `namespace/name` of the source a replica was built from
pub const REPLICATED_FROM: &str = "kube-external-sync.io/replicated-from";

/// RFC 3339 timestamp of the last replication
pub const REPLICATED_AT: &str = "kube-external-sync.io/replicated-at";

/// Source resourceVersion at the time of the last replication
pub const REPLICATED_FROM_VERSION: &str = "kube-external-sync.io/replicated-from-version";

/// Annotation Kubernetes writes for `kubectl apply`
pub const LAST_APPLIED_CONFIGURATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Annotations never copied from a source onto its replicas
pub const CONTROLLED_ANNOTATIONS: &[&str] = &[
    LAST_APPLIED_CONFIGURATION,
    REPLICATE_TO,
    REPLICATE_TO_MATCHING,
    REPLICATED_FROM,
    REPLICATED_AT,
    REPLICATED_FROM_VERSION,
];

// =============================================================================
// Managed marker
// =============================================================================

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Managed-by value identifying replicas owned by this controller
pub const LABEL_MANAGED_BY_EXTSYNC: &str = "kube-external-sync";

/// Default DNS suffix for ExternalName services
pub const DEFAULT_EXTERNAL_NAME_SUFFIX: &str = "svc.cluster.local";

/// Returns true when the annotation/label value is the literal "true"
pub fn is_true(values: Option<&std::collections::BTreeMap<String, String>>, key: &str) -> bool {
    values
        .and_then(|v| v.get(key))
        .is_some_and(|v| v == "true")
}
