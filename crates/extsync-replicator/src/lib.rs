//! Namespace replication engine for kube-external-sync
//!
//! Sources are annotated Services, Ingresses and Traefik IngressRoutes. A
//! source selects target namespaces by name (`replicate-to`, a list of
//! anchored regular expressions) or by labels (`replicate-to-matching`, a
//! label selector). For every selected namespace a managed replica is kept
//! in step with the source, and removed once the namespace stops being
//! selected or the source goes away.
//!
//! Objects that are not managed replicas are never overwritten or deleted.

#![deny(missing_docs)]

pub mod adapter;
pub mod api;
pub mod cache;
pub mod engine;
pub mod namespace;
pub mod pattern;
pub mod rewrite;
pub mod selector;

pub use adapter::{ReplicaOptions, Replicable};
pub use api::{KubeResourceApi, ResourceApi};
pub use cache::{ResourceCache, WatchEvent};
pub use engine::{ReplicationOutcome, Replicator, ReplicatorConfig, DEFAULT_RESYNC_PERIOD};
pub use namespace::{NamespaceDirectory, NamespaceEvent, NamespaceInfo, NamespaceLister};
pub use pattern::NamespacePatterns;
pub use selector::Selector;
