//! The replication engine
//!
//! One [`Replicator`] runs per replicated kind. It owns a [`ResourceCache`]
//! of every object of that kind in the cluster, remembers which sources
//! replicate by pattern or by selector, and reacts to three inputs inside a
//! single loop: watch events for its kind, namespace notifications from the
//! shared [`NamespaceDirectory`](crate::namespace::NamespaceDirectory), and a
//! periodic resync tick. Because everything runs on that loop the engine
//! state needs no locking.
//!
//! Writes are best effort. A failing target is logged and skipped; the next
//! event or resync for the source retries it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::ResourceExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use extsync_common::kube_utils::{is_managed, key_of, object_key};
use extsync_common::{
    Error, Result, REPLICATED_FROM, REPLICATED_FROM_VERSION, REPLICATE_TO, REPLICATE_TO_MATCHING,
};

use crate::adapter::{ReplicaOptions, Replicable};
use crate::api::ResourceApi;
use crate::cache::{ResourceCache, WatchEvent};
use crate::namespace::{NamespaceEvent, NamespaceInfo, NamespaceLister};
use crate::pattern::NamespacePatterns;
use crate::selector::Selector;

/// Default interval between full resyncs
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Settings consumed by every engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorConfig {
    /// Interval between full resyncs of the local cache
    pub resync_period: Duration,
    /// Hostname used for Ingress/IngressRoute replicas of sources without a
    /// `top-level-domain` annotation
    pub default_hostname: Option<String>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            default_hostname: None,
        }
    }
}

/// Result of replicating one source into a set of namespaces
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// Targets that now hold an up-to-date replica of the source
    pub replicated: usize,
    /// Targets left alone because the object there is not ours to write
    pub skipped: usize,
    /// Targets attempted
    pub total: usize,
    /// Targets that failed
    pub failed: Vec<String>,
}

impl ReplicationOutcome {
    /// True when no target failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The aggregated error for a partial failure, if any
    pub fn partial_failure(&self, kind: &str, source_key: &str) -> Option<Error> {
        if self.is_complete() {
            return None;
        }
        Some(Error::PartialReplication {
            kind: kind.to_string(),
            source_key: source_key.to_string(),
            replicated: self.replicated,
            total: self.total,
            failed: self.failed.clone(),
        })
    }
}

/// Replication engine for kind `K`, writing through `A`
pub struct Replicator<K, A> {
    kind: String,
    api: A,
    namespaces: Arc<dyn NamespaceLister>,
    cache: ResourceCache<K>,
    /// Sources carrying `replicate-to`
    replicate_to: BTreeSet<String>,
    /// Sources carrying a valid `replicate-to-matching`
    replicate_to_matching: BTreeMap<String, Selector>,
    options: ReplicaOptions,
    resync_period: Duration,
}

impl<K, A> Replicator<K, A>
where
    K: Replicable,
    A: ResourceApi<K>,
{
    /// Create an engine with an empty cache
    pub fn new(api: A, namespaces: Arc<dyn NamespaceLister>, config: &ReplicatorConfig) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            api,
            namespaces,
            cache: ResourceCache::new(),
            replicate_to: BTreeSet::new(),
            replicate_to_matching: BTreeMap::new(),
            options: ReplicaOptions {
                default_hostname: config.default_hostname.clone(),
            },
            resync_period: config.resync_period,
        }
    }

    /// Kind handled by this engine
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Write access used by this engine
    pub fn api(&self) -> &A {
        &self.api
    }

    /// True after the first complete listing of the kind
    pub fn synced(&self) -> bool {
        self.cache.synced()
    }

    /// Shared synced flag, for the liveness endpoint
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        self.cache.synced_flag()
    }

    /// Process watch events, namespace notifications and resync ticks until
    /// the watch stream ends.
    pub async fn run<S>(
        mut self,
        events: S,
        mut namespace_events: broadcast::Receiver<NamespaceEvent>,
    ) where
        S: Stream<Item = std::result::Result<Event<K>, watcher::Error>>,
    {
        let mut events = std::pin::pin!(events);
        let mut resync =
            tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(kind = %self.kind, resync_period = ?self.resync_period, "Replicator started");

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_watch_event(event).await,
                    Some(Err(e)) => warn!(kind = %self.kind, error = %e, "Watch error, will retry"),
                    None => {
                        warn!(kind = %self.kind, "Watch stream ended");
                        break;
                    }
                },
                received = namespace_events.recv() => {
                    if self.handle_namespace_recv(received).await.is_break() {
                        break;
                    }
                }
                _ = resync.tick() => {
                    debug!(kind = %self.kind, objects = self.cache.len(), "Running periodic resync");
                    self.resync().await;
                }
            }
        }
    }

    /// Apply a watcher event to the cache and react to what changed
    pub async fn handle_watch_event(&mut self, event: Event<K>) {
        for change in self.cache.apply(event) {
            self.dispatch(change).await;
        }
    }

    /// Drop replicas no longer selected, then re-run add handling for every
    /// cached object
    pub async fn resync(&mut self) {
        self.prune_unselected().await;
        for change in self.cache.resync() {
            self.dispatch(change).await;
        }
    }

    /// React to a namespace notification
    pub async fn handle_namespace_event(&mut self, event: NamespaceEvent) {
        match event {
            NamespaceEvent::Added(ns) => self.on_namespace_added(&ns).await,
            NamespaceEvent::Updated { old, new } => self.on_namespace_updated(&old, &new).await,
        }
    }

    /// React to the outcome of a namespace channel receive.
    ///
    /// Missed notifications may include relabels, so a lagged receiver
    /// triggers a full resync against the current inventory.
    pub async fn handle_namespace_recv(
        &mut self,
        received: std::result::Result<NamespaceEvent, RecvError>,
    ) -> ControlFlow<()> {
        match received {
            Ok(event) => self.handle_namespace_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(kind = %self.kind, skipped, "Missed namespace events, resyncing");
                self.resync().await;
            }
            Err(RecvError::Closed) => {
                warn!(kind = %self.kind, "Namespace directory closed");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Delete replicas of selector sources in namespaces that neither the
    /// selector nor the source's patterns select anymore
    pub async fn prune_unselected(&mut self) {
        let namespaces = self.namespaces.list();
        let sources: Vec<Arc<K>> = self
            .replicate_to_matching
            .keys()
            .filter_map(|key| self.cached_source(key))
            .collect();

        for source in sources {
            let selected = self.selected_namespaces(&source);
            for ns in namespaces.iter().filter(|ns| !selected.contains(&ns.name)) {
                if let Err(e) = self.delete_replica(&ns.name, &source).await {
                    warn!(
                        kind = %self.kind,
                        source = %object_key(source.as_ref()),
                        target = %key_of(&ns.name, &source.name_any()),
                        error = %e,
                        "Failed to delete replica"
                    );
                }
            }
        }
    }

    async fn dispatch(&mut self, change: WatchEvent<K>) {
        match change {
            WatchEvent::Added(obj) => self.on_resource_added(&obj).await,
            WatchEvent::Modified { old, new } => self.on_resource_updated(&old, &new).await,
            WatchEvent::Deleted(obj) => self.on_resource_deleted(&obj).await,
        }
    }

    /// Bring every replica of `obj` up to date and remember how it selects
    /// namespaces.
    pub async fn on_resource_added(&mut self, obj: &K) {
        if is_managed(obj) {
            return;
        }
        let key = object_key(obj);

        match obj.annotations().get(REPLICATE_TO) {
            Some(_) => {
                self.replicate_to.insert(key.clone());
                let namespaces = self.namespaces.list();
                let targets: Vec<String> = pattern_targets(obj, &namespaces).into_iter().collect();
                if !targets.is_empty() {
                    self.replicate_to_namespaces(obj, &targets).await;
                }
            }
            None => {
                self.replicate_to.remove(&key);
            }
        }

        match obj.annotations().get(REPLICATE_TO_MATCHING) {
            Some(raw) => match Selector::parse(raw) {
                Ok(selector) => {
                    let source_namespace = obj.namespace().unwrap_or_default();
                    let targets: Vec<String> = self
                        .namespaces
                        .list_matching(&selector)
                        .into_iter()
                        .map(|ns| ns.name)
                        .filter(|name| *name != source_namespace)
                        .collect();
                    self.replicate_to_matching.insert(key, selector);
                    if !targets.is_empty() {
                        self.replicate_to_namespaces(obj, &targets).await;
                    }
                }
                Err(e) => {
                    warn!(kind = %self.kind, source = %key, error = %e, "Ignoring invalid namespace selector");
                    self.replicate_to_matching.remove(&key);
                }
            },
            None => {
                self.replicate_to_matching.remove(&key);
            }
        }
    }

    /// Drop replicas the new annotations no longer select, then reconcile
    pub async fn on_resource_updated(&mut self, old: &K, new: &K) {
        if is_managed(new) {
            return;
        }

        if old.annotations() != new.annotations() {
            let previous = self.selected_namespaces(old);
            let current = self.selected_namespaces(new);
            let source_key = object_key(new);

            for namespace in previous.difference(&current) {
                debug!(kind = %self.kind, source = %source_key, target = %namespace, "Namespace no longer selected");
                if let Err(e) = self.delete_replica(namespace, new).await {
                    warn!(
                        kind = %self.kind,
                        source = %source_key,
                        target = %key_of(namespace, &new.name_any()),
                        error = %e,
                        "Failed to delete replica"
                    );
                }
            }
        }

        self.on_resource_added(new).await;
    }

    /// Delete every replica of a removed source
    pub async fn on_resource_deleted(&mut self, source: &K) {
        if is_managed(source) {
            return;
        }
        let source_key = object_key(source);

        for namespace in self.selected_namespaces(source) {
            if let Err(e) = self.delete_replica(&namespace, source).await {
                warn!(
                    kind = %self.kind,
                    source = %source_key,
                    target = %key_of(&namespace, &source.name_any()),
                    error = %e,
                    "Failed to delete replica"
                );
            }
        }

        self.replicate_to.remove(&source_key);
        self.replicate_to_matching.remove(&source_key);
    }

    /// Replicate every tracked source that selects a new namespace into it
    pub async fn on_namespace_added(&mut self, ns: &NamespaceInfo) {
        let mut sources: BTreeMap<String, Arc<K>> = BTreeMap::new();

        for key in &self.replicate_to {
            let Some(source) = self.cached_source(key) else {
                continue;
            };
            let selected = source
                .annotations()
                .get(REPLICATE_TO)
                .is_some_and(|list| NamespacePatterns::parse(list).matches(&ns.name));
            if selected {
                sources.insert(key.clone(), source);
            }
        }

        for (key, selector) in &self.replicate_to_matching {
            if !selector.matches(&ns.labels) {
                continue;
            }
            if let Some(source) = self.cached_source(key) {
                sources.insert(key.clone(), source);
            }
        }

        let target = [ns.name.clone()];
        for source in sources.into_values() {
            if source.namespace().as_deref() == Some(ns.name.as_str()) {
                continue;
            }
            self.replicate_to_namespaces(&source, &target).await;
        }
    }

    /// Remove replicas a relabelled namespace stopped qualifying for, then
    /// add the ones it now qualifies for.
    pub async fn on_namespace_updated(&mut self, old: &NamespaceInfo, new: &NamespaceInfo) {
        if old.labels == new.labels {
            return;
        }

        let unselected: Vec<Arc<K>> = self
            .replicate_to_matching
            .iter()
            .filter(|(_, selector)| selector.matches(&old.labels) && !selector.matches(&new.labels))
            .filter_map(|(key, _)| self.cached_source(key))
            .collect();

        for source in unselected {
            let still_selected = source
                .annotations()
                .get(REPLICATE_TO)
                .is_some_and(|list| NamespacePatterns::parse(list).matches(&new.name));
            if still_selected {
                continue;
            }
            if let Err(e) = self.delete_replica(&new.name, &source).await {
                warn!(
                    kind = %self.kind,
                    source = %object_key(source.as_ref()),
                    target = %key_of(&new.name, &source.name_any()),
                    error = %e,
                    "Failed to delete replica"
                );
            }
        }

        self.on_namespace_added(new).await;
    }

    /// Create or update the replica of `source` in each target namespace.
    ///
    /// Failures are logged per target and aggregated into the outcome; one
    /// failing namespace never stops the others.
    pub async fn replicate_to_namespaces(
        &mut self,
        source: &K,
        targets: &[String],
    ) -> ReplicationOutcome {
        let source_key = object_key(source);
        let mut outcome = ReplicationOutcome {
            total: targets.len(),
            ..Default::default()
        };

        for namespace in targets {
            match self.replicate_to_namespace(source, namespace).await {
                Ok(true) => outcome.replicated += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) if e.is_conflict() => {
                    info!(
                        kind = %self.kind,
                        source = %source_key,
                        target = %key_of(namespace, &source.name_any()),
                        "Replica changed concurrently, next event will retry"
                    );
                    outcome.failed.push(namespace.clone());
                }
                Err(e) => {
                    warn!(
                        kind = %self.kind,
                        source = %source_key,
                        target = %key_of(namespace, &source.name_any()),
                        error = %e,
                        "Failed to replicate"
                    );
                    outcome.failed.push(namespace.clone());
                }
            }
        }

        if let Some(err) = outcome.partial_failure(&self.kind, &source_key) {
            warn!(
                kind = %self.kind,
                source = %source_key,
                skipped = outcome.skipped,
                error = %err,
                "Partial replication"
            );
        }
        outcome
    }

    async fn replicate_to_namespace(&mut self, source: &K, namespace: &str) -> Result<bool> {
        if source.namespace().as_deref() == Some(namespace) {
            return Ok(false);
        }

        let name = source.name_any();
        let target_key = key_of(namespace, &name);
        if let Some(existing) = self.cache.get(&target_key) {
            return self.update_replica(source, &existing).await;
        }

        let replica = source.build_replica(namespace, &self.options);
        let created = self.api.create(namespace, &replica).await?;
        self.cache.insert(created);
        info!(kind = %self.kind, source = %object_key(source), target = %target_key, "Created replica");
        Ok(true)
    }

    /// Rewrite `existing` from `source` unless it is not ours or already
    /// reflects the source's current version.
    ///
    /// Returns false when the target belongs to someone else.
    async fn update_replica(&mut self, source: &K, existing: &K) -> Result<bool> {
        let source_key = object_key(source);
        let target_key = object_key(existing);

        if !is_managed(existing) {
            debug!(kind = %self.kind, source = %source_key, target = %target_key, "Target is not managed, leaving it alone");
            return Ok(false);
        }
        if !replica_of(existing, &source_key) {
            debug!(kind = %self.kind, source = %source_key, target = %target_key, "Target replicates another source");
            return Ok(false);
        }
        if existing.annotations().get(REPLICATED_FROM_VERSION) == source.resource_version().as_ref() {
            debug!(kind = %self.kind, source = %source_key, target = %target_key, "Target is up to date");
            return Ok(true);
        }

        let namespace = existing.namespace().unwrap_or_default();
        let mut replica = source.build_replica(&namespace, &self.options);
        replica.meta_mut().resource_version = existing.resource_version();

        let updated = self
            .api
            .replace(&namespace, &existing.name_any(), &replica)
            .await?;
        self.cache.insert(updated);
        info!(kind = %self.kind, source = %source_key, target = %target_key, "Updated replica");
        Ok(true)
    }

    /// Delete the replica of `source` in `namespace` if there is one we own
    pub async fn delete_replica(&mut self, namespace: &str, source: &K) -> Result<()> {
        if source.namespace().as_deref() == Some(namespace) {
            return Ok(());
        }

        let source_key = object_key(source);
        let target_key = key_of(namespace, &source.name_any());
        let Some(existing) = self.cache.get(&target_key) else {
            return Ok(());
        };
        if !is_managed(existing.as_ref()) || !replica_of(existing.as_ref(), &source_key) {
            debug!(kind = %self.kind, source = %source_key, target = %target_key, "Target is not our replica, leaving it alone");
            return Ok(());
        }

        self.api.delete(namespace, &existing.name_any()).await?;
        self.cache.remove(&target_key);
        info!(kind = %self.kind, source = %source_key, target = %target_key, "Deleted replica");
        Ok(())
    }

    /// Namespaces `source` currently selects through either annotation
    fn selected_namespaces(&self, source: &K) -> BTreeSet<String> {
        let mut selected = pattern_targets(source, &self.namespaces.list());

        if let Some(raw) = source.annotations().get(REPLICATE_TO_MATCHING) {
            if let Ok(selector) = Selector::parse(raw) {
                let source_namespace = source.namespace().unwrap_or_default();
                selected.extend(
                    self.namespaces
                        .list_matching(&selector)
                        .into_iter()
                        .map(|ns| ns.name)
                        .filter(|name| *name != source_namespace),
                );
            }
        }
        selected
    }

    fn cached_source(&self, key: &str) -> Option<Arc<K>> {
        let source = self.cache.get(key);
        if source.is_none() {
            warn!(kind = %self.kind, source = %key, "Tracked source missing from cache");
        }
        source
    }
}

/// Namespaces selected by the `replicate-to` patterns of `source`
fn pattern_targets<K: Replicable>(source: &K, namespaces: &[NamespaceInfo]) -> BTreeSet<String> {
    let Some(list) = source.annotations().get(REPLICATE_TO) else {
        return BTreeSet::new();
    };
    let source_namespace = source.namespace().unwrap_or_default();
    NamespacePatterns::parse(list)
        .targets(&source_namespace, namespaces.iter().map(|ns| ns.name.as_str()))
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// True if `replica` was built from `source_key`. Replicas without the
/// provenance annotation are treated as ours.
fn replica_of<K: Replicable>(replica: &K, source_key: &str) -> bool {
    match replica.annotations().get(REPLICATED_FROM) {
        Some(from) => from == source_key,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{Call, FakeResourceApi};
    use crate::namespace::{MockNamespaceLister, NamespaceDirectory};
    use extsync_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_EXTSYNC};
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    type ServiceReplicator = Replicator<Service, FakeResourceApi<Service>>;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn service(namespace: &str, version: &str, annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(version.to_string()),
                annotations: Some(labels(annotations)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn directory(namespaces: &[(&str, &[(&str, &str)])]) -> Arc<NamespaceDirectory> {
        let directory = Arc::new(NamespaceDirectory::new());
        for (name, ns_labels) in namespaces {
            directory.apply(NamespaceInfo::new(*name, labels(ns_labels)));
        }
        directory
    }

    fn engine(directory: Arc<NamespaceDirectory>) -> ServiceReplicator {
        Replicator::new(
            FakeResourceApi::default(),
            directory,
            &ReplicatorConfig::default(),
        )
    }

    fn creates(engine: &ServiceReplicator) -> Vec<String> {
        engine
            .api()
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn pattern_replicates_to_matching_namespaces_only() {
        let mut engine = engine(directory(&[("finance", &[]), ("hr", &[]), ("engineering", &[])]));

        engine
            .handle_watch_event(Event::Apply(service("finance", "1", &[(REPLICATE_TO, "finance,hr")])))
            .await;

        assert_eq!(creates(&engine), vec!["hr/api"]);
        let replica = engine.api().stored("hr/api").unwrap();
        assert_eq!(
            replica.labels().get(LABEL_MANAGED_BY).map(String::as_str),
            Some(LABEL_MANAGED_BY_EXTSYNC)
        );
        assert_eq!(
            replica.annotations().get(REPLICATED_FROM).map(String::as_str),
            Some("finance/api")
        );
    }

    #[tokio::test]
    async fn match_all_pattern_never_targets_source_namespace() {
        let mut engine = engine(directory(&[("x", &[]), ("y", &[]), ("z", &[])]));

        engine
            .handle_watch_event(Event::Apply(service("x", "1", &[(REPLICATE_TO, ".*")])))
            .await;

        assert_eq!(creates(&engine), vec!["y/api", "z/api"]);
    }

    #[tokio::test]
    async fn unchanged_source_produces_no_further_writes() {
        let mut engine = engine(directory(&[("a", &[]), ("b", &[])]));
        let source = service("a", "1", &[(REPLICATE_TO, "b")]);

        engine.handle_watch_event(Event::Apply(source.clone())).await;
        assert_eq!(engine.api().calls().len(), 1);

        engine.handle_watch_event(Event::Apply(source)).await;
        engine.resync().await;
        assert_eq!(engine.api().calls().len(), 1);
    }

    #[tokio::test]
    async fn source_change_updates_replica_in_place() {
        let mut engine = engine(directory(&[("a", &[]), ("b", &[])]));
        let annotations = [(REPLICATE_TO, "b"), ("team", "payments")];

        engine
            .handle_watch_event(Event::Apply(service("a", "1", &annotations)))
            .await;
        engine
            .handle_watch_event(Event::Apply(service("a", "2", &annotations)))
            .await;

        assert_eq!(
            engine.api().calls(),
            vec![Call::Create("b/api".to_string()), Call::Replace("b/api".to_string())]
        );
        let replica = engine.api().stored("b/api").unwrap();
        assert_eq!(
            replica.annotations().get(REPLICATED_FROM_VERSION).map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    async fn narrowing_patterns_deletes_dropped_replica() {
        let mut engine = engine(directory(&[("src", &[]), ("a", &[]), ("b", &[])]));

        engine
            .handle_watch_event(Event::Apply(service("src", "1", &[(REPLICATE_TO, "a,b")])))
            .await;
        engine.api().clear_calls();

        engine
            .handle_watch_event(Event::Apply(service("src", "2", &[(REPLICATE_TO, "a")])))
            .await;

        assert_eq!(
            engine.api().calls(),
            vec![Call::Delete("b/api".to_string()), Call::Replace("a/api".to_string())]
        );
        assert_eq!(engine.api().keys(), vec!["a/api"]);
    }

    #[tokio::test]
    async fn selector_replicates_to_labelled_namespaces() {
        let mut engine = engine(directory(&[
            ("src", &[]),
            ("public", &[("tier", "public")]),
            ("internal", &[("tier", "internal")]),
        ]));

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;

        assert_eq!(creates(&engine), vec!["public/api"]);
    }

    #[tokio::test]
    async fn relabelled_namespace_loses_replica() {
        let directory = directory(&[("src", &[]), ("ns1", &[("tier", "public")])]);
        let mut engine = engine(directory.clone());

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;
        assert_eq!(creates(&engine), vec!["ns1/api"]);
        engine.api().clear_calls();

        let event = directory
            .apply(NamespaceInfo::new("ns1", labels(&[("tier", "internal")])))
            .unwrap();
        engine.handle_namespace_event(event).await;

        assert_eq!(engine.api().calls(), vec![Call::Delete("ns1/api".to_string())]);
        assert!(engine.api().keys().is_empty());
    }

    #[tokio::test]
    async fn changing_selector_moves_replicas() {
        let mut engine = engine(directory(&[
            ("src", &[]),
            ("public", &[("tier", "public")]),
            ("internal", &[("tier", "internal")]),
        ]));

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;
        engine.api().clear_calls();

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "2",
                &[(REPLICATE_TO_MATCHING, "tier=internal")],
            )))
            .await;

        assert_eq!(
            engine.api().calls(),
            vec![
                Call::Delete("public/api".to_string()),
                Call::Create("internal/api".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn namespace_still_selected_by_pattern_keeps_replica() {
        let directory = directory(&[("src", &[]), ("ns1", &[("tier", "public")])]);
        let mut engine = engine(directory.clone());

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO, "ns1"), (REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;
        engine.api().clear_calls();

        let event = directory
            .apply(NamespaceInfo::new("ns1", labels(&[("tier", "internal")])))
            .unwrap();
        engine.handle_namespace_event(event).await;

        assert!(engine.api().calls().is_empty());
        assert_eq!(engine.api().keys(), vec!["ns1/api"]);
    }

    #[tokio::test]
    async fn new_namespace_receives_existing_sources() {
        let directory = directory(&[("src", &[])]);
        let mut engine = engine(directory.clone());

        engine
            .handle_watch_event(Event::Apply(service("src", "1", &[(REPLICATE_TO, "preview-.*")])))
            .await;
        assert!(engine.api().calls().is_empty());

        let event = directory
            .apply(NamespaceInfo::new("preview-1", BTreeMap::new()))
            .unwrap();
        engine.handle_namespace_event(event).await;

        let event = directory
            .apply(NamespaceInfo::new("staging", BTreeMap::new()))
            .unwrap();
        engine.handle_namespace_event(event).await;

        assert_eq!(creates(&engine), vec!["preview-1/api"]);
    }

    #[tokio::test]
    async fn source_deletion_removes_all_replicas() {
        let mut engine = engine(directory(&[
            ("src", &[]),
            ("a", &[]),
            ("b", &[("tier", "public")]),
        ]));
        let source = service(
            "src",
            "1",
            &[(REPLICATE_TO, "a"), (REPLICATE_TO_MATCHING, "tier=public")],
        );

        engine.handle_watch_event(Event::Apply(source.clone())).await;
        assert_eq!(engine.api().keys(), vec!["a/api", "b/api"]);

        engine.handle_watch_event(Event::Delete(source)).await;
        assert!(engine.api().keys().is_empty());
    }

    #[tokio::test]
    async fn unmanaged_object_is_never_touched() {
        let mut engine = engine(directory(&[("src", &[]), ("hr", &[])]));
        let existing = engine.api().seed(service("hr", "0", &[]));
        engine.handle_watch_event(Event::Apply(existing)).await;

        let source = service("src", "1", &[(REPLICATE_TO, "hr")]);
        engine.handle_watch_event(Event::Apply(source.clone())).await;
        engine.handle_watch_event(Event::Delete(source)).await;

        assert!(engine.api().calls().is_empty());
        assert_eq!(engine.api().keys(), vec!["hr/api"]);
    }

    #[tokio::test]
    async fn managed_sources_are_not_replicated_further() {
        let mut engine = engine(directory(&[("a", &[]), ("b", &[])]));
        let mut replica = service("a", "1", &[(REPLICATE_TO, "b")]);
        replica.metadata.labels = Some(labels(&[(LABEL_MANAGED_BY, LABEL_MANAGED_BY_EXTSYNC)]));

        engine.handle_watch_event(Event::Apply(replica)).await;

        assert!(engine.api().calls().is_empty());
    }

    #[tokio::test]
    async fn replica_of_another_source_is_left_alone() {
        let mut engine = engine(directory(&[("team-a", &[]), ("team-c", &[]), ("hr", &[])]));

        engine
            .handle_watch_event(Event::Apply(service("team-a", "1", &[(REPLICATE_TO, "hr")])))
            .await;
        engine.api().clear_calls();

        let other = service("team-c", "5", &[(REPLICATE_TO, "hr")]);
        engine.handle_watch_event(Event::Apply(other.clone())).await;
        engine.handle_watch_event(Event::Delete(other)).await;

        assert!(engine.api().calls().is_empty());
        let replica = engine.api().stored("hr/api").unwrap();
        assert_eq!(
            replica.annotations().get(REPLICATED_FROM).map(String::as_str),
            Some("team-a/api")
        );
    }

    #[tokio::test]
    async fn one_failing_target_does_not_block_the_others() {
        let mut engine = engine(directory(&[("src", &[]), ("hr", &[]), ("ops", &[])]));
        engine.api().fail_namespace("hr");

        let source = service("src", "1", &[]);
        let outcome = engine
            .replicate_to_namespaces(&source, &["hr".to_string(), "ops".to_string()])
            .await;

        assert_eq!(
            outcome,
            ReplicationOutcome {
                replicated: 1,
                skipped: 0,
                total: 2,
                failed: vec!["hr".to_string()],
            }
        );
        assert_eq!(engine.api().keys(), vec!["ops/api"]);
        let err = outcome.partial_failure("Service", "src/api").unwrap();
        assert!(err.to_string().contains("1 of 2"));
    }

    #[tokio::test]
    async fn unmanaged_target_is_counted_as_skipped() {
        let mut engine = engine(directory(&[("src", &[]), ("hr", &[]), ("ops", &[])]));
        let existing = engine.api().seed(service("hr", "0", &[]));
        engine.handle_watch_event(Event::Apply(existing)).await;

        let source = service("src", "1", &[]);
        let outcome = engine
            .replicate_to_namespaces(&source, &["hr".to_string(), "ops".to_string()])
            .await;

        assert_eq!(
            outcome,
            ReplicationOutcome {
                replicated: 1,
                skipped: 1,
                total: 2,
                failed: Vec::new(),
            }
        );
        assert!(outcome.is_complete());
        assert_eq!(creates(&engine), vec!["ops/api"]);
    }

    #[tokio::test]
    async fn invalid_selector_is_not_evaluated() {
        let mut lister = MockNamespaceLister::new();
        lister
            .expect_list()
            .returning(|| vec![NamespaceInfo::new("hr", BTreeMap::new())]);
        lister.expect_list_matching().never();

        let mut engine: ServiceReplicator = Replicator::new(
            FakeResourceApi::default(),
            Arc::new(lister),
            &ReplicatorConfig::default(),
        );

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO, "hr"), (REPLICATE_TO_MATCHING, "tier in (a")],
            )))
            .await;

        assert_eq!(creates(&engine), vec!["hr/api"]);
        assert!(engine.replicate_to_matching.is_empty());
        assert!(engine.replicate_to.contains("src/api"));
    }

    #[tokio::test]
    async fn lagged_namespace_channel_still_removes_unselected_replica() {
        let directory = directory(&[("src", &[]), ("ns1", &[("tier", "public")])]);
        let mut engine = engine(directory.clone());
        let mut namespace_events = directory.subscribe();

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;
        assert_eq!(creates(&engine), vec!["ns1/api"]);
        engine.api().clear_calls();

        directory.apply(NamespaceInfo::new("ns1", labels(&[("tier", "internal")])));
        for i in 0..300 {
            directory.apply(NamespaceInfo::new(format!("burst-{i}"), BTreeMap::new()));
        }

        let received = namespace_events.recv().await;
        assert!(matches!(received, Err(RecvError::Lagged(_))));
        let flow = engine.handle_namespace_recv(received).await;

        assert!(flow.is_continue());
        assert_eq!(engine.api().calls(), vec![Call::Delete("ns1/api".to_string())]);
        assert!(engine.api().keys().is_empty());
    }

    #[tokio::test]
    async fn periodic_resync_prunes_replicas_of_relabelled_namespace() {
        let directory = directory(&[("src", &[]), ("ns1", &[("tier", "public")])]);
        let mut engine = engine(directory.clone());

        engine
            .handle_watch_event(Event::Apply(service(
                "src",
                "1",
                &[(REPLICATE_TO_MATCHING, "tier=public")],
            )))
            .await;
        engine.api().clear_calls();

        // The relabel notification never reaches the engine
        directory.apply(NamespaceInfo::new("ns1", labels(&[("tier", "internal")])));
        engine.resync().await;
        engine.resync().await;

        assert_eq!(engine.api().calls(), vec![Call::Delete("ns1/api".to_string())]);
    }

    #[tokio::test]
    async fn closed_namespace_channel_stops_the_engine() {
        let mut engine = engine(directory(&[]));
        let flow = engine.handle_namespace_recv(Err(RecvError::Closed)).await;
        assert!(flow.is_break());
    }

    #[tokio::test]
    async fn run_processes_initial_listing_and_reports_synced() {
        let directory = directory(&[("src", &[]), ("hr", &[])]);
        let engine = engine(directory.clone());
        let synced = engine.synced_flag();

        let events: Vec<std::result::Result<Event<Service>, watcher::Error>> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(service("src", "1", &[(REPLICATE_TO, "hr")]))),
            Ok(Event::InitDone),
        ];
        engine
            .run(futures::stream::iter(events), directory.subscribe())
            .await;

        assert!(synced.load(std::sync::atomic::Ordering::SeqCst));
    }
}
