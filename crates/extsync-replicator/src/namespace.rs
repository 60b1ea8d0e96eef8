//! Shared namespace inventory
//!
//! A single [`NamespaceDirectory`] watches cluster namespaces and is handed to
//! every replication engine. Engines read the inventory through
//! [`NamespaceLister`] and learn about new or relabelled namespaces from a
//! broadcast subscription.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::selector::Selector;

/// Channel capacity for namespace notifications
const NAMESPACE_CHANNEL_CAPACITY: usize = 256;

/// The parts of a namespace replication decisions depend on
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace name
    pub name: String,
    /// Namespace labels
    pub labels: BTreeMap<String, String>,
    /// Creation timestamp
    pub created: Option<DateTime<Utc>>,
}

impl NamespaceInfo {
    /// Build an entry from a name and label pairs
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
            created: None,
        }
    }
}

impl From<&Namespace> for NamespaceInfo {
    fn from(ns: &Namespace) -> Self {
        Self {
            name: ns.name_any(),
            labels: ns.labels().clone(),
            created: ns.creation_timestamp().map(|t| t.0),
        }
    }
}

/// Notification fanned out to engines
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEvent {
    /// A namespace appeared
    Added(NamespaceInfo),
    /// A known namespace changed
    Updated {
        /// State before the change
        old: NamespaceInfo,
        /// State after the change
        new: NamespaceInfo,
    },
}

/// Read access to the namespace inventory
#[cfg_attr(test, automock)]
pub trait NamespaceLister: Send + Sync {
    /// Every known namespace
    fn list(&self) -> Vec<NamespaceInfo>;

    /// Namespaces whose labels satisfy `selector`
    fn list_matching(&self, selector: &Selector) -> Vec<NamespaceInfo>;
}

/// Watches namespaces and keeps an in-memory inventory of them
pub struct NamespaceDirectory {
    namespaces: RwLock<BTreeMap<String, NamespaceInfo>>,
    events: broadcast::Sender<NamespaceEvent>,
    synced: Arc<AtomicBool>,
}

impl Default for NamespaceDirectory {
    fn default() -> Self {
        let (events, _) = broadcast::channel(NAMESPACE_CHANNEL_CAPACITY);
        Self {
            namespaces: RwLock::new(BTreeMap::new()),
            events,
            synced: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl NamespaceLister for NamespaceDirectory {
    fn list(&self) -> Vec<NamespaceInfo> {
        self.namespaces.read().values().cloned().collect()
    }

    fn list_matching(&self, selector: &Selector) -> Vec<NamespaceInfo> {
        self.namespaces
            .read()
            .values()
            .filter(|ns| selector.matches(&ns.labels))
            .cloned()
            .collect()
    }
}

impl NamespaceDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to namespace notifications
    pub fn subscribe(&self) -> broadcast::Receiver<NamespaceEvent> {
        self.events.subscribe()
    }

    /// Flag set once the first namespace listing completed
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.synced)
    }

    /// Look up a single namespace
    pub fn get(&self, name: &str) -> Option<NamespaceInfo> {
        self.namespaces.read().get(name).cloned()
    }

    /// Record the current state of a namespace and notify subscribers.
    ///
    /// Returns the emitted event, or `None` when nothing changed.
    pub fn apply(&self, info: NamespaceInfo) -> Option<NamespaceEvent> {
        let previous = self
            .namespaces
            .write()
            .insert(info.name.clone(), info.clone());

        let event = match previous {
            Some(old) if old == info => return None,
            Some(old) => NamespaceEvent::Updated { old, new: info },
            None => NamespaceEvent::Added(info),
        };

        // No receivers yet is fine, engines read the inventory on startup
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Forget a namespace
    pub fn remove(&self, name: &str) {
        if self.namespaces.write().remove(name).is_some() {
            debug!(namespace = %name, "Namespace removed from inventory");
        }
    }

    /// Apply one watcher event.
    ///
    /// `relist` collects the names seen between `Init` and `InitDone` so
    /// namespaces deleted while the watch was down are dropped.
    pub fn handle_event(&self, event: Event<Namespace>, relist: &mut Option<HashSet<String>>) {
        match event {
            Event::Init => {
                *relist = Some(HashSet::new());
            }
            Event::InitApply(ns) => {
                let info = NamespaceInfo::from(&ns);
                if let Some(seen) = relist.as_mut() {
                    seen.insert(info.name.clone());
                }
                self.apply(info);
            }
            Event::InitDone => {
                if let Some(seen) = relist.take() {
                    let stale: Vec<String> = self
                        .namespaces
                        .read()
                        .keys()
                        .filter(|name| !seen.contains(*name))
                        .cloned()
                        .collect();
                    for name in stale {
                        self.remove(&name);
                    }
                }
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(
                        namespaces = self.namespaces.read().len(),
                        "Namespace inventory synced"
                    );
                }
            }
            Event::Apply(ns) => {
                self.apply(NamespaceInfo::from(&ns));
            }
            Event::Delete(ns) => {
                self.remove(&ns.name_any());
            }
        }
    }

    /// Watch namespaces until the stream ends
    pub async fn run(self: Arc<Self>, client: Client) {
        let api: Api<Namespace> = Api::all(client);
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let mut relist = None;

        info!("Namespace directory started");

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event, &mut relist),
                Err(e) => warn!(error = %e, "Namespace watch error, will retry"),
            }
        }

        warn!("Namespace watch stream ended");
    }
}
