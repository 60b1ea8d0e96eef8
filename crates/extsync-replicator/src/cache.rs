//! Local mirror of one resource kind
//!
//! The kube watcher only reports the latest state of an object. The engine
//! needs the previous state too, to diff annotations on update, so every
//! watcher event passes through [`ResourceCache::apply`] which keeps the last
//! seen object per `namespace/name` and translates the event into a
//! [`WatchEvent`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::runtime::watcher::Event;
use kube::Resource;

use extsync_common::kube_utils::object_key;

/// A change to one object of the watched kind
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    /// The object was not known before
    Added(Arc<K>),
    /// The object changed (or is re-delivered by a resync)
    Modified {
        /// Last cached state
        old: Arc<K>,
        /// Current state
        new: Arc<K>,
    },
    /// The object is gone
    Deleted(Arc<K>),
}

/// Objects of one kind keyed by `namespace/name`
pub struct ResourceCache<K> {
    objects: HashMap<String, Arc<K>>,
    /// Keys cached when a relist started and not seen again yet
    unseen: Option<HashSet<String>>,
    synced: Arc<AtomicBool>,
}

impl<K> Default for ResourceCache<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            unseen: None,
            synced: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<K: Resource> ResourceCache<K> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Point lookup by `namespace/name`
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects.get(key).cloned()
    }

    /// Store an object, typically the result of a successful write
    pub fn insert(&mut self, obj: K) {
        self.objects.insert(object_key(&obj), Arc::new(obj));
    }

    /// Drop an object
    pub fn remove(&mut self, key: &str) -> Option<Arc<K>> {
        self.objects.remove(key)
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// True once the first complete listing has been applied
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Shared handle on the synced flag
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.synced)
    }

    /// Update the cache from a watcher event and return what changed
    pub fn apply(&mut self, event: Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            Event::Init => {
                self.unseen = Some(self.objects.keys().cloned().collect());
                Vec::new()
            }
            Event::InitApply(obj) => {
                let key = object_key(&obj);
                if let Some(unseen) = self.unseen.as_mut() {
                    unseen.remove(&key);
                }
                vec![self.upsert(key, obj)]
            }
            Event::InitDone => {
                let mut events = Vec::new();
                if let Some(stale) = self.unseen.take() {
                    for key in stale {
                        if let Some(obj) = self.objects.remove(&key) {
                            events.push(WatchEvent::Deleted(obj));
                        }
                    }
                }
                self.synced.store(true, Ordering::SeqCst);
                events
            }
            Event::Apply(obj) => {
                let key = object_key(&obj);
                vec![self.upsert(key, obj)]
            }
            Event::Delete(obj) => {
                let key = object_key(&obj);
                let last = self.objects.remove(&key).unwrap_or_else(|| Arc::new(obj));
                vec![WatchEvent::Deleted(last)]
            }
        }
    }

    /// Re-deliver every cached object as an unchanged modification
    pub fn resync(&self) -> Vec<WatchEvent<K>> {
        self.objects
            .values()
            .map(|obj| WatchEvent::Modified {
                old: Arc::clone(obj),
                new: Arc::clone(obj),
            })
            .collect()
    }

    fn upsert(&mut self, key: String, obj: K) -> WatchEvent<K> {
        let new = Arc::new(obj);
        match self.objects.insert(key, Arc::clone(&new)) {
            Some(old) => WatchEvent::Modified { old, new },
            None => WatchEvent::Added(new),
        }
    }
}
