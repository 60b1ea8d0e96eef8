//! Cluster writes for one resource kind
//!
//! [`ResourceApi`] is the seam between the engine and the API server.
//! [`KubeResourceApi`] is the production implementation; tests use an
//! in-memory fake.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use extsync_common::kube_utils::key_of;
use extsync_common::{Error, Result};

/// Create/replace/delete access to namespaced objects of kind `K`
#[async_trait]
pub trait ResourceApi<K>: Send + Sync {
    /// Create `obj` in `namespace`
    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace `namespace/name` with `obj`.
    ///
    /// `obj` carries the resourceVersion it was derived from; a stale one
    /// fails with [`Error::VersionConflict`].
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;

    /// Delete `namespace/name`; an already missing object is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ResourceApi`] backed by a kube client
pub struct KubeResourceApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeResourceApi<K> {
    /// Create an API handle from a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeResourceApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceApi<K> for KubeResourceApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        self.api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| {
                let name = obj.meta().name.clone().unwrap_or_default();
                Error::from_kube(K::kind(&()), key_of(namespace, &name), e)
            })
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        self.api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), key_of(namespace, name), e))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match Error::from_kube(K::kind(&()), key_of(namespace, name), e) {
                err if err.is_not_found() => Ok(()),
                err => Err(err),
            },
        }
    }
}
