use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Client, Resource, ResourceExt,
    api::{Api, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// Read and write access to one kind of persisted object.
///
/// Writes carry the object's `resourceVersion`; a stale version fails with
/// [`Error::KubeError`] holding a 409, see [`is_conflict`].
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;
    /// Replace metadata and spec
    async fn replace(&self, obj: &K) -> Result<K>;
    /// Replace the status subresource
    async fn replace_status(&self, obj: &K) -> Result<K>;
}

#[must_use]
pub fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::KubeError(kube::Error::Api(ae)) if ae.code == 409)
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.api::<K>(&obj.namespace().unwrap_or_default())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj).map_err(Error::SerializationError)?;
        self.api::<K>(&obj.namespace().unwrap_or_default())
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
            .map_err(Error::KubeError)
    }
}
