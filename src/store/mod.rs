//! Object store abstraction
//!
//! The reconciler reads and writes single objects by kind, namespace and
//! name. [`KubeStore`] talks to the API server; [`MemoryStore`] keeps objects
//! in process and is what the test-suite drives the engine against.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "lightspeed-operator";

/// Builds an [`Api`] for a resource scope
pub trait ApiScope {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl ApiScope for NamespaceResourceScope {
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::namespaced(client, namespace.unwrap_or_default())
    }
}

impl ApiScope for ClusterResourceScope {
    fn api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

/// Any statically typed Kubernetes object the operator reads or writes
pub trait ManagedObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

impl<K> ManagedObject for K
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::Scope: ApiScope,
{
    fn api(client: Client, namespace: Option<&str>) -> Api<K> {
        <K::Scope as ApiScope>::api::<K>(client, namespace)
    }
}

/// Single-object reads and writes against a backing store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get<K: ManagedObject>(&self, namespace: Option<&str>, name: &str)
        -> Result<Option<K>>;

    /// Create an object, failing if it already exists
    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K>;

    /// Replace an existing object; a stale resourceVersion is a conflict
    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K>;

    /// Delete an object, returning whether it existed
    async fn delete<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool>;

    /// Replace the status of an object
    async fn patch_status<K: ManagedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;
}

pub(crate) fn store_error<K: ManagedObject>(
    action: &'static str,
    name: &str,
    message: impl ToString,
) -> Error {
    Error::StoreError {
        action,
        kind: K::kind_name(),
        name: name.to_string(),
        message: message.to_string(),
    }
}
