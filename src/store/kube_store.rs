//! API server backed object store

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

use super::{store_error, ManagedObject, ObjectStore, FIELD_MANAGER};
use crate::Result;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: ManagedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| store_error::<K>("get", name, e))
    }

    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        K::api(self.client.clone(), obj.meta().namespace.as_deref())
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| store_error::<K>("create", &name, e))
    }

    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        K::api(self.client.clone(), obj.meta().namespace.as_deref())
            .replace(&name, &Self::post_params(), obj)
            .await
            .map_err(|e| store_error::<K>("update", &name, e))
    }

    async fn delete<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        match K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(store_error::<K>("delete", name, e)),
        }
    }

    async fn patch_status<K: ManagedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        K::api(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error::<K>("update status of", name, e))?;
        Ok(())
    }
}
