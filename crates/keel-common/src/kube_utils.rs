//! Kubernetes-backed implementations of the store seams
//!
//! [`KubeStatusClient`] implements [`StatusClient`] on top of kube-rs. Status
//! writes use `replace_status`, which carries the object's resourceVersion so
//! the API server rejects writes made against a stale copy with 409 Conflict.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::status::StatusClient;
use crate::{Error, Result};

/// HTTP status code the API server uses for missing objects
const NOT_FOUND: u16 = 404;

/// HTTP status code the API server uses for stale resourceVersions
const CONFLICT: u16 = 409;

/// Whether a kube-rs error is the API server reporting a missing object
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == NOT_FOUND)
}

/// Whether a kube-rs error is an optimistic concurrency conflict
pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == CONFLICT)
}

/// Status client for a namespaced custom resource
pub struct KubeStatusClient<K> {
    client: Client,
    field_manager: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStatusClient<K> {
    /// Create a status client using the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: None,
            _kind: PhantomData,
        }
    }

    /// Record writes under the given field manager
    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = Some(manager.into());
        self
    }
}

impl<K> Clone for KubeStatusClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            field_manager: self.field_manager.clone(),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> StatusClient<K> for KubeStatusClient<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(obj),
            Err(e) if is_kube_not_found(&e) => Err(Error::not_found(
                K::kind(&K::DynamicType::default()),
                namespace,
                name,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: self.field_manager.clone(),
            ..Default::default()
        };

        let data = serde_json::to_vec(obj)?;
        let updated = api.replace_status(&obj.name_any(), &params, data).await?;
        Ok(updated)
    }
}
