use async_trait::async_trait;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conflict while writing {kind} {name}")]
    Conflict { kind: &'static str, name: String },
    #[error("Kubernetes API error: {0}")]
    Api(#[source] kube::Error),
}

impl StoreError {
    fn from_kube<K: k8s_openapi::Resource>(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 409 => Self::Conflict {
                kind: K::KIND,
                name: name.to_string(),
            },
            err => Self::Api(err),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

impl WriteOutcome {
    pub fn wrote(self) -> bool {
        self != Self::Unchanged
    }
}

/// Namespaced access to one kind of object. Writes are conditional on the
/// resource version carried by the written object.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError>;

    async fn list(&self) -> Result<Vec<K>, StoreError>;

    async fn create(&self, object: &K) -> Result<K, StoreError>;

    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError>;

    /// Yields once for every observed change of the named object. The stream
    /// ends when the underlying subscription closes.
    fn watch(&self, name: &str) -> BoxStream<'static, ()>;
}

pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + k8s_openapi::Resource,
    K: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError> {
        self.api
            .get_opt(name)
            .await
            .map_err(|err| StoreError::from_kube::<K>(name, err))
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(StoreError::Api)
    }

    async fn create(&self, object: &K) -> Result<K, StoreError> {
        let name = object.meta().name.clone().unwrap_or_default();
        debug!("Creating {} {}", <K as k8s_openapi::Resource>::KIND, name);
        self.api
            .create(&PostParams::default(), object)
            .await
            .map_err(|err| StoreError::from_kube::<K>(&name, err))
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError> {
        debug!("Replacing {} {}", <K as k8s_openapi::Resource>::KIND, name);
        self.api
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|err| StoreError::from_kube::<K>(name, err))
    }

    fn watch(&self, name: &str) -> BoxStream<'static, ()> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let name = name.to_string();

        watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(move |event| {
                ready(match event {
                    Ok(_) => Some(()),
                    Err(err) => {
                        warn!(
                            "Watch of {} {} failed: {}",
                            <K as k8s_openapi::Resource>::KIND,
                            name,
                            err
                        );
                        None
                    }
                })
            })
            .boxed()
    }
}
