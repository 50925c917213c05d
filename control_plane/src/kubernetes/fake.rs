use super::store::{ObjectStore, StoreError};
use async_trait::async_trait;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::{StreamExt, stream};
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Versioned in-memory object store that rejects writes carrying a stale
/// resource version, the way the API server does.
pub struct InMemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    pending_conflicts: AtomicUsize,
    watches_closed: AtomicBool,
    changes: broadcast::Sender<String>,
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            objects: Mutex::default(),
            next_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
            watches_closed: AtomicBool::new(false),
            changes,
        }
    }
}

impl<K> InMemoryStore<K>
where
    K: Resource<DynamicType = ()> + k8s_openapi::Resource + Clone + Send + Sync + 'static,
{
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::default();
        for object in objects {
            store.insert(object);
        }
        store
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self, object: &mut K) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let meta = object.meta_mut();
        let name = meta.name.clone().unwrap_or_default();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{name}"));
        }
        name
    }

    /// Stores `object` as another actor would, without counting it as a write.
    pub fn insert(&self, mut object: K) -> K {
        let name = self.stamp(&mut object);
        self.objects().insert(name.clone(), object.clone());
        let _ = self.changes.send(name);
        object
    }

    /// Like [`Self::insert`], but without notifying watchers.
    pub fn insert_silently(&self, mut object: K) -> K {
        let name = self.stamp(&mut object);
        self.objects().insert(name, object.clone());
        object
    }

    /// Makes every later `watch` end immediately.
    pub fn close_watches(&self) {
        self.watches_closed.store(true, Ordering::SeqCst);
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects().get(name).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next `count` replace calls fail with a conflict, after
    /// bumping the stored version as a concurrent writer would.
    pub fn conflict_next_replaces(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn conflict(name: &str) -> StoreError {
        StoreError::Conflict {
            kind: K::KIND,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for InMemoryStore<K>
where
    K: Resource<DynamicType = ()> + k8s_openapi::Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.object(name))
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        Ok(self.objects().values().cloned().collect())
    }

    async fn create(&self, object: &K) -> Result<K, StoreError> {
        let mut object = object.clone();
        let name = object.meta().name.clone().unwrap_or_default();
        if self.objects().contains_key(&name) {
            return Err(Self::conflict(&name));
        }

        self.stamp(&mut object);
        self.objects().insert(name.clone(), object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(name);
        Ok(object)
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, StoreError> {
        let pending = self.pending_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_conflicts.store(pending - 1, Ordering::SeqCst);
            if let Some(current) = self.object(name) {
                self.insert(current);
            }
            return Err(Self::conflict(name));
        }

        let current_version = self
            .objects()
            .get(name)
            .and_then(|current| current.meta().resource_version.clone());
        if current_version.is_none() || current_version != object.meta().resource_version {
            return Err(Self::conflict(name));
        }

        let mut object = object.clone();
        self.stamp(&mut object);
        self.objects().insert(name.to_string(), object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(name.to_string());
        Ok(object)
    }

    fn watch(&self, name: &str) -> BoxStream<'static, ()> {
        if self.watches_closed.load(Ordering::SeqCst) {
            return stream::empty().boxed();
        }

        let name = name.to_string();
        BroadcastStream::new(self.changes.subscribe())
            .filter_map(move |changed| {
                ready(matches!(changed, Ok(changed) if changed == name).then_some(()))
            })
            .boxed()
    }
}
