mod load_balancer;
mod load_balancer_config;
mod maintenance;
mod services;

pub use load_balancer::load_balancer_relevant;
pub use load_balancer_config::load_balancer_config_relevant;
pub use maintenance::maintenance_relevant;
pub use services::exposed_ports_relevant;

use futures::future::ready;
use futures::{Stream, StreamExt, stream};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::warn;

/// A change to a watched object as seen by the trigger predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectChange<K> {
    Created(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
    /// The object was observed again without changing.
    Generic(Arc<K>),
}

impl<K> ObjectChange<K> {
    /// The most recent state of the object.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Created(object) | Self::Deleted(object) | Self::Generic(object) => object,
            Self::Updated { new, .. } => new,
        }
    }
}

/// Turns raw watch events into [`ObjectChange`]s by remembering the last seen
/// state of every object.
pub struct ChangeTracker<K> {
    known: HashMap<String, Arc<K>>,
    relisted: Option<HashSet<String>>,
}

impl<K> Default for ChangeTracker<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K> ChangeTracker<K>
where
    K: Resource,
{
    pub fn track(&mut self, event: watcher::Event<K>) -> Vec<ObjectChange<K>> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(object.name_any());
                }
                vec![self.observe(object)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let vanished: Vec<_> = self
                    .known
                    .keys()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|name| self.known.remove(&name))
                    .map(ObjectChange::Deleted)
                    .collect()
            }
            watcher::Event::Apply(object) => vec![self.observe(object)],
            watcher::Event::Delete(object) => {
                self.known.remove(&object.name_any());
                vec![ObjectChange::Deleted(Arc::new(object))]
            }
        }
    }

    fn observe(&mut self, object: K) -> ObjectChange<K> {
        let new = Arc::new(object);
        match self.known.insert(new.name_any(), new.clone()) {
            None => ObjectChange::Created(new),
            Some(old) if old.resource_version() == new.resource_version() => {
                ObjectChange::Generic(new)
            }
            Some(old) => ObjectChange::Updated { old, new },
        }
    }
}

/// Watches `api` and yields every change. Watch errors are retried with
/// backoff and otherwise only logged.
pub fn watch_changes<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = ObjectChange<K>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let mut tracker = ChangeTracker::default();

    watcher(api, config)
        .default_backoff()
        .filter_map(|event| {
            ready(
                event
                    .inspect_err(|err| warn!("Watch failed: {}", err))
                    .ok(),
            )
        })
        .flat_map(move |event| stream::iter(tracker.track(event)))
}
