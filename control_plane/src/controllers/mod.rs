mod filters;
mod ingress;
mod load_balancer;
mod readiness;
mod retry;
mod sync;
mod transformers;

pub use self::ingress::IngressContext;
pub use self::load_balancer::LoadBalancerContext;
pub use self::readiness::DeploymentReadinessWatcher;

use self::retry::ErrorKind;
use self::sync::{
    IngressSyncError, IngressSynchronizer, LoadBalancerSyncError, LoadBalancerSynchronizer,
};
use self::transformers::AggregationError;
use crate::events::KubeEventPublisher;
use crate::kubernetes::{KubeStore, ObjectStore, StoreError};
use crate::options::Options;
use ces_discovery_api::constants::GLOBAL_CONFIG_NAME;
use ces_discovery_api::descriptors::DescriptorError;
use ces_discovery_api::load_balancer::LoadBalancerConfigError;
use ces_discovery_api::maintenance::MaintenanceSnapshot;
use ces_discovery_core::task::Builder as TaskBuilder;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use std::pin::pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ingress(#[from] IngressSyncError),
    #[error(transparent)]
    LoadBalancer(#[from] LoadBalancerSyncError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    LoadBalancerConfig(#[from] LoadBalancerConfigError),
    #[error("Failed to read {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Invalid declarations stay invalid until the declaring object changes.
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Ingress(IngressSyncError::Descriptors(
                DescriptorError::Decode { .. } | DescriptorError::DecodeRewrite { .. },
            ))
            | Self::Ingress(IngressSyncError::MissingOwner(_))
            | Self::Aggregation(_)
            | Self::LoadBalancerConfig(_) => ErrorKind::Permanent,
            Self::Ingress(_) | Self::LoadBalancer(_) | Self::Read { .. } => ErrorKind::Transient,
        }
    }
}

async fn read_maintenance(
    config_maps: &dyn ObjectStore<ConfigMap>,
) -> Result<MaintenanceSnapshot, ReconcileError> {
    let global_config = config_maps
        .get(GLOBAL_CONFIG_NAME)
        .await
        .map_err(|source| ReconcileError::Read {
            what: GLOBAL_CONFIG_NAME,
            source,
        })?;

    Ok(MaintenanceSnapshot::from_global_config(
        global_config.as_ref().and_then(|config_map| config_map.data.as_ref()),
    ))
}

/// Moves `stream` onto its own task so controllers can consume it as a `Sync`
/// trigger stream.
fn forward<T>(
    task_builder: &TaskBuilder,
    name: &'static str,
    stream: impl Stream<Item = T> + Send + 'static,
) -> ReceiverStream<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);

    task_builder.new_task(name).spawn(async move {
        let mut stream = pin!(stream);
        while let Some(item) = stream.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}

#[derive(TypedBuilder)]
pub struct SpawnControllersParams {
    options: Arc<Options>,
    client: Client,
    #[builder(setter(into))]
    namespace: String,
    #[builder(default)]
    instance: Option<String>,
}

pub fn spawn_controllers(task_builder: &TaskBuilder, params: SpawnControllersParams) {
    let SpawnControllersParams {
        options,
        client,
        namespace,
        instance,
    } = params;

    let services: Arc<dyn ObjectStore<Service>> =
        Arc::new(KubeStore::<Service>::new(client.clone(), &namespace));
    let config_maps: Arc<dyn ObjectStore<ConfigMap>> =
        Arc::new(KubeStore::<ConfigMap>::new(client.clone(), &namespace));
    let readiness = DeploymentReadinessWatcher::new(Arc::new(KubeStore::<Deployment>::new(
        client.clone(),
        &namespace,
    )));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), instance));

    let synchronizer = IngressSynchronizer::builder()
        .namespace(namespace.clone())
        .ingresses(Arc::new(KubeStore::<Ingress>::new(client.clone(), &namespace)))
        .readiness(readiness.clone())
        .events(events)
        .conflict_retries(options.conflict_retries())
        .build();
    let ingress_context = IngressContext::builder()
        .options(options.clone())
        .services(services.clone())
        .config_maps(config_maps.clone())
        .synchronizer(synchronizer)
        .readiness(readiness)
        .cancellation_token(task_builder.cancellation_token())
        .build();
    ingress::spawn_ingress_controller(task_builder, &client, &namespace, ingress_context);

    let load_balancer_context = LoadBalancerContext::builder()
        .options(options.clone())
        .services(services.clone())
        .config_maps(config_maps)
        .synchronizer(
            LoadBalancerSynchronizer::builder()
                .namespace(namespace.clone())
                .services(services)
                .conflict_retries(options.conflict_retries())
                .build(),
        )
        .build();
    load_balancer::spawn_load_balancer_controller(
        task_builder,
        &client,
        &namespace,
        load_balancer_context,
    );
}
