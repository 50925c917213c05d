use super::filters::{maintenance_relevant, watch_changes};
use super::readiness::DeploymentReadinessWatcher;
use super::retry::{RetryTracker, compute_backoff};
use super::sync::IngressSynchronizer;
use super::transformers::IngressMode;
use super::{ReconcileError, forward, read_maintenance};
use crate::kubernetes::ObjectStore;
use crate::options::Options;
use ces_discovery_api::constants::{DOGU_NAME_LABEL, GLOBAL_CONFIG_NAME};
use ces_discovery_core::task::Builder as TaskBuilder;
use dashmap::DashSet;
use futures::StreamExt;
use futures::future::ready;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

#[derive(TypedBuilder)]
pub struct IngressContext {
    options: Arc<Options>,
    services: Arc<dyn ObjectStore<Service>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    synchronizer: IngressSynchronizer,
    readiness: DeploymentReadinessWatcher,
    cancellation_token: CancellationToken,
    #[builder(default)]
    retries: RetryTracker,
    /// Services with a pending readiness wait.
    #[builder(default)]
    waiting: DashSet<String>,
}

pub(super) fn spawn_ingress_controller(
    task_builder: &TaskBuilder,
    client: &Client,
    namespace: &str,
    context: IngressContext,
) {
    let services = Api::<Service>::namespaced(client.clone(), namespace);
    let ingresses = Api::<Ingress>::namespaced(client.clone(), namespace);
    let deployments = Api::<Deployment>::namespaced(client.clone(), namespace);
    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), namespace);

    let maintenance_triggers = forward(
        task_builder,
        "maintenance_triggers",
        watch_changes(
            config_maps,
            watcher::Config::default().fields(&format!("metadata.name={GLOBAL_CONFIG_NAME}")),
        )
        .filter(|change| ready(maintenance_relevant(change)))
        .map(|_| info!("Maintenance mode changed, reconciling all services")),
    );

    let namespace = namespace.to_string();
    let context = Arc::new(context);
    let results_context = context.clone();

    task_builder
        .new_task(stringify!(spawn_ingress_controller))
        .spawn(async move {
            info!("Starting ingress controller");
            Controller::new(services, watcher::Config::default())
                .owns(ingresses, watcher::Config::default())
                .watches(deployments, watcher::Config::default(), move |deployment| {
                    Some(ObjectRef::new(&deployment.name_any()).within(&namespace))
                })
                .reconcile_all_on(maintenance_triggers)
                .shutdown_on_signal()
                .run(reconcile, error_policy, context)
                .for_each(|result| {
                    record_result(&results_context, result);
                    ready(())
                })
                .await;
            info!("Ingress controller stopped");
        });
}

type ControllerResult =
    Result<(ObjectRef<Service>, Action), controller::Error<ReconcileError, watcher::Error>>;

/// A requeued service that no longer exists is reported as not found; its
/// retry state is dropped then.
fn record_result(context: &IngressContext, result: ControllerResult) {
    match result {
        Ok((service, _)) => debug!("Reconciled ingresses of service {}", service.name),
        Err(controller::Error::ObjectNotFound(service)) => {
            debug!("Service {} is gone, forgetting its retries", service.name);
            context.retries.reset(&service.name);
        }
        Err(err) => debug!("Ingress reconciliation failed: {}", err),
    }
}

#[instrument(skip_all, fields(service = %service.name_any()))]
async fn reconcile(
    service: Arc<Service>,
    context: Arc<IngressContext>,
) -> Result<Action, ReconcileError> {
    let maintenance = read_maintenance(context.config_maps.as_ref()).await?;
    let modes = context
        .synchronizer
        .upsert_for_service(&service, maintenance)
        .await?;
    context.retries.reset(&service.name_any());

    if modes.values().any(|mode| *mode == IngressMode::Starting) {
        spawn_readiness_wait(&service, &context);
    }

    Ok(Action::requeue(context.options.controller_requeue_duration()))
}

fn error_policy(
    service: Arc<Service>,
    error: &ReconcileError,
    context: Arc<IngressContext>,
) -> Action {
    let name = service.name_any();
    let attempt = context.retries.increment(&name);
    warn!(
        "Failed to reconcile ingresses of service {} (attempt {}): {}",
        name, attempt, error
    );
    compute_backoff(attempt, error.kind())
}

/// Re-applies the ingresses of `service` once its dogu becomes ready, without
/// waiting for the next change of the service. At most one wait runs per
/// service.
fn spawn_readiness_wait(service: &Service, context: &Arc<IngressContext>) {
    let Some(dogu) = service.labels().get(DOGU_NAME_LABEL).cloned() else {
        return;
    };
    let service_name = service.name_any();
    if !context.waiting.insert(service_name.clone()) {
        debug!("Already waiting for service {} to become ready", service_name);
        return;
    }

    let context = context.clone();
    tokio::spawn(async move {
        let result = context
            .readiness
            .wait_for_ready(
                &dogu,
                context.options.readiness_timeout(),
                context.options.readiness_poll_interval(),
                context.cancellation_token.clone(),
                || promote(&context, &service_name),
            )
            .await;
        context.waiting.remove(&service_name);

        if let Err(err) = result {
            warn!(
                "Stopped waiting for service {} to become ready: {}",
                service_name, err
            );
        }
    });
}

async fn promote(context: &IngressContext, service_name: &str) {
    let result = async {
        let service = context
            .services
            .get(service_name)
            .await
            .map_err(|source| ReconcileError::Read {
                what: "service",
                source,
            })?;
        let Some(service) = service else {
            debug!("Service {} is gone, nothing to promote", service_name);
            context.retries.reset(service_name);
            return Ok(());
        };

        let maintenance = read_maintenance(context.config_maps.as_ref()).await?;
        context
            .synchronizer
            .upsert_for_service(&service, maintenance)
            .await?;
        Ok::<_, ReconcileError>(())
    }
    .await;

    if let Err(err) = result {
        warn!(
            "Failed to promote ingresses of service {}: {}",
            service_name, err
        );
    }
}
