use super::filters::{
    exposed_ports_relevant, load_balancer_config_relevant, load_balancer_relevant, watch_changes,
};
use super::retry::{RetryTracker, compute_backoff};
use super::sync::LoadBalancerSynchronizer;
use super::transformers::aggregate_from;
use super::{ReconcileError, forward};
use crate::kubernetes::ObjectStore;
use crate::options::Options;
use ces_discovery_api::constants::{
    DOGU_NAME_LABEL, LOAD_BALANCER_CONFIG_KEY, LOAD_BALANCER_CONFIG_NAME, LOAD_BALANCER_NAME,
    LOAD_BALANCER_SELECTOR_VALUE,
};
use ces_discovery_api::load_balancer::{LoadBalancerConfig, LoadBalancerConfigError};
use ces_discovery_core::task::Builder as TaskBuilder;
use futures::future::ready;
use futures::{StreamExt, stream};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

#[derive(TypedBuilder)]
pub struct LoadBalancerContext {
    options: Arc<Options>,
    services: Arc<dyn ObjectStore<Service>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    synchronizer: LoadBalancerSynchronizer,
    #[builder(default)]
    retries: RetryTracker,
}

pub fn load_balancer_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        DOGU_NAME_LABEL.to_string(),
        LOAD_BALANCER_SELECTOR_VALUE.to_string(),
    )])
}

/// Reads the YAML document of the load balancer config map. A missing document
/// yields the defaults.
pub fn load_balancer_config_from(
    config_map: &ConfigMap,
) -> Result<LoadBalancerConfig, LoadBalancerConfigError> {
    let document = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(LOAD_BALANCER_CONFIG_KEY))
        .map_or("", String::as_str);
    LoadBalancerConfig::from_yaml(document)
}

/// The single reconciliation key of the load balancer. It names the config map
/// but stands in for it whether or not the config map exists.
fn reconcile_key(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(LOAD_BALANCER_CONFIG_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(super) fn spawn_load_balancer_controller(
    task_builder: &TaskBuilder,
    client: &Client,
    namespace: &str,
    context: LoadBalancerContext,
) {
    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), namespace);
    let services = Api::<Service>::namespaced(client.clone(), namespace);
    let key = reconcile_key(namespace);
    let key_ref = ObjectRef::from_obj(&key);

    let (reader, mut writer) = reflector::store();
    for event in [
        watcher::Event::Init,
        watcher::Event::InitApply(key.clone()),
        watcher::Event::InitDone,
    ] {
        writer.apply_watcher_event(&event);
    }

    let config_triggers = {
        let key_ref = key_ref.clone();
        forward(
            task_builder,
            "load_balancer_config_triggers",
            watch_changes(
                config_maps,
                watcher::Config::default()
                    .fields(&format!("metadata.name={LOAD_BALANCER_CONFIG_NAME}")),
            )
            .filter(|change| ready(load_balancer_config_relevant(change)))
            .map(move |_| {
                debug!("Load balancer config {} changed", LOAD_BALANCER_CONFIG_NAME);
                key_ref.clone()
            }),
        )
    };

    let service_triggers = {
        let key_ref = key_ref.clone();
        forward(
            task_builder,
            "exposed_ports_triggers",
            watch_changes(services.clone(), watcher::Config::default())
                .filter(|change| ready(exposed_ports_relevant(change)))
                .map(move |change| {
                    debug!("Exposed ports of service {} changed", change.object().name_any());
                    key_ref.clone()
                }),
        )
    };

    let load_balancer_triggers = forward(
        task_builder,
        "load_balancer_triggers",
        watch_changes(
            services,
            watcher::Config::default().fields(&format!("metadata.name={LOAD_BALANCER_NAME}")),
        )
        .filter(|change| ready(load_balancer_relevant(change)))
        .map(move |_| {
            debug!("Load balancer {} drifted", LOAD_BALANCER_NAME);
            key_ref.clone()
        }),
    );

    let context = Arc::new(context);

    task_builder
        .new_task(stringify!(spawn_load_balancer_controller))
        .spawn(async move {
            info!("Starting load balancer controller");
            // Owns the store holding the reconcile key.
            let _writer = writer;
            Controller::for_stream(stream::once(ready(Ok::<_, watcher::Error>(key))), reader)
                .reconcile_on(config_triggers)
                .reconcile_on(service_triggers)
                .reconcile_on(load_balancer_triggers)
                .shutdown_on_signal()
                .run(reconcile, error_policy, context)
                .for_each(|result| {
                    match result {
                        Ok((key, _)) => debug!("Reconciled load balancer for {}", key.name),
                        Err(err) => debug!("Load balancer reconciliation failed: {}", err),
                    }
                    ready(())
                })
                .await;
            info!("Load balancer controller stopped");
        });
}

async fn read_config(
    config_maps: &dyn ObjectStore<ConfigMap>,
) -> Result<LoadBalancerConfig, ReconcileError> {
    let config_map = config_maps
        .get(LOAD_BALANCER_CONFIG_NAME)
        .await
        .map_err(|source| ReconcileError::Read {
            what: LOAD_BALANCER_CONFIG_NAME,
            source,
        })?;

    match config_map {
        Some(config_map) => Ok(load_balancer_config_from(&config_map)?),
        None => {
            debug!("Config map {} not found, using defaults", LOAD_BALANCER_CONFIG_NAME);
            Ok(LoadBalancerConfig::default())
        }
    }
}

#[instrument(skip_all, fields(key = %key.name_any()))]
async fn reconcile(
    key: Arc<ConfigMap>,
    context: Arc<LoadBalancerContext>,
) -> Result<Action, ReconcileError> {
    let config = read_config(context.config_maps.as_ref()).await?;
    let services = context
        .services
        .list()
        .await
        .map_err(|source| ReconcileError::Read {
            what: "services",
            source,
        })?;
    let exposed_ports = aggregate_from(&services)?;

    context
        .synchronizer
        .reconcile(&config, &exposed_ports, &load_balancer_selector())
        .await?;
    context.retries.reset(&key.name_any());

    Ok(Action::requeue(context.options.controller_requeue_duration()))
}

fn error_policy(
    key: Arc<ConfigMap>,
    error: &ReconcileError,
    context: Arc<LoadBalancerContext>,
) -> Action {
    let attempt = context.retries.increment(&key.name_any());
    warn!(
        "Failed to reconcile load balancer (attempt {}): {}",
        attempt, error
    );
    compute_backoff(attempt, error.kind())
}
