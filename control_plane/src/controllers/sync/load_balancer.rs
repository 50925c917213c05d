use crate::kubernetes::{ObjectStore, StoreError, WriteOutcome};
use ces_discovery_api::constants::{
    LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION, LOAD_BALANCER_NAME, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE,
};
use ces_discovery_api::load_balancer::LoadBalancerConfig;
use ces_discovery_api::ports::{ExposedPorts, PortIdentity};
use itertools::Itertools;
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use typed_builder::TypedBuilder;

const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

#[derive(Debug, Error)]
pub enum LoadBalancerSyncError {
    #[error("Failed to apply load balancer {name}: {0}", name = LOAD_BALANCER_NAME)]
    Apply(#[source] StoreError),
}

/// The singleton load balancer service. Annotations listed in the managed
/// annotations meta annotation belong to this controller, all others are left
/// alone.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancer(Service);

impl From<Service> for LoadBalancer {
    fn from(service: Service) -> Self {
        Self(service)
    }
}

impl LoadBalancer {
    pub fn new(
        namespace: &str,
        config: &LoadBalancerConfig,
        exposed_ports: &ExposedPorts,
        selector: &BTreeMap<String, String>,
    ) -> Self {
        let mut load_balancer = Self(Service {
            metadata: ObjectMeta {
                name: Some(LOAD_BALANCER_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec::default()),
            status: None,
        });

        load_balancer.apply_config(config);
        load_balancer.set_selector(selector);
        load_balancer.set_ports(exposed_ports);
        load_balancer
    }

    pub fn name(&self) -> String {
        self.0.name_any()
    }

    pub fn as_service(&self) -> &Service {
        &self.0
    }

    pub fn into_service(self) -> Service {
        self.0
    }

    fn spec_mut(&mut self) -> &mut ServiceSpec {
        self.0.spec.get_or_insert_with(ServiceSpec::default)
    }

    pub fn managed_keys(&self) -> BTreeSet<String> {
        self.0
            .annotations()
            .get(LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION)
            .map(|keys| {
                keys.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn managed_annotations(&self) -> BTreeMap<String, String> {
        let annotations = self.0.annotations();
        self.managed_keys()
            .into_iter()
            .filter_map(|key| annotations.get(&key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    /// Replaces the previously managed annotations with the configured ones
    /// and overwrites the traffic policies.
    pub fn apply_config(&mut self, config: &LoadBalancerConfig) {
        let previously_managed = self.managed_keys();

        let annotations = self.0.annotations_mut();
        for key in &previously_managed {
            annotations.remove(key);
        }
        annotations.extend(
            config
                .annotations()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        annotations.insert(
            LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION.to_string(),
            config.annotations().keys().join(","),
        );

        let spec = self.spec_mut();
        spec.type_ = Some(LOAD_BALANCER_TYPE.to_string());
        spec.internal_traffic_policy = Some(config.internal_traffic_policy().to_string());
        spec.external_traffic_policy = Some(config.external_traffic_policy().to_string());
    }

    pub fn set_selector(&mut self, selector: &BTreeMap<String, String>) {
        self.spec_mut().selector = Some(selector.clone());
    }

    pub fn set_ports(&mut self, exposed_ports: &ExposedPorts) {
        self.spec_mut().ports = Some(exposed_ports.to_service_ports());
    }

    /// Copies the node port of every current listener port onto the desired
    /// port with the same identity. Unmatched ports get no node port.
    pub fn preserve_node_ports(&self, exposed_ports: &mut ExposedPorts) {
        let node_ports: HashMap<PortIdentity, i32> = self
            .0
            .spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .filter_map(|port| Some((PortIdentity::from_service_port(port)?, port.node_port?)))
            .collect();

        for port in exposed_ports.iter_mut() {
            port.set_node_port(node_ports.get(&port.identity()).copied());
        }
    }

    pub fn port_identities(&self) -> BTreeSet<PortIdentity> {
        self.0
            .spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .filter_map(PortIdentity::from_service_port)
            .collect()
    }

    fn traffic_policies(&self) -> (Option<&String>, Option<&String>) {
        let spec = self.0.spec.as_ref();
        (
            spec.and_then(|spec| spec.internal_traffic_policy.as_ref()),
            spec.and_then(|spec| spec.external_traffic_policy.as_ref()),
        )
    }

    /// Compares only what this controller manages: node ports, port order and
    /// foreign annotations are ignored.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.name() == other.name()
            && self.managed_annotations() == other.managed_annotations()
            && self.traffic_policies() == other.traffic_policies()
            && self.port_identities() == other.port_identities()
    }
}

#[derive(TypedBuilder)]
pub struct LoadBalancerSynchronizer {
    #[builder(setter(into))]
    namespace: String,
    services: Arc<dyn ObjectStore<Service>>,
    #[builder(default = 5)]
    conflict_retries: usize,
}

impl LoadBalancerSynchronizer {
    #[instrument(skip_all, fields(ports = exposed_ports.len()))]
    pub async fn reconcile(
        &self,
        config: &LoadBalancerConfig,
        exposed_ports: &ExposedPorts,
        selector: &BTreeMap<String, String>,
    ) -> Result<WriteOutcome, LoadBalancerSyncError> {
        let mut attempt = 1;
        loop {
            match self.reconcile_once(config, exposed_ports, selector).await {
                Err(err) if err.is_conflict() && attempt < self.conflict_retries => {
                    debug!("Conflict writing load balancer (attempt {}), retrying", attempt);
                    attempt += 1;
                }
                Ok(outcome) => {
                    if outcome.wrote() {
                        info!("Load balancer {} {:?}", LOAD_BALANCER_NAME, outcome);
                    }
                    return Ok(outcome);
                }
                Err(err) => return Err(LoadBalancerSyncError::Apply(err)),
            }
        }
    }

    async fn reconcile_once(
        &self,
        config: &LoadBalancerConfig,
        exposed_ports: &ExposedPorts,
        selector: &BTreeMap<String, String>,
    ) -> Result<WriteOutcome, StoreError> {
        let Some(existing) = self.services.get(LOAD_BALANCER_NAME).await? else {
            let load_balancer = LoadBalancer::new(&self.namespace, config, exposed_ports, selector);
            self.services.create(load_balancer.as_service()).await?;
            return Ok(WriteOutcome::Created);
        };

        let existing = LoadBalancer::from(existing);
        let mut desired = existing.clone();
        desired.apply_config(config);
        desired.set_selector(selector);

        let mut ports = exposed_ports.clone();
        existing.preserve_node_ports(&mut ports);
        desired.set_ports(&ports);

        if desired == existing {
            return Ok(WriteOutcome::Unchanged);
        }

        self.services
            .replace(LOAD_BALANCER_NAME, desired.as_service())
            .await?;
        Ok(WriteOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::fake::InMemoryStore;
    use assertables::assert_ok;
    use ces_discovery_api::constants::{DOGU_NAME_LABEL, LOAD_BALANCER_SELECTOR_VALUE};
    use ces_discovery_api::load_balancer::TrafficPolicy;
    use ces_discovery_api::ports::{ExposedPort, Protocol};
    use k8s_openapi::api::core::v1::ServicePort;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use proptest::prelude::*;

    const NAMESPACE: &str = "ecosystem";

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([(
            DOGU_NAME_LABEL.to_string(),
            LOAD_BALANCER_SELECTOR_VALUE.to_string(),
        )])
    }

    fn config(annotations: &[(&str, &str)]) -> LoadBalancerConfig {
        LoadBalancerConfig::builder()
            .annotations(
                annotations
                    .iter()
                    .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                    .collect(),
            )
            .build()
    }

    fn port(service: &str, number: u16, target_port: u16) -> ExposedPort {
        ExposedPort::builder()
            .name(format!("{service}-{number}"))
            .service_name(service)
            .port(number)
            .target_port(target_port)
            .build()
    }

    fn service_port(name: &str, number: i32, node_port: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            protocol: Some("TCP".to_string()),
            port: number,
            target_port: Some(IntOrString::Int(number)),
            node_port: Some(node_port),
            ..Default::default()
        }
    }

    fn existing(annotations: &[(&str, &str)], ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(LOAD_BALANCER_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(LOAD_BALANCER_TYPE.to_string()),
                ports: Some(ports),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn synchronizer(store: Arc<InMemoryStore<Service>>) -> LoadBalancerSynchronizer {
        LoadBalancerSynchronizer::builder()
            .namespace(NAMESPACE)
            .services(store)
            .build()
    }

    fn node_ports(service: &Service) -> BTreeMap<String, Option<i32>> {
        service
            .spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .map(|port| (port.name.clone().unwrap_or_default(), port.node_port))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_creates_missing_load_balancer() {
        let store: Arc<InMemoryStore<Service>> = Arc::new(InMemoryStore::default());
        let synchronizer = synchronizer(store.clone());

        let outcome = assert_ok!(
            synchronizer
                .reconcile(
                    &config(&[("b.example.com/x", "1"), ("a.example.com/y", "2")]),
                    &ExposedPorts::with_defaults(),
                    &selector(),
                )
                .await
        );
        assert_eq!(outcome, WriteOutcome::Created);

        let created = store.object(LOAD_BALANCER_NAME).unwrap_or_default();
        let spec = created.spec.clone().unwrap_or_default();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
        assert_eq!(spec.internal_traffic_policy.as_deref(), Some("Cluster"));
        assert_eq!(spec.selector, Some(selector()));
        assert_eq!(
            created
                .annotations()
                .get(LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION)
                .map(String::as_str),
            Some("a.example.com/y,b.example.com/x")
        );
        assert_eq!(
            node_ports(&created),
            BTreeMap::from([
                ("default-http".to_string(), None),
                ("default-https".to_string(), None)
            ])
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_preserves_node_ports_by_identity() {
        let store = Arc::new(InMemoryStore::with_objects([existing(
            &[],
            vec![
                service_port("default-http", 80, 30080),
                service_port("default-https", 443, 30443),
                service_port("redmine-50000", 50000, 31000),
            ],
        )]));
        let synchronizer = synchronizer(store.clone());

        let mut ports = ExposedPorts::with_defaults();
        ports.extend([port("redmine", 50000, 50001), port("scm", 2222, 2222)]);
        ports.canonicalize();

        let outcome = assert_ok!(
            synchronizer
                .reconcile(&LoadBalancerConfig::default(), &ports, &selector())
                .await
        );
        assert_eq!(outcome, WriteOutcome::Updated);

        let updated = store.object(LOAD_BALANCER_NAME).unwrap_or_default();
        assert_eq!(
            node_ports(&updated),
            BTreeMap::from([
                ("default-http".to_string(), Some(30080)),
                ("default-https".to_string(), Some(30443)),
                ("redmine-50000".to_string(), None),
                ("scm-2222".to_string(), None),
            ])
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_foreign_annotations_are_untouched() {
        let store = Arc::new(InMemoryStore::with_objects([existing(
            &[
                ("metallb.universe.tf/ip-allocated-from-pool", "default"),
                ("old.example.com/managed", "yes"),
                (LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION, "old.example.com/managed"),
            ],
            vec![service_port("default-http", 80, 30080)],
        )]));
        let synchronizer = synchronizer(store.clone());

        assert_ok!(
            synchronizer
                .reconcile(
                    &config(&[("new.example.com/managed", "true")]),
                    &ExposedPorts::with_defaults(),
                    &selector(),
                )
                .await
        );

        let updated = store.object(LOAD_BALANCER_NAME).unwrap_or_default();
        assert_eq!(
            updated.annotations(),
            &BTreeMap::from([
                (
                    "metallb.universe.tf/ip-allocated-from-pool".to_string(),
                    "default".to_string()
                ),
                ("new.example.com/managed".to_string(), "true".to_string()),
                (
                    LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION.to_string(),
                    "new.example.com/managed".to_string()
                ),
            ])
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_reconcile_is_idempotent() {
        let store: Arc<InMemoryStore<Service>> = Arc::new(InMemoryStore::default());
        let synchronizer = synchronizer(store.clone());
        let config = config(&[("a.example.com/x", "1")]);

        let first = assert_ok!(
            synchronizer
                .reconcile(&config, &ExposedPorts::with_defaults(), &selector())
                .await
        );
        let second = assert_ok!(
            synchronizer
                .reconcile(&config, &ExposedPorts::with_defaults(), &selector())
                .await
        );

        assert_eq!(first, WriteOutcome::Created);
        assert_eq!(second, WriteOutcome::Unchanged);
        assert_eq!(store.writes(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(InMemoryStore::with_objects([existing(&[], vec![])]));
        store.conflict_next_replaces(1);
        let synchronizer = synchronizer(store.clone());

        let outcome = assert_ok!(
            synchronizer
                .reconcile(
                    &LoadBalancerConfig::default(),
                    &ExposedPorts::with_defaults(),
                    &selector()
                )
                .await
        );
        assert_eq!(outcome, WriteOutcome::Updated);
    }

    #[test]
    fn test_equivalence_ignores_node_ports_order_and_foreign_annotations() {
        let config = config(&[("a.example.com/x", "1")]);
        let ports = ExposedPorts::with_defaults();
        let base = LoadBalancer::new(NAMESPACE, &config, &ports, &selector());

        let mut reordered = base.clone().into_service();
        if let Some(spec) = reordered.spec.as_mut() {
            let mut service_ports = spec.ports.take().unwrap_or_default();
            service_ports.reverse();
            for service_port in &mut service_ports {
                service_port.node_port = Some(30000 + service_port.port);
            }
            spec.ports = Some(service_ports);
        }
        reordered
            .annotations_mut()
            .insert("foreign.example.com/x".to_string(), "y".to_string());
        assert!(base.is_equivalent(&LoadBalancer::from(reordered)));

        let mut changed = base.clone();
        changed.apply_config(&config_with_policy(TrafficPolicy::Cluster));
        assert!(!base.is_equivalent(&changed));

        let mut reannotated = base.clone();
        reannotated.apply_config(&LoadBalancerConfig::default());
        assert!(!base.is_equivalent(&reannotated));

        let mut more_ports = base.clone();
        let mut ports = ExposedPorts::with_defaults();
        ports.extend([port("scm", 2222, 2222)]);
        more_ports.set_ports(&ports);
        assert!(!base.is_equivalent(&more_ports));
    }

    fn config_with_policy(external: TrafficPolicy) -> LoadBalancerConfig {
        LoadBalancerConfig::builder()
            .annotations(BTreeMap::from([(
                "a.example.com/x".to_string(),
                "1".to_string(),
            )]))
            .external_traffic_policy(external)
            .build()
    }

    fn arb_exposed_port() -> impl Strategy<Value = ExposedPort> {
        (0u8..6, 1u16..4, prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)]).prop_map(
            |(service, target, protocol)| {
                let number = 1000 + u16::from(service);
                ExposedPort::builder()
                    .name(format!("dogu{service}-{number}"))
                    .service_name(format!("dogu{service}"))
                    .protocol(protocol)
                    .port(number)
                    .target_port(number + target)
                    .build()
            },
        )
    }

    proptest! {
        #[test]
        fn test_node_port_preservation(
            previous in proptest::collection::vec(arb_exposed_port(), 0..6),
            desired in proptest::collection::vec(arb_exposed_port(), 0..6),
        ) {
            let mut previous: ExposedPorts = previous.into_iter().collect();
            for (index, port) in previous.iter_mut().enumerate() {
                port.set_node_port(Some(30000 + i32::try_from(index).unwrap_or_default()));
            }
            let existing = LoadBalancer::new(
                NAMESPACE,
                &LoadBalancerConfig::default(),
                &previous,
                &selector(),
            );

            let mut desired: ExposedPorts = desired.into_iter().collect();
            existing.preserve_node_ports(&mut desired);

            for port in desired.iter() {
                let expected = previous
                    .iter()
                    .find(|candidate| candidate.identity() == port.identity())
                    .and_then(ExposedPort::node_port);
                prop_assert_eq!(port.node_port(), expected);
            }
        }
    }
}
