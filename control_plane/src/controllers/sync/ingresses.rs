use crate::controllers::readiness::{DeploymentReadinessWatcher, ReadinessError};
use crate::controllers::transformers::{DesiredIngress, IngressMode, is_maintenance_exempt};
use crate::events::{EventPublisher, actions, reasons};
use crate::kubernetes::{ObjectStore, StoreError, WriteOutcome};
use ces_discovery_api::constants::DOGU_NAME_LABEL;
use ces_discovery_api::descriptors::{
    DescriptorError, parse_additional_ingress_annotations, parse_service_descriptors,
};
use ces_discovery_api::maintenance::MaintenanceSnapshot;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum IngressSyncError {
    #[error(transparent)]
    Descriptors(#[from] DescriptorError),
    #[error("Failed to check readiness of service {service}: {source}")]
    Readiness {
        service: String,
        #[source]
        source: ReadinessError,
    },
    #[error("Service {0} has no uid and cannot own its ingresses")]
    MissingOwner(String),
    #[error("Failed to apply ingress {name}: {source}")]
    Apply {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Applies the ingresses a service declares, routed according to the
/// maintenance flag and the readiness of the dogu behind the service.
#[derive(TypedBuilder)]
pub struct IngressSynchronizer {
    #[builder(setter(into))]
    namespace: String,
    ingresses: Arc<dyn ObjectStore<Ingress>>,
    readiness: DeploymentReadinessWatcher,
    events: Arc<dyn EventPublisher>,
    #[builder(default = 5)]
    conflict_retries: usize,
}

impl IngressSynchronizer {
    /// Returns the mode every declared ingress was applied in, keyed by
    /// ingress name. A service without descriptors yields an empty map.
    #[instrument(skip_all, fields(service = %service.name_any()))]
    pub async fn upsert_for_service(
        &self,
        service: &Service,
        maintenance: MaintenanceSnapshot,
    ) -> Result<BTreeMap<String, IngressMode>, IngressSyncError> {
        let service_name = service.name_any();
        let Some(descriptors) = parse_service_descriptors(service.annotations())? else {
            debug!("Service {} declares no ingresses", service_name);
            return Ok(BTreeMap::new());
        };
        let additional_annotations = parse_additional_ingress_annotations(service.annotations())?;
        let owner = service
            .controller_owner_ref(&())
            .ok_or_else(|| IngressSyncError::MissingOwner(service_name.clone()))?;

        let maintenance = maintenance.active() && !is_maintenance_exempt(service);
        let readiness = match service.labels().get(DOGU_NAME_LABEL) {
            Some(dogu) if !maintenance => Some(self.readiness.is_ready(dogu).await.map_err(
                |source| IngressSyncError::Readiness {
                    service: service_name.clone(),
                    source,
                },
            )?),
            _ => None,
        };
        let mode = IngressMode::select(maintenance, readiness);

        let mut applied = BTreeMap::new();
        for descriptor in &descriptors {
            let desired =
                DesiredIngress::new(descriptor, &service_name, mode, &additional_annotations);
            let outcome = self.apply(&desired, &owner).await?;

            let mode_name: &'static str = mode.into();
            if outcome.wrote() {
                info!("Applied ingress {} in {} mode", desired.name(), mode_name);
                if mode == IngressMode::Ready {
                    self.publish_ready_event(service, &desired).await;
                }
            } else {
                debug!("Ingress {} already up to date in {} mode", desired.name(), mode_name);
            }

            applied.insert(desired.name().clone(), mode);
        }

        Ok(applied)
    }

    async fn apply(
        &self,
        desired: &DesiredIngress,
        owner: &OwnerReference,
    ) -> Result<WriteOutcome, IngressSyncError> {
        let mut attempt = 1;
        loop {
            match self.apply_once(desired, owner).await {
                Err(err) if err.is_conflict() && attempt < self.conflict_retries => {
                    debug!(
                        "Conflict writing ingress {} (attempt {}), retrying",
                        desired.name(),
                        attempt
                    );
                    attempt += 1;
                }
                result => {
                    return result.map_err(|source| IngressSyncError::Apply {
                        name: desired.name().clone(),
                        source,
                    });
                }
            }
        }
    }

    async fn apply_once(
        &self,
        desired: &DesiredIngress,
        owner: &OwnerReference,
    ) -> Result<WriteOutcome, StoreError> {
        match self.ingresses.get(desired.name()).await? {
            None => {
                let ingress = desired.to_ingress(&self.namespace, owner);
                self.ingresses.create(&ingress).await?;
                Ok(WriteOutcome::Created)
            }
            Some(existing) => match desired.apply_to(&existing, owner) {
                None => Ok(WriteOutcome::Unchanged),
                Some(updated) => {
                    self.ingresses.replace(desired.name(), &updated).await?;
                    Ok(WriteOutcome::Updated)
                }
            },
        }
    }

    async fn publish_ready_event(&self, service: &Service, desired: &DesiredIngress) {
        let reference = event_reference(service);
        self.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::INGRESS_CREATION,
                actions::RECONCILE,
                Some(format!(
                    "Created regular ingress {} for service {}",
                    desired.name(),
                    service.name_any()
                )),
            )
            .await;
    }
}

/// Events go to the workload owning the service, or the service itself.
fn event_reference(service: &Service) -> ObjectReference {
    service
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .map_or_else(
            || service.object_ref(&()),
            |owner| ObjectReference {
                api_version: Some(owner.api_version.clone()),
                kind: Some(owner.kind.clone()),
                name: Some(owner.name.clone()),
                namespace: service.namespace(),
                uid: Some(owner.uid.clone()),
                ..Default::default()
            },
        )
}
