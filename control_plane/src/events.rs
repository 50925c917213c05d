use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

pub const REPORTING_CONTROLLER: &str = "ces-discovery-control-plane";

pub mod reasons {
    pub const INGRESS_CREATION: &str = "IngressCreation";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}

/// Publishes Kubernetes events. Publishing never fails a reconciliation, so
/// errors are only logged.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %err, "Failed to publish Kubernetes event");
        }
    }
}
