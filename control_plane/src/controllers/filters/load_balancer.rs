use super::ObjectChange;
use crate::controllers::sync::LoadBalancer;
use k8s_openapi::api::core::v1::Service;

/// Creation is always our own doing, so only deletions, resyncs and drift
/// from the managed state are relevant.
pub fn load_balancer_relevant(change: &ObjectChange<Service>) -> bool {
    match change {
        ObjectChange::Created(_) => false,
        ObjectChange::Deleted(_) | ObjectChange::Generic(_) => true,
        ObjectChange::Updated { old, new } => {
            !LoadBalancer::from((**old).clone()).is_equivalent(&LoadBalancer::from((**new).clone()))
        }
    }
}
