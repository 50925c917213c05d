use super::ObjectChange;
use ces_discovery_api::constants::LOAD_BALANCER_CONFIG_NAME;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

pub fn load_balancer_config_relevant(change: &ObjectChange<ConfigMap>) -> bool {
    change.object().name_any() == LOAD_BALANCER_CONFIG_NAME
}
