use super::ObjectChange;
use ces_discovery_api::constants::GLOBAL_CONFIG_NAME;
use ces_discovery_api::maintenance::MaintenanceSnapshot;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

fn snapshot(config_map: &ConfigMap) -> MaintenanceSnapshot {
    MaintenanceSnapshot::from_global_config(config_map.data.as_ref())
}

/// Whether a change of the global configuration toggles maintenance mode.
pub fn maintenance_relevant(change: &ObjectChange<ConfigMap>) -> bool {
    if change.object().name_any() != GLOBAL_CONFIG_NAME {
        return false;
    }

    match change {
        ObjectChange::Created(_) | ObjectChange::Deleted(_) => true,
        ObjectChange::Generic(_) => false,
        ObjectChange::Updated { old, new } => snapshot(old) != snapshot(new),
    }
}
