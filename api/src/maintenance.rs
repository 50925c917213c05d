use crate::constants::MAINTENANCE_KEY;
use getset::CopyGetters;
use std::collections::BTreeMap;

/// Point-in-time view of the global maintenance flag, read once per reconciliation.
#[derive(CopyGetters, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    #[getset(get_copy = "pub")]
    active: bool,
}

impl MaintenanceSnapshot {
    pub fn new(active: bool) -> Self {
        Self { active }
    }

    pub fn from_global_config(data: Option<&BTreeMap<String, String>>) -> Self {
        let active = data
            .and_then(|data| data.get(MAINTENANCE_KEY))
            .is_some_and(|value| !value.trim().is_empty());
        Self { active }
    }
}
