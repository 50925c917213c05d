use getset::{CopyGetters, Getters};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum LoadBalancerConfigError {
    #[error("Failed to decode load balancer configuration: {0}")]
    Decode(#[from] serde_yaml::Error),
    #[error("Invalid load balancer configuration: {field} {value:?} must be one of Local, Cluster")]
    InvalidTrafficPolicy { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
pub enum TrafficPolicy {
    Local,
    Cluster,
}

impl Display for TrafficPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

impl TrafficPolicy {
    fn parse_field(
        field: &'static str,
        value: Option<String>,
        default: Self,
    ) -> Result<Self, LoadBalancerConfigError> {
        match value {
            None => Ok(default),
            Some(value) if value.is_empty() => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| LoadBalancerConfigError::InvalidTrafficPolicy { field, value }),
        }
    }
}

/// Operator-desired state of the cluster load balancer.
#[derive(TypedBuilder, Getters, CopyGetters, Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    #[getset(get = "pub")]
    #[builder(default)]
    annotations: BTreeMap<String, String>,

    #[getset(get_copy = "pub")]
    #[builder(default = TrafficPolicy::Cluster)]
    internal_traffic_policy: TrafficPolicy,

    #[getset(get_copy = "pub")]
    #[builder(default = TrafficPolicy::Local)]
    external_traffic_policy: TrafficPolicy,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawLoadBalancerConfig {
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    internal_traffic_policy: Option<String>,
    #[serde(default)]
    external_traffic_policy: Option<String>,
}

impl LoadBalancerConfig {
    /// Parses the YAML document of the load balancer configuration. An empty
    /// document yields the defaults.
    pub fn from_yaml(document: &str) -> Result<Self, LoadBalancerConfigError> {
        let raw: RawLoadBalancerConfig = if document.trim().is_empty() {
            RawLoadBalancerConfig::default()
        } else {
            serde_yaml::from_str::<Option<RawLoadBalancerConfig>>(document)?.unwrap_or_default()
        };

        Ok(Self {
            annotations: raw.annotations.unwrap_or_default(),
            internal_traffic_policy: TrafficPolicy::parse_field(
                "internalTrafficPolicy",
                raw.internal_traffic_policy,
                TrafficPolicy::Cluster,
            )?,
            external_traffic_policy: TrafficPolicy::parse_field(
                "externalTrafficPolicy",
                raw.external_traffic_policy,
                TrafficPolicy::Local,
            )?,
        })
    }
}
