use crate::constants::EXPOSED_PORTS_ANNOTATION;
use getset::{CopyGetters, Getters};
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;
use typed_builder::TypedBuilder;

const DEFAULT_SERVICE_NAME: &str = "default";

#[derive(Debug, Error)]
pub enum ExposedPortError {
    #[error("Failed to decode annotation {annotation}: {source}", annotation = EXPOSED_PORTS_ANNOTATION)]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid exposed port: unsupported protocol {0:?}, expected one of tcp, udp, sctp")]
    UnsupportedProtocol(String),
    #[error("Invalid exposed port: {field} {value} must be between 0 and 65535")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("Invalid exposed port: {name} is declared twice with different settings")]
    DuplicateName { name: String },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

/// The part of a port that stays stable across reconciliations; the node port
/// is assigned by the cluster and therefore not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortIdentity {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub target_port: u16,
}

impl PortIdentity {
    pub fn from_service_port(service_port: &ServicePort) -> Option<Self> {
        let port = u16::try_from(service_port.port).ok()?;
        let protocol = match service_port.protocol.as_deref() {
            None => Protocol::default(),
            Some(protocol) => protocol.parse().ok()?,
        };
        let target_port = match &service_port.target_port {
            None => port,
            Some(IntOrString::Int(target_port)) => u16::try_from(*target_port).ok()?,
            Some(IntOrString::String(target_port)) => target_port.parse().ok()?,
        };

        Some(Self {
            name: service_port.name.clone().unwrap_or_default(),
            protocol,
            port,
            target_port,
        })
    }
}

#[derive(TypedBuilder, Getters, CopyGetters, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExposedPort {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    name: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    service_name: String,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    protocol: Protocol,

    #[getset(get_copy = "pub")]
    port: u16,

    #[getset(get_copy = "pub")]
    target_port: u16,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    node_port: Option<i32>,
}

impl ExposedPort {
    pub fn identity(&self) -> PortIdentity {
        PortIdentity {
            name: self.name.clone(),
            protocol: self.protocol,
            port: self.port,
            target_port: self.target_port,
        }
    }

    pub fn set_node_port(&mut self, node_port: Option<i32>) {
        self.node_port = node_port;
    }

    pub fn to_service_port(&self) -> ServicePort {
        ServicePort {
            name: Some(self.name.clone()),
            protocol: Some(self.protocol.to_string()),
            port: i32::from(self.port),
            target_port: Some(IntOrString::Int(i32::from(self.target_port))),
            node_port: self.node_port,
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExposedPort {
    protocol: String,
    port: i64,
    target_port: i64,
}

fn validate_port(field: &'static str, value: i64) -> Result<u16, ExposedPortError> {
    u16::try_from(value).map_err(|_| ExposedPortError::OutOfRange { field, value })
}

impl RawExposedPort {
    fn validate(self, service_name: &str) -> Result<ExposedPort, ExposedPortError> {
        let protocol = self
            .protocol
            .parse::<Protocol>()
            .map_err(|_| ExposedPortError::UnsupportedProtocol(self.protocol.clone()))?;
        let port = validate_port("port", self.port)?;
        let target_port = validate_port("targetPort", self.target_port)?;

        Ok(ExposedPort {
            name: format!("{service_name}-{port}"),
            service_name: service_name.to_string(),
            protocol,
            port,
            target_port,
            node_port: None,
        })
    }
}

pub fn has_exposed_ports(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(EXPOSED_PORTS_ANNOTATION)
        .is_some_and(|value| !value.trim().is_empty())
}

/// Decodes and validates the exposed ports declared by `service_name`, naming
/// each of them `<service_name>-<port>`.
pub fn parse_exposed_ports(
    service_name: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<Vec<ExposedPort>, ExposedPortError> {
    if !has_exposed_ports(annotations) {
        return Ok(Vec::new());
    }

    let encoded = annotations
        .get(EXPOSED_PORTS_ANNOTATION)
        .map_or("[]", String::as_str);
    let raw: Vec<RawExposedPort> =
        serde_json::from_str(encoded).map_err(|source| ExposedPortError::Decode { source })?;

    let mut ports: Vec<ExposedPort> = Vec::with_capacity(raw.len());
    for port in raw {
        let port = port.validate(service_name)?;
        match ports.iter().find(|declared| declared.name == port.name) {
            None => ports.push(port),
            Some(declared) if *declared == port => {}
            Some(_) => return Err(ExposedPortError::DuplicateName { name: port.name }),
        }
    }
    Ok(ports)
}

/// A set of exposed ports kept in canonical order (ascending by name).
#[derive(Debug, Clone, Default, Eq)]
pub struct ExposedPorts(Vec<ExposedPort>);

impl ExposedPorts {
    pub fn with_defaults() -> Self {
        Self(vec![
            ExposedPort::builder()
                .name("default-http")
                .service_name(DEFAULT_SERVICE_NAME)
                .port(80)
                .target_port(80)
                .build(),
            ExposedPort::builder()
                .name("default-https")
                .service_name(DEFAULT_SERVICE_NAME)
                .port(443)
                .target_port(443)
                .build(),
        ])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExposedPort> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExposedPort> {
        self.0.iter_mut()
    }

    /// Sorts by name and drops entries whose identity was already seen.
    pub fn canonicalize(&mut self) {
        self.0.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.cmp(b)));
        let mut seen = BTreeSet::new();
        self.0.retain(|port| seen.insert(port.identity()));
    }

    pub fn identities(&self) -> BTreeSet<PortIdentity> {
        self.0.iter().map(ExposedPort::identity).collect()
    }

    pub fn to_service_ports(&self) -> Vec<ServicePort> {
        self.0.iter().map(ExposedPort::to_service_port).collect()
    }
}

impl Extend<ExposedPort> for ExposedPorts {
    fn extend<I: IntoIterator<Item = ExposedPort>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl FromIterator<ExposedPort> for ExposedPorts {
    fn from_iter<I: IntoIterator<Item = ExposedPort>>(iter: I) -> Self {
        let mut ports = Self(iter.into_iter().collect());
        ports.canonicalize();
        ports
    }
}

impl IntoIterator for ExposedPorts {
    type Item = ExposedPort;
    type IntoIter = std::vec::IntoIter<ExposedPort>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl PartialEq for ExposedPorts {
    fn eq(&self, other: &Self) -> bool {
        let mut left: Vec<_> = self.0.iter().collect();
        let mut right: Vec<_> = other.0.iter().collect();
        left.sort();
        right.sort();
        left == right
    }
}
