use ces_discovery_api::ports::{ExposedPortError, ExposedPorts, parse_exposed_ports};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Failed to aggregate exposed ports of service {service}: {source}")]
pub struct AggregationError {
    service: String,
    #[source]
    source: ExposedPortError,
}

impl AggregationError {
    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Merges the exposed ports of all `services` onto the default ports. A single
/// invalid declaration fails the whole aggregation.
pub fn aggregate_from<'a>(
    services: impl IntoIterator<Item = &'a Service>,
) -> Result<ExposedPorts, AggregationError> {
    let mut ports = ExposedPorts::with_defaults();

    for service in services {
        let name = service.name_any();
        let declared = parse_exposed_ports(&name, service.annotations()).map_err(|source| {
            AggregationError {
                service: name.clone(),
                source,
            }
        })?;
        ports.extend(declared);
    }

    ports.canonicalize();
    Ok(ports)
}
