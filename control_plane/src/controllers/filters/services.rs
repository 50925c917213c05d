use super::ObjectChange;
use ces_discovery_api::ports::{ExposedPorts, has_exposed_ports, parse_exposed_ports};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::debug;

fn declares_exposed_ports(service: &Service) -> bool {
    has_exposed_ports(service.annotations())
}

fn decoded_ports(service: &Service) -> Option<ExposedPorts> {
    parse_exposed_ports(&service.name_any(), service.annotations())
        .inspect_err(|err| {
            debug!(
                "Ignoring change of service {} with invalid exposed ports: {}",
                service.name_any(),
                err
            );
        })
        .ok()
        .map(|ports| ports.into_iter().collect())
}

/// Whether a service change can alter the aggregated exposed ports. Undecodable
/// declarations are never relevant.
pub fn exposed_ports_relevant(change: &ObjectChange<Service>) -> bool {
    match change {
        ObjectChange::Created(service)
        | ObjectChange::Deleted(service)
        | ObjectChange::Generic(service) => declares_exposed_ports(service),
        ObjectChange::Updated { old, new } => {
            match (declares_exposed_ports(old), declares_exposed_ports(new)) {
                (false, false) => false,
                (true, false) | (false, true) => true,
                (true, true) => match (decoded_ports(old), decoded_ports(new)) {
                    (Some(old), Some(new)) => old.identities() != new.identities(),
                    _ => false,
                },
            }
        }
    }
}
