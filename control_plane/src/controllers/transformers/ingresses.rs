use ces_discovery_api::constants::{
    CONFIGURATION_SNIPPET_ANNOTATION, IDENTITY_ENCODING_DIRECTIVE, INGRESS_CLASS_NAME,
    MAINTENANCE_PAGE_PATH, MANAGED_BY_LABEL, MANAGED_BY_VALUE, REWRITE_TARGET_ANNOTATION,
    STARTING_PAGE_PATH, STATIC_CONTENT_SERVICE_NAME, STATIC_CONTENT_SERVICE_PORT,
};
use ces_discovery_api::descriptors::ServiceDescriptor;
use getset::{CopyGetters, Getters};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use strum::IntoStaticStr;

const PATH_TYPE_PREFIX: &str = "Prefix";

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum IngressMode {
    Maintenance,
    Starting,
    Ready,
}

impl IngressMode {
    /// `maintenance` already excludes the static content service. `readiness`
    /// is `None` for services that do not belong to a dogu.
    pub fn select(maintenance: bool, readiness: Option<bool>) -> Self {
        match (maintenance, readiness) {
            (true, _) => Self::Maintenance,
            (false, Some(false)) => Self::Starting,
            (false, _) => Self::Ready,
        }
    }
}

pub fn is_maintenance_exempt(service: &Service) -> bool {
    service.name_any() == STATIC_CONTENT_SERVICE_NAME
}

#[derive(Getters, CopyGetters, Debug, Clone, PartialEq, Eq)]
pub struct IngressTarget {
    #[getset(get = "pub")]
    service_name: String,
    #[getset(get_copy = "pub")]
    port: i32,
}

/// The state an ingress must converge to for one descriptor in one mode.
#[derive(Getters, CopyGetters, Debug, Clone, PartialEq, Eq)]
pub struct DesiredIngress {
    #[getset(get = "pub")]
    name: String,
    #[getset(get_copy = "pub")]
    mode: IngressMode,
    #[getset(get = "pub")]
    location: String,
    #[getset(get = "pub")]
    target: IngressTarget,
    #[getset(get = "pub")]
    annotations: BTreeMap<String, String>,
}

impl DesiredIngress {
    pub fn new(
        descriptor: &ServiceDescriptor,
        service_name: &str,
        mode: IngressMode,
        additional_annotations: &BTreeMap<String, String>,
    ) -> Self {
        let static_content = |page: &str| {
            (
                IngressTarget {
                    service_name: STATIC_CONTENT_SERVICE_NAME.to_string(),
                    port: STATIC_CONTENT_SERVICE_PORT,
                },
                BTreeMap::from([(REWRITE_TARGET_ANNOTATION.to_string(), page.to_string())]),
            )
        };

        let (target, annotations) = match mode {
            IngressMode::Maintenance => static_content(MAINTENANCE_PAGE_PATH),
            IngressMode::Starting => static_content(STARTING_PAGE_PATH),
            IngressMode::Ready => (
                IngressTarget {
                    service_name: service_name.to_string(),
                    port: i32::from(descriptor.port()),
                },
                ready_annotations(descriptor, additional_annotations),
            ),
        };

        Self {
            name: descriptor.name().clone(),
            mode,
            location: descriptor.location().clone(),
            target,
            annotations,
        }
    }

    fn spec(&self) -> IngressSpec {
        IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS_NAME.to_string()),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(self.location.clone()),
                        path_type: PATH_TYPE_PREFIX.to_string(),
                        backend: IngressBackend {
                            resource: None,
                            service: Some(IngressServiceBackend {
                                name: self.target.service_name.clone(),
                                port: Some(ServiceBackendPort {
                                    name: None,
                                    number: Some(self.target.port),
                                }),
                            }),
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }
    }

    pub fn to_ingress(&self, namespace: &str, owner: &OwnerReference) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                annotations: Some(self.annotations.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: Some(self.spec()),
            status: None,
        }
    }

    /// Overwrites annotations, spec and owner of `existing`, keeping everything
    /// else including the resource version. Returns `None` when `existing`
    /// already matches.
    pub fn apply_to(&self, existing: &Ingress, owner: &OwnerReference) -> Option<Ingress> {
        let spec = self.spec();
        let owners = existing.owner_references();
        let owned = owners.len() == 1 && owners[0] == *owner;

        if owned
            && existing.metadata.annotations.as_ref() == Some(&self.annotations)
            && existing.spec.as_ref() == Some(&spec)
        {
            return None;
        }

        let mut updated = existing.clone();
        updated.metadata.annotations = Some(self.annotations.clone());
        updated.metadata.owner_references = Some(vec![owner.clone()]);
        updated
            .labels_mut()
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        updated.spec = Some(spec);
        Some(updated)
    }
}

fn ready_annotations(
    descriptor: &ServiceDescriptor,
    additional_annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    let snippet = match descriptor.rewrite() {
        Some(rule) => format!("{IDENTITY_ENCODING_DIRECTIVE}\n{}", rule.directive()),
        None => IDENTITY_ENCODING_DIRECTIVE.to_string(),
    };
    annotations.insert(CONFIGURATION_SNIPPET_ANNOTATION.to_string(), snippet);

    if descriptor.needs_rewrite_target() {
        annotations.insert(
            REWRITE_TARGET_ANNOTATION.to_string(),
            descriptor.pass().clone(),
        );
    }

    annotations.extend(
        additional_annotations
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use ces_discovery_api::descriptors::RewriteRule;
    use rstest::rstest;

    fn nexus() -> ServiceDescriptor {
        ServiceDescriptor::builder()
            .name("nexus")
            .port(8080)
            .location("/nexus")
            .pass("/nexus")
            .build()
    }

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: "nexus".to_string(),
            uid: "uid-nexus".to_string(),
            controller: Some(true),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(true, None, IngressMode::Maintenance)]
    #[case(true, Some(false), IngressMode::Maintenance)]
    #[case(true, Some(true), IngressMode::Maintenance)]
    #[case(false, Some(false), IngressMode::Starting)]
    #[case(false, Some(true), IngressMode::Ready)]
    #[case(false, None, IngressMode::Ready)]
    fn test_mode_precedence(
        #[case] maintenance: bool,
        #[case] readiness: Option<bool>,
        #[case] expected: IngressMode,
    ) {
        assert_eq!(IngressMode::select(maintenance, readiness), expected);
    }

    #[rstest]
    #[case(IngressMode::Maintenance, MAINTENANCE_PAGE_PATH)]
    #[case(IngressMode::Starting, STARTING_PAGE_PATH)]
    fn test_static_content_modes(#[case] mode: IngressMode, #[case] page: &str) {
        let additional = BTreeMap::from([("a".to_string(), "b".to_string())]);
        let desired = DesiredIngress::new(&nexus(), "nexus", mode, &additional);

        assert_eq!(desired.target().service_name(), STATIC_CONTENT_SERVICE_NAME);
        assert_eq!(desired.target().port(), STATIC_CONTENT_SERVICE_PORT);
        assert_eq!(
            desired.annotations(),
            &BTreeMap::from([(REWRITE_TARGET_ANNOTATION.to_string(), page.to_string())])
        );
    }

    #[test]
    fn test_ready_mode_without_rewrite() {
        let desired = DesiredIngress::new(&nexus(), "nexus", IngressMode::Ready, &BTreeMap::new());

        assert_eq!(desired.target().service_name(), "nexus");
        assert_eq!(desired.target().port(), 8080);
        assert_eq!(
            desired.annotations(),
            &BTreeMap::from([(
                CONFIGURATION_SNIPPET_ANNOTATION.to_string(),
                IDENTITY_ENCODING_DIRECTIVE.to_string()
            )])
        );
    }

    #[test]
    fn test_ready_mode_with_rewrites_and_overlay() {
        let descriptor = ServiceDescriptor::builder()
            .name("portainer")
            .port(9000)
            .location("/portainer")
            .pass("/")
            .rewrite(
                RewriteRule::builder()
                    .pattern("portainer")
                    .rewrite("")
                    .build(),
            )
            .build();
        let additional = BTreeMap::from([
            (
                "nginx.ingress.kubernetes.io/proxy-body-size".to_string(),
                "0".to_string(),
            ),
            (REWRITE_TARGET_ANNOTATION.to_string(), "/custom".to_string()),
        ]);

        let desired =
            DesiredIngress::new(&descriptor, "portainer", IngressMode::Ready, &additional);
        let annotations = desired.annotations();

        assert_eq!(
            annotations.get(CONFIGURATION_SNIPPET_ANNOTATION).map(String::as_str),
            Some("proxy_set_header Accept-Encoding \"identity\";\nrewrite ^/portainer(/|$)(.*) //$2 break;")
        );
        assert_eq!(
            annotations.get(REWRITE_TARGET_ANNOTATION).map(String::as_str),
            Some("/custom")
        );
        assert_eq!(
            annotations
                .get("nginx.ingress.kubernetes.io/proxy-body-size")
                .map(String::as_str),
            Some("0")
        );
    }

    #[test]
    fn test_ingress_shape() {
        let desired = DesiredIngress::new(&nexus(), "nexus", IngressMode::Ready, &BTreeMap::new());
        let ingress = desired.to_ingress("ecosystem", &owner());

        assert_eq!(ingress.metadata.name.as_deref(), Some("nexus"));
        assert_eq!(ingress.owner_references(), &[owner()]);
        let spec = ingress.spec.unwrap_or_default();
        assert_eq!(spec.ingress_class_name.as_deref(), Some(INGRESS_CLASS_NAME));
        let rules = spec.rules.unwrap_or_default();
        assert_eq!(rules.len(), 1);
        let paths = rules[0].http.clone().map(|http| http.paths).unwrap_or_default();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path.as_deref(), Some("/nexus"));
        assert_eq!(paths[0].path_type, "Prefix");
        let backend = paths[0].backend.service.clone().unwrap_or_default();
        assert_eq!(backend.name, "nexus");
        assert_eq!(backend.port.and_then(|port| port.number), Some(8080));
    }

    #[test]
    fn test_apply_to_matching_ingress_is_a_no_op() {
        let desired = DesiredIngress::new(&nexus(), "nexus", IngressMode::Ready, &BTreeMap::new());
        let existing = desired.to_ingress("ecosystem", &owner());
        assert_eq!(desired.apply_to(&existing, &owner()), None);

        let starting =
            DesiredIngress::new(&nexus(), "nexus", IngressMode::Starting, &BTreeMap::new());
        let updated = starting.apply_to(&existing, &owner());
        assert_eq!(
            updated.and_then(|ingress| ingress.metadata.annotations),
            Some(starting.annotations().clone())
        );
    }
}
