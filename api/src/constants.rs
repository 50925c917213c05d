pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "ces-discovery-control-plane";

pub const DOGU_NAME_LABEL: &str = "dogu.name";

pub const SERVICE_DESCRIPTORS_ANNOTATION: &str = "k8s-dogu-operator.cloudogu.com/ces-services";
pub const EXPOSED_PORTS_ANNOTATION: &str = "k8s-dogu-operator.cloudogu.com/ces-exposed-ports";
pub const ADDITIONAL_INGRESS_ANNOTATIONS_ANNOTATION: &str =
    "k8s-dogu-operator.cloudogu.com/additional-ingress-annotations";

pub const CONFIGURATION_SNIPPET_ANNOTATION: &str =
    "nginx.ingress.kubernetes.io/configuration-snippet";
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";
pub const IDENTITY_ENCODING_DIRECTIVE: &str = "proxy_set_header Accept-Encoding \"identity\";";

pub const INGRESS_CLASS_NAME: &str = "k8s-ecosystem-ces-service";

pub const STATIC_CONTENT_SERVICE_NAME: &str = "nginx-static";
pub const STATIC_CONTENT_SERVICE_PORT: i32 = 80;
pub const MAINTENANCE_PAGE_PATH: &str = "/errors/503.html";
pub const STARTING_PAGE_PATH: &str = "/errors/starting.html";

pub const GLOBAL_CONFIG_NAME: &str = "global-config";
pub const MAINTENANCE_KEY: &str = "maintenance";

pub const LOAD_BALANCER_NAME: &str = "ces-loadbalancer";
pub const LOAD_BALANCER_CONFIG_NAME: &str = "ces-loadbalancer-config";
pub const LOAD_BALANCER_CONFIG_KEY: &str = "config.yaml";
pub const LOAD_BALANCER_MANAGED_ANNOTATIONS_ANNOTATION: &str =
    "k8s.cloudogu.com/ces-loadbalancer-annotations";
pub const LOAD_BALANCER_SELECTOR_VALUE: &str = "nginx-ingress";
