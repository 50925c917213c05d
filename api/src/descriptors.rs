use crate::constants::{ADDITIONAL_INGRESS_ANNOTATIONS_ANNOTATION, SERVICE_DESCRIPTORS_ANNOTATION};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Failed to decode annotation {annotation}: {source}")]
    Decode {
        annotation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode rewrite rule of service descriptor {name}: {source}")]
    DecodeRewrite {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize, Serialize, TypedBuilder, Getters, Clone, Debug, PartialEq, Eq)]
pub struct RewriteRule {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    pattern: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    rewrite: String,
}

impl RewriteRule {
    /// Renders the rule as an nginx `rewrite` directive for a configuration snippet.
    pub fn directive(&self) -> String {
        format!(
            "rewrite ^/{}(/|$)(.*) /{}/$2 break;",
            self.pattern, self.rewrite
        )
    }
}

/// One routable HTTP path declared by a dogu service.
#[derive(TypedBuilder, Getters, CopyGetters, Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    name: String,

    #[getset(get_copy = "pub")]
    port: u16,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    location: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    pass: String,

    #[getset(get = "pub")]
    #[builder(default, setter(strip_option))]
    rewrite: Option<RewriteRule>,
}

impl ServiceDescriptor {
    pub fn needs_rewrite_target(&self) -> bool {
        self.pass != self.location
    }
}

#[derive(Deserialize)]
struct RawServiceDescriptor {
    name: String,
    port: u16,
    location: String,
    pass: String,
    #[serde(default)]
    rewrite: Option<String>,
}

impl TryFrom<RawServiceDescriptor> for ServiceDescriptor {
    type Error = DescriptorError;

    fn try_from(raw: RawServiceDescriptor) -> Result<Self, Self::Error> {
        let rewrite = match raw.rewrite.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(encoded) => Some(serde_json::from_str::<RewriteRule>(encoded).map_err(
                |source| DescriptorError::DecodeRewrite {
                    name: raw.name.clone(),
                    source,
                },
            )?),
        };

        Ok(Self {
            name: raw.name,
            port: raw.port,
            location: raw.location,
            pass: raw.pass,
            rewrite,
        })
    }
}

/// Returns `Ok(None)` when the annotations declare nothing that needs an ingress.
pub fn parse_service_descriptors(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<Vec<ServiceDescriptor>>, DescriptorError> {
    let Some(encoded) = annotations.get(SERVICE_DESCRIPTORS_ANNOTATION) else {
        return Ok(None);
    };

    let raw: Vec<RawServiceDescriptor> =
        serde_json::from_str(encoded).map_err(|source| DescriptorError::Decode {
            annotation: SERVICE_DESCRIPTORS_ANNOTATION,
            source,
        })?;

    if raw.is_empty() {
        return Ok(None);
    }

    raw.into_iter()
        .map(ServiceDescriptor::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn parse_additional_ingress_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, DescriptorError> {
    match annotations.get(ADDITIONAL_INGRESS_ANNOTATIONS_ANNOTATION) {
        None => Ok(BTreeMap::new()),
        Some(encoded) if encoded.trim().is_empty() => Ok(BTreeMap::new()),
        Some(encoded) => serde_json::from_str(encoded).map_err(|source| DescriptorError::Decode {
            annotation: ADDITIONAL_INGRESS_ANNOTATIONS_ANNOTATION,
            source,
        }),
    }
}
