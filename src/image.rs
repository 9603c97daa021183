//! Content-addressed image references.

use std::fmt;

use anyhow::{Context, Result};

use crate::config::EnvironmentConfig;
use crate::content_hash::fingerprint_dir;
use crate::pipeline::ComponentSpec;

/// `<registry>/<product>:<component>-<suffix>-<fingerprint>`
///
/// A pure value: equal fields always render the same reference, and the
/// rendered reference doubles as the image cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageTag {
    pub registry_host: String,
    pub product: String,
    pub component: String,
    pub tag_suffix: String,
    pub content_hash: String,
}

impl ImageTag {
    /// The part after the colon.
    pub fn tag(&self) -> String {
        format!("{}-{}-{}", self.component, self.tag_suffix, self.content_hash)
    }

    /// Repository without the tag.
    pub fn repository(&self) -> String {
        let registry = self.registry_host.trim_end_matches('/');
        if registry.is_empty() {
            self.product.clone()
        } else {
            format!("{}/{}", registry, self.product)
        }
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag())
    }
}

/// Derive the tag for `component` from its source tree.
///
/// Reads the component's files to fingerprint them; touches no engine,
/// cluster or network.
pub fn tag_component(
    component: &ComponentSpec,
    product: &str,
    env: &EnvironmentConfig,
) -> Result<ImageTag> {
    let content_hash = fingerprint_dir(&component.source_dir, &component.excluded)
        .with_context(|| format!("fingerprinting sources of component '{}'", component.name))?;
    Ok(ImageTag {
        registry_host: env.registry_host.clone(),
        product: product.to_string(),
        component: component.name.clone(),
        tag_suffix: env.tag_suffix.clone(),
        content_hash,
    })
}
