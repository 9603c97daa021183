//! Run configuration.
//!
//! [`EnvironmentConfig`] is built once from the command line and the process
//! environment and then only borrowed; no component reads ambient state on
//! its own.

use anyhow::{bail, Result};

use crate::engine::EngineKind;

/// Registry used when `--registry` is not given.
pub const DEFAULT_REGISTRY: &str = "localhost:5001";

/// Tag suffix used when `--tag-suffix` is not given.
pub const DEFAULT_TAG_SUFFIX: &str = "dev";

/// Selects the container engine explicitly (`podman` or `docker`).
pub const ENGINE_ENV_VAR: &str = "BOOTSTRAP_CONTAINER_ENGINE";

/// Path to a TOML plan replacing the built-in platform plan.
pub const PLAN_ENV_VAR: &str = "BOOTSTRAP_PLAN";

/// Longest accepted tag suffix. Component name and fingerprint share the
/// rest of the 128 characters an image tag may hold.
pub const MAX_TAG_SUFFIX_LEN: usize = 64;

/// Validate a tag suffix against the image tag alphabet.
///
/// The suffix sits between component name and fingerprint, so it must be
/// non-empty and use only ASCII letters, digits, `_`, `.` and `-`.
pub fn parse_tag_suffix(raw: &str) -> Result<String> {
    let suffix = raw.trim();
    if suffix.is_empty() {
        bail!("tag suffix must not be empty");
    }
    if suffix.len() > MAX_TAG_SUFFIX_LEN {
        bail!("tag suffix is longer than {MAX_TAG_SUFFIX_LEN} characters");
    }
    if let Some(bad) = suffix
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        bail!("tag suffix '{suffix}' contains '{bad}'; allowed: letters, digits, '_', '.', '-'");
    }
    Ok(suffix.to_string())
}

/// Validate a registry reference: `host[:port]`, optionally followed by a
/// lowercase repository namespace (`ghcr.io/acme`).
pub fn parse_registry_host(raw: &str) -> Result<String> {
    let registry = raw.trim().trim_end_matches('/');
    if registry.is_empty() {
        bail!("registry must not be empty");
    }
    if registry.contains("://") {
        bail!("registry '{registry}' must not include a scheme");
    }
    let (authority, namespace) = match registry.split_once('/') {
        Some((authority, namespace)) => (authority, Some(namespace)),
        None => (registry, None),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    let label_ok = |label: &str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if !host.split('.').all(label_ok) {
        bail!("registry '{registry}' has an invalid host name '{host}'");
    }
    if let Some(port) = port {
        if port.parse::<u16>().is_err() {
            bail!("registry '{registry}' has an invalid port '{port}'");
        }
    }
    if let Some(namespace) = namespace {
        let path_ok = namespace.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        });
        if !path_ok {
            bail!("registry '{registry}' has an invalid repository namespace '{namespace}'");
        }
    }
    Ok(registry.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub registry_host: String,
    pub tag_suffix: String,
    /// Never prompt: destructive confirmations are implied and questions
    /// without a safe default fail the run.
    pub force: bool,
    pub verbose: bool,
    /// Engine requested via [`ENGINE_ENV_VAR`]; `None` means auto-detect.
    pub requested_engine: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            registry_host: DEFAULT_REGISTRY.to_string(),
            tag_suffix: DEFAULT_TAG_SUFFIX.to_string(),
            force: false,
            verbose: false,
            requested_engine: None,
        }
    }
}

impl EnvironmentConfig {
    /// Parse the requested engine, if any.
    pub fn requested_engine_kind(&self) -> Result<Option<EngineKind>> {
        self.requested_engine
            .as_deref()
            .map(str::parse::<EngineKind>)
            .transpose()
    }
}
