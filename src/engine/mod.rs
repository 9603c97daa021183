//! Container engine adapters.
//!
//! Two engines are supported behind one [`ContainerEngine`] interface:
//!
//! ```text
//!               ContainerEngine
//!                 │
//!     ┌───────────┴───────────┐
//!  Podman (A)              Docker (B)
//!  save → archive →        kind load docker-image
//!  kind load image-archive
//! ```
//!
//! The engine is chosen once per run by [`select_engine`]; every call site
//! after that is engine-agnostic.

mod docker;
mod podman;

pub use docker::Docker;
pub use podman::Podman;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::credentials::Credentials;
use crate::error::BootstrapError;
use crate::image::ImageTag;
use crate::process::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Podman,
    Docker,
}

/// Probe order when no engine is requested explicitly.
pub const PROBE_ORDER: [EngineKind; 2] = [EngineKind::Podman, EngineKind::Docker];

impl EngineKind {
    pub fn binary(self) -> &'static str {
        match self {
            EngineKind::Podman => "podman",
            EngineKind::Docker => "docker",
        }
    }

    /// Environment the cluster provider needs to run nodes on this engine.
    pub fn provider_env(self) -> Option<(&'static str, &'static str)> {
        match self {
            EngineKind::Podman => Some(("KIND_EXPERIMENTAL_PROVIDER", "podman")),
            EngineKind::Docker => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podman" => Ok(EngineKind::Podman),
            "docker" => Ok(EngineKind::Docker),
            other => Err(BootstrapError::UnknownEngine(other.to_string()).into()),
        }
    }
}

/// Pick the engine: an explicit request wins, otherwise the first engine in
/// [`PROBE_ORDER`] whose binary `is_available`.
pub fn select_engine(
    requested: Option<EngineKind>,
    is_available: impl Fn(&str) -> bool,
) -> Result<EngineKind> {
    if let Some(kind) = requested {
        return Ok(kind);
    }
    PROBE_ORDER
        .into_iter()
        .find(|kind| is_available(kind.binary()))
        .ok_or_else(|| {
            BootstrapError::NoContainerEngineFound {
                searched: PROBE_ORDER.iter().map(|k| k.binary()).collect(),
            }
            .into()
        })
}

/// Instantiate the adapter for `kind`.
pub fn adapter_for<'a>(kind: EngineKind, runner: &'a dyn CommandRunner) -> Box<dyn ContainerEngine + 'a> {
    match kind {
        EngineKind::Podman => Box::new(Podman::new(runner)),
        EngineKind::Docker => Box::new(Docker::new(runner)),
    }
}

/// What to build an image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub dir: PathBuf,
    /// Defaults to `<dir>/Dockerfile` when `None`.
    pub dockerfile: Option<PathBuf>,
}

impl BuildContext {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dockerfile: None,
        }
    }
}

/// Host resources the engine can hand to cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub cpus: u64,
    pub memory_bytes: u64,
}

pub trait ContainerEngine {
    fn kind(&self) -> EngineKind;

    /// Whether `tag` is present in the local image store.
    ///
    /// "Not found" is `Ok(false)`; only failing to talk to the engine is an
    /// error.
    fn image_exists_locally(&self, tag: &ImageTag) -> Result<bool>;

    /// Build `tag` from `context`. `no_cache` ignores layer caches.
    fn build_image(&self, tag: &ImageTag, context: &BuildContext, no_cache: bool) -> Result<()>;

    /// Log in to `registry`. Empty username and password is anonymous
    /// access and succeeds without invoking the engine.
    fn login(&self, registry: &str, credentials: &Credentials) -> Result<()>;

    /// Make `tag` available on the nodes of kind cluster `cluster_name`
    /// without a registry round-trip.
    fn transfer_image_to_cluster(&self, tag: &ImageTag, cluster_name: &str) -> Result<()>;

    /// CPU and memory visible to the engine.
    fn resource_info(&self) -> Result<ResourceInfo>;
}

/// Shared `build` invocation; both engines accept the same flags.
pub(crate) fn build_command(
    binary: &str,
    tag: &ImageTag,
    context: &BuildContext,
    no_cache: bool,
) -> crate::process::Cmd {
    let mut cmd = crate::process::Cmd::new(binary)
        .args(["build", "-t"])
        .arg(tag.to_string());
    if let Some(dockerfile) = &context.dockerfile {
        cmd = cmd.arg("-f").path_arg(dockerfile);
    }
    if no_cache {
        cmd = cmd.arg("--no-cache");
    }
    cmd.path_arg(&context.dir)
}

/// Shared `login` invocation; the password travels over stdin only.
pub(crate) fn login_with(
    runner: &dyn CommandRunner,
    binary: &str,
    registry: &str,
    credentials: &Credentials,
) -> Result<()> {
    if credentials.is_anonymous() {
        return Ok(());
    }
    let output = crate::process::Cmd::new(binary)
        .args(["login", registry, "--username"])
        .arg(&credentials.username)
        .arg("--password-stdin")
        .stdin(credentials.password.as_bytes())
        .output(runner)?;
    if !output.success() {
        return Err(BootstrapError::LoginFailed {
            registry: registry.to_string(),
            detail: output.combined().trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Read a numeric field at `path` from engine `info` JSON.
pub(crate) fn json_u64(doc: &Value, path: &[&str]) -> Option<u64> {
    let mut cursor = doc;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor
        .as_u64()
        .or_else(|| cursor.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn parse_info(binary: &str, stdout: &str) -> Result<Value> {
    match serde_json::from_str(stdout.trim()) {
        Ok(doc) => Ok(doc),
        Err(err) => bail!("parsing `{binary} info` output as JSON: {err}"),
    }
}
