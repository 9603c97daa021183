//! Error taxonomy for a bootstrap run.
//!
//! Library functions return `anyhow::Result` and raise these variants with
//! `bail!`/`.into()`. Callers that need to react to a specific category
//! (exit hints, tests) recover them with `downcast_ref::<BootstrapError>()`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A host tool that preflight could not find, with the package providing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTool {
    pub command: String,
    pub package: String,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing required host tools:\n{}", format_missing(.tools))]
    MissingPrerequisite { tools: Vec<MissingTool> },

    #[error("container engine resources below recommended minimum: {detail}")]
    InsufficientResourceLimits { detail: String },

    #[error("cluster {action} failed: {detail}")]
    ClusterOperation { action: &'static str, detail: String },

    #[error(
        "no cached credentials for registry '{registry}' and interactive login is disabled (--force)"
    )]
    CredentialsUnavailable { registry: String },

    #[error("login to registry '{registry}' failed: {detail}")]
    LoginFailed { registry: String, detail: String },

    #[error("no container engine found on PATH (looked for: {})", .searched.join(", "))]
    NoContainerEngineFound { searched: Vec<&'static str> },

    #[error("unknown container engine '{0}' (expected 'podman' or 'docker')")]
    UnknownEngine(String),

    #[error("directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("image build failed for '{image}': {detail}")]
    Build { image: String, detail: String },

    #[error(
        "timed out after {}s waiting for {what} in namespace '{namespace}': {detail}",
        .timeout.as_secs()
    )]
    ReadinessTimeout {
        what: String,
        namespace: String,
        timeout: Duration,
        detail: String,
    },

    #[error("`{command}` exited with code {code}: {output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("cannot ask \"{0}\" without an interactive terminal")]
    NonInteractive(String),

    #[error("aborted: {0}")]
    Aborted(String),
}

impl BootstrapError {
    /// Operator-facing remediation hint for the category, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BootstrapError::MissingPrerequisite { .. } => {
                Some("install the listed tools and re-run; no cluster state was touched")
            }
            BootstrapError::NoContainerEngineFound { .. } | BootstrapError::UnknownEngine(_) => {
                Some("install podman or docker, or set BOOTSTRAP_CONTAINER_ENGINE explicitly")
            }
            BootstrapError::CredentialsUnavailable { .. } => {
                Some("log in once with `<engine> login <registry>` or re-run without --force")
            }
            BootstrapError::ReadinessTimeout { .. } => Some(
                "inspect the workload with `kubectl describe` / `kubectl logs`; every stage is \
                 idempotent, re-run once the cause is fixed",
            ),
            BootstrapError::ClusterOperation { .. }
            | BootstrapError::Build { .. }
            | BootstrapError::CommandFailed { .. } => {
                Some("every stage is idempotent; re-run the bootstrap to resume")
            }
            _ => None,
        }
    }
}

fn format_missing(tools: &[MissingTool]) -> String {
    tools
        .iter()
        .map(|t| format!("  {} (install: {})", t.command, t.package))
        .collect::<Vec<_>>()
        .join("\n")
}
