//! Ordered installation of platform dependencies.
//!
//! Steps run strictly in sequence and each one is gated on its wait
//! condition before the next starts:
//!
//! ```text
//! apply ─▶ [patch ─▶ restart] ─▶ wait ─▶ next step
//! ```
//!
//! Nothing is retried and nothing is rolled back. Every apply is
//! idempotent, so re-running the whole bootstrap is the recovery path.

mod merge;

pub use merge::{merge_json, strip_server_fields};

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::console;
use crate::kube::{Kubectl, WaitFor};
use crate::process::CommandRunner;
use crate::retry::Sleeper;

/// Where a step's manifests come from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ApplyTarget {
    /// `kubectl apply -f`, path or URL.
    Manifest { source: String },
    /// `kubectl apply --server-side -f`.
    ServerSide { source: String },
    /// `kubectl apply -k`.
    Kustomize { dir: PathBuf },
}

impl fmt::Display for ApplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyTarget::Manifest { source } => f.write_str(source),
            ApplyTarget::ServerSide { source } => write!(f, "{source} (server-side)"),
            ApplyTarget::Kustomize { dir } => write!(f, "{} (kustomize)", dir.display()),
        }
    }
}

/// Merge applied to a live resource after its step was applied.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    /// `kind/name` as kubectl accepts it.
    pub resource: String,
    pub namespace: String,
    pub merge: Value,
    /// Workload restarted after the patch, e.g. `deployment/identity`.
    #[serde(default)]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallStep {
    pub name: String,
    pub apply: ApplyTarget,
    pub patch: Option<ConfigPatch>,
    pub wait: WaitFor,
}

pub struct DependencyInstaller<'a> {
    kubectl: Kubectl<'a>,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(runner: &'a dyn CommandRunner, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            kubectl: Kubectl::new(runner, sleeper),
        }
    }

    /// Install `steps` in order. Stops at the first failure; returns the
    /// number of steps completed.
    pub fn install_all(&self, steps: &[InstallStep]) -> Result<usize> {
        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            console::progress(i + 1, total, format!("Installing {}", step.name));
            self.install(step)
                .with_context(|| format!("installing dependency '{}'", step.name))?;
            info!(step = %step.name, "dependency ready");
        }
        Ok(total)
    }

    pub fn install(&self, step: &InstallStep) -> Result<()> {
        match &step.apply {
            ApplyTarget::Manifest { source } => self.kubectl.apply(source)?,
            ApplyTarget::ServerSide { source } => self.kubectl.apply_server_side(source)?,
            ApplyTarget::Kustomize { dir } => self.kubectl.apply_kustomize(dir)?,
        };

        if let Some(patch) = &step.patch {
            // The patched resource may be created asynchronously by the
            // step's own controllers.
            self.kubectl.wait(&step.wait)?;
            self.apply_patch(patch, &step.wait)?;
        }

        self.kubectl.wait(&step.wait)
    }

    /// Read back the live resource, merge `patch` into it and apply the
    /// result; restart the owning workload when asked to.
    pub fn apply_patch(&self, patch: &ConfigPatch, gate: &WaitFor) -> Result<()> {
        let mut live = self.kubectl.get_json(&patch.resource, &patch.namespace)?;
        merge_json(&mut live, &patch.merge);
        strip_server_fields(&mut live);
        let document = serde_json::to_vec(&live)
            .with_context(|| format!("serializing patched {}", patch.resource))?;
        self.kubectl
            .apply_document(document, &format!("patched {}", patch.resource))?;

        if let Some(workload) = &patch.restart {
            console::info(format!("Restarting {workload} to pick up configuration"));
            self.kubectl.rollout_restart(workload, &patch.namespace)?;
            self.kubectl
                .rollout_status(workload, &patch.namespace, gate.timeout)?;
        }
        Ok(())
    }
}
