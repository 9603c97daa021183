//! kubectl invocations and readiness gates.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::BootstrapError;
use crate::process::{Cmd, CommandOutput, CommandRunner};
use crate::retry::Sleeper;

/// Interval between polls of a condition `kubectl wait` cannot express.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What a readiness gate blocks on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum WaitCondition {
    /// Every pod matching `selector` reports `Ready`.
    PodsReady { selector: String },
    /// `deployment/<name>` reports `Available`.
    DeploymentAvailable { name: String },
    /// The namespace itself exists.
    NamespaceExists,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::PodsReady { selector } => write!(f, "pods {selector}"),
            WaitCondition::DeploymentAvailable { name } => write!(f, "deployment/{name}"),
            WaitCondition::NamespaceExists => f.write_str("namespace"),
        }
    }
}

/// A readiness gate: condition, namespace and time budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitFor {
    pub condition: WaitCondition,
    pub namespace: String,
    pub timeout: Duration,
}

impl WaitFor {
    pub fn pods_ready(selector: impl Into<String>, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            condition: WaitCondition::PodsReady {
                selector: selector.into(),
            },
            namespace: namespace.into(),
            timeout,
        }
    }

    fn timed_out(&self, detail: impl Into<String>) -> anyhow::Error {
        BootstrapError::ReadinessTimeout {
            what: self.condition.to_string(),
            namespace: self.namespace.clone(),
            timeout: self.timeout,
            detail: detail.into(),
        }
        .into()
    }
}

pub struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Kubectl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, sleeper: &'a dyn Sleeper) -> Self {
        Self { runner, sleeper }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new("kubectl")
    }

    /// `kubectl apply -f <source>`; `source` is a path or URL.
    pub fn apply(&self, source: &str) -> Result<CommandOutput> {
        self.cmd()
            .args(["apply", "-f", source])
            .error_msg(format!("applying {source}"))
            .run(self.runner)
    }

    /// Server-side apply, needed for CRD bundles too large for the
    /// last-applied annotation.
    pub fn apply_server_side(&self, source: &str) -> Result<CommandOutput> {
        self.cmd()
            .args(["apply", "--server-side", "-f", source])
            .error_msg(format!("applying {source} server-side"))
            .run(self.runner)
    }

    pub fn apply_kustomize(&self, dir: &Path) -> Result<CommandOutput> {
        self.cmd()
            .args(["apply", "-k"])
            .path_arg(dir)
            .error_msg(format!("applying kustomization {}", dir.display()))
            .run(self.runner)
    }

    /// Apply a document fed through stdin.
    pub fn apply_document(&self, document: impl Into<Vec<u8>>, what: &str) -> Result<CommandOutput> {
        self.cmd()
            .args(["apply", "-f", "-"])
            .stdin(document)
            .error_msg(format!("applying {what}"))
            .run(self.runner)
    }

    /// Live object as JSON.
    pub fn get_json(&self, resource: &str, namespace: &str) -> Result<Value> {
        let output = self
            .cmd()
            .args(["get", resource, "-n", namespace, "-o", "json"])
            .error_msg(format!("reading {resource} in {namespace}"))
            .run(self.runner)?;
        serde_json::from_str(&output.stdout)
            .with_context(|| format!("parsing {resource} in {namespace} as JSON"))
    }

    pub fn set_image(&self, deployment: &str, namespace: &str, image: &str) -> Result<()> {
        self.cmd()
            .args(["set", "image"])
            .arg(format!("deployment/{deployment}"))
            .arg(format!("*={image}"))
            .args(["-n", namespace])
            .error_msg(format!("updating image of deployment/{deployment}"))
            .run(self.runner)?;
        Ok(())
    }

    pub fn rollout_restart(&self, workload: &str, namespace: &str) -> Result<()> {
        self.cmd()
            .args(["rollout", "restart", workload, "-n", namespace])
            .error_msg(format!("restarting {workload}"))
            .run(self.runner)?;
        Ok(())
    }

    /// Block until `workload` finished rolling out, mapping failure to a
    /// readiness timeout.
    pub fn rollout_status(&self, workload: &str, namespace: &str, timeout: Duration) -> Result<()> {
        let output = self
            .cmd()
            .args(["rollout", "status", workload, "-n", namespace])
            .arg(timeout_flag(timeout))
            .output(self.runner)?;
        if !output.success() {
            return Err(BootstrapError::ReadinessTimeout {
                what: format!("rollout of {workload}"),
                namespace: namespace.to_string(),
                timeout,
                detail: output.combined().trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Block on `gate`. Any failure, including a wait that simply ran out
    /// of time, is a [`BootstrapError::ReadinessTimeout`].
    pub fn wait(&self, gate: &WaitFor) -> Result<()> {
        debug!(condition = %gate.condition, namespace = %gate.namespace, timeout = ?gate.timeout, "waiting");
        match &gate.condition {
            WaitCondition::PodsReady { selector } => {
                // `kubectl wait` errors out immediately when nothing matches
                // yet, so first wait for the pods to be scheduled at all.
                let spent = self.poll(gate, |k| {
                    let out = k
                        .cmd()
                        .args(["get", "pods", "-l", selector.as_str()])
                        .args(["-n", gate.namespace.as_str(), "-o", "name"])
                        .output(k.runner)?;
                    Ok(out.success() && !out.stdout.trim().is_empty())
                })?;
                let remaining = gate.timeout.saturating_sub(spent);
                self.kubectl_wait(gate, &["--for=condition=Ready", "pod", "-l", selector.as_str()], remaining)
            }
            WaitCondition::DeploymentAvailable { name } => {
                let target = format!("deployment/{name}");
                self.kubectl_wait(gate, &["--for=condition=Available", target.as_str()], gate.timeout)
            }
            WaitCondition::NamespaceExists => {
                self.poll(gate, |k| {
                    let out = k
                        .cmd()
                        .args(["get", "namespace", gate.namespace.as_str()])
                        .output(k.runner)?;
                    Ok(out.success())
                })?;
                Ok(())
            }
        }
    }

    /// Evaluate `probe` every [`POLL_INTERVAL`] until it holds or the
    /// gate's budget is used up. Returns the time spent sleeping.
    fn poll(&self, gate: &WaitFor, mut probe: impl FnMut(&Self) -> Result<bool>) -> Result<Duration> {
        let attempts = (gate.timeout.as_secs() / POLL_INTERVAL.as_secs()).max(1);
        let mut spent = Duration::ZERO;
        for attempt in 1..=attempts {
            if probe(self)? {
                return Ok(spent);
            }
            if attempt < attempts {
                self.sleeper.sleep(POLL_INTERVAL);
                spent += POLL_INTERVAL;
            }
        }
        Err(gate.timed_out("condition never became true"))
    }

    fn kubectl_wait(&self, gate: &WaitFor, target: &[&str], budget: Duration) -> Result<()> {
        let output = self
            .cmd()
            .arg("wait")
            .args(target)
            .args(["-n", gate.namespace.as_str()])
            .arg(timeout_flag(budget))
            .output(self.runner)?;
        if !output.success() {
            return Err(gate.timed_out(output.combined().trim()));
        }
        Ok(())
    }
}

fn timeout_flag(timeout: Duration) -> String {
    format!("--timeout={}s", timeout.as_secs().max(1))
}
