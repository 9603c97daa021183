//! Ephemeral kind cluster lifecycle.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info};

use crate::console;
use crate::engine::EngineKind;
use crate::error::BootstrapError;
use crate::interaction::Interaction;
use crate::process::{Cmd, CommandOutput, CommandRunner};

/// Printed by `kind get clusters` when there is nothing to list.
const NO_CLUSTERS_SENTINEL: &str = "No kind clusters found.";

/// How long `kind create cluster` waits for the control plane.
const CREATE_WAIT: &str = "120s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub node_image: String,
    pub api_server_extra_args: BTreeMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
}

impl ClusterSpec {
    /// API server flags that turn on the service-account token issuer the
    /// identity components depend on.
    pub fn service_account_issuer_args() -> BTreeMap<String, String> {
        [
            ("service-account-issuer", "https://kubernetes.default.svc"),
            (
                "service-account-signing-key-file",
                "/etc/kubernetes/pki/sa.key",
            ),
            ("service-account-key-file", "/etc/kubernetes/pki/sa.pub"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// kubeconfig context kind creates for this cluster.
    pub fn context_name(&self) -> String {
        format!("kind-{}", self.name)
    }

    /// kind `Cluster` config: one control-plane node on `node_image`.
    pub fn render_kind_config(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "kind: Cluster");
        let _ = writeln!(out, "apiVersion: kind.x-k8s.io/v1alpha4");
        let _ = writeln!(out, "name: {}", self.name);
        let _ = writeln!(out, "nodes:");
        let _ = writeln!(out, "  - role: control-plane");
        let _ = writeln!(out, "    image: {}", self.node_image);
        if !self.api_server_extra_args.is_empty() {
            let _ = writeln!(out, "    kubeadmConfigPatches:");
            let _ = writeln!(out, "      - |");
            let _ = writeln!(out, "        kind: ClusterConfiguration");
            let _ = writeln!(out, "        apiServer:");
            let _ = writeln!(out, "          extraArgs:");
            for (key, value) in &self.api_server_extra_args {
                let _ = writeln!(out, "            {key}: \"{value}\"");
            }
        }
        if !self.port_mappings.is_empty() {
            let _ = writeln!(out, "    extraPortMappings:");
            for mapping in &self.port_mappings {
                let _ = writeln!(out, "      - containerPort: {}", mapping.container_port);
                let _ = writeln!(out, "        hostPort: {}", mapping.host_port);
                let _ = writeln!(out, "        protocol: TCP");
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOutcome {
    Created,
    /// A same-named cluster survived (deletion declined) and is used as is.
    Reused,
}

pub struct ClusterLifecycleManager<'a> {
    runner: &'a dyn CommandRunner,
    interaction: &'a dyn Interaction,
    provider: EngineKind,
    force: bool,
}

impl<'a> ClusterLifecycleManager<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        interaction: &'a dyn Interaction,
        provider: EngineKind,
        force: bool,
    ) -> Self {
        Self {
            runner,
            interaction,
            provider,
            force,
        }
    }

    fn kind(&self) -> Cmd {
        let cmd = Cmd::new("kind");
        match self.provider.provider_env() {
            Some((key, value)) => cmd.env(key, value),
            None => cmd,
        }
    }

    fn checked(&self, cmd: Cmd, action: &'static str) -> Result<CommandOutput> {
        let output = cmd.output(self.runner)?;
        if !output.success() {
            return Err(BootstrapError::ClusterOperation {
                action,
                detail: output.combined().trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    /// Names of every cluster under this provider.
    pub fn list_clusters(&self) -> Result<Vec<String>> {
        let output = self.checked(self.kind().args(["get", "clusters"]), "list")?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != NO_CLUSTERS_SENTINEL)
            .map(str::to_string)
            .collect())
    }

    pub fn delete_cluster(&self, name: &str) -> Result<()> {
        console::info(format!("Deleting cluster '{name}'"));
        self.checked(
            self.kind().args(["delete", "cluster", "--name", name]),
            "delete",
        )?;
        Ok(())
    }

    pub fn create_cluster(&self, spec: &ClusterSpec) -> Result<()> {
        console::info(format!(
            "Creating cluster '{}' on {} ({})",
            spec.name, self.provider, spec.node_image
        ));
        let config = spec.render_kind_config();
        debug!(config = %config, "kind cluster config");
        self.checked(
            self.kind()
                .args(["create", "cluster", "--name", spec.name.as_str()])
                .args(["--config", "-", "--wait", CREATE_WAIT])
                .stdin(config),
            "create",
        )?;
        Ok(())
    }

    /// Leave exactly one usable cluster named `spec.name` behind, selected
    /// as the current kube context.
    ///
    /// Existing clusters are deleted first: without asking in force mode,
    /// otherwise after a single confirmation for the whole set.
    pub fn ensure_cluster(&self, spec: &ClusterSpec) -> Result<ClusterOutcome> {
        let existing = self.list_clusters()?;
        info!(provider = %self.provider, ?existing, "existing clusters");

        let mut remaining = existing.clone();
        if !existing.is_empty() {
            let delete = if self.force {
                console::warn(format!(
                    "Deleting existing clusters: {}",
                    existing.join(", ")
                ));
                true
            } else {
                self.interaction.confirm(&format!(
                    "Delete existing clusters ({})?",
                    existing.join(", ")
                ))?
            };
            if delete {
                for name in &existing {
                    self.delete_cluster(name)?;
                }
                remaining.clear();
            } else {
                console::info("Keeping existing clusters");
            }
        }

        let outcome = if remaining.iter().any(|name| *name == spec.name) {
            console::info(format!("Reusing existing cluster '{}'", spec.name));
            ClusterOutcome::Reused
        } else {
            self.create_cluster(spec)?;
            ClusterOutcome::Created
        };

        Cmd::new("kubectl")
            .args(["config", "use-context"])
            .arg(spec.context_name())
            .error_msg(format!("selecting kube context {}", spec.context_name()))
            .run(self.runner)?;
        console::success(format!("Cluster '{}' ready", spec.name));
        Ok(outcome)
    }
}
