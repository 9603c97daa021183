//! What gets bootstrapped: cluster, dependencies and components.
//!
//! The built-in plan describes the platform repository layout. A different
//! layout can be described in TOML and selected with [`PLAN_ENV_VAR`]:
//!
//! ```toml
//! product = "platform"
//! propagation_delay_secs = 5
//!
//! [cluster]
//! name = "platform-dev"
//! node_image = "kindest/node:v1.30.0"
//!
//! [[install]]
//! name = "cert-manager"
//! apply = { kind = "manifest", source = "https://example.com/cert-manager.yaml" }
//! wait = { kind = "deployment-available", name = "cert-manager-webhook" }
//! namespace = "cert-manager"
//!
//! [[component]]
//! name = "backend"
//! source_dir = "workspaces/backend"
//! manifest = "deploy/apps/backend.yaml"
//! ```
//!
//! Relative paths are resolved against the plan file's directory.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cluster::{ClusterSpec, PortMapping};
use crate::config::PLAN_ENV_VAR;
use crate::install::{ApplyTarget, ConfigPatch, InstallStep};
use crate::kube::{WaitCondition, WaitFor};
use crate::pipeline::{ComponentSpec, DeployTarget, DEFAULT_NAMESPACE, DEFAULT_READINESS_TIMEOUT};

pub const DEFAULT_PRODUCT: &str = "platform";
pub const DEFAULT_CLUSTER_NAME: &str = "platform-dev";
pub const DEFAULT_NODE_IMAGE: &str = "kindest/node:v1.30.0";
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 180;

/// Components in deployment order; later ones call earlier ones.
pub const PLATFORM_COMPONENTS: [&str; 3] = ["controller", "backend", "frontend"];

const CERT_MANAGER_MANIFEST: &str =
    "https://github.com/cert-manager/cert-manager/releases/download/v1.15.3/cert-manager.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapPlan {
    pub product: String,
    pub cluster: ClusterSpec,
    pub install_steps: Vec<InstallStep>,
    pub components: Vec<ComponentSpec>,
    pub propagation_delay: Duration,
}

impl BootstrapPlan {
    /// The platform layout rooted at `root`.
    pub fn platform_default(root: &Path) -> Self {
        let apps = root.join("deploy").join("apps");
        let components = PLATFORM_COMPONENTS
            .iter()
            .map(|name| {
                let mut spec = ComponentSpec::new(*name, root.join("workspaces").join(name));
                spec.excluded = vec![PathBuf::from("node_modules"), PathBuf::from("target")];
                spec.manifest = Some(apps.join(format!("{name}.yaml")));
                let routing = apps.join(format!("{name}-routing.yaml"));
                spec.routing = routing.is_file().then_some(routing);
                spec
            })
            .collect();

        let timeout = Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS);
        let install_steps = vec![
            InstallStep {
                name: "platform-crds".into(),
                apply: ApplyTarget::ServerSide {
                    source: root.join("deploy").join("crds").display().to_string(),
                },
                patch: None,
                wait: WaitFor {
                    condition: WaitCondition::NamespaceExists,
                    namespace: DEFAULT_NAMESPACE.into(),
                    timeout,
                },
            },
            InstallStep {
                name: "cert-manager".into(),
                apply: ApplyTarget::Manifest {
                    source: CERT_MANAGER_MANIFEST.into(),
                },
                patch: None,
                wait: WaitFor {
                    condition: WaitCondition::DeploymentAvailable {
                        name: "cert-manager-webhook".into(),
                    },
                    namespace: "cert-manager".into(),
                    timeout,
                },
            },
            InstallStep {
                name: "service-mesh".into(),
                apply: ApplyTarget::Kustomize {
                    dir: root.join("deploy").join("mesh"),
                },
                patch: None,
                wait: WaitFor::pods_ready("app=istiod", "istio-system", Duration::from_secs(300)),
            },
            InstallStep {
                name: "identity".into(),
                apply: ApplyTarget::Kustomize {
                    dir: root.join("deploy").join("identity"),
                },
                patch: Some(ConfigPatch {
                    resource: "oauth2client/platform".into(),
                    namespace: "identity".into(),
                    merge: serde_json::json!({
                        "spec": {
                            "redirectURIs": [
                                "http://localhost:8080/auth/callback",
                                "https://localhost:8443/auth/callback"
                            ]
                        }
                    }),
                    restart: Some("deployment/identity".into()),
                }),
                wait: WaitFor {
                    condition: WaitCondition::DeploymentAvailable {
                        name: "identity".into(),
                    },
                    namespace: "identity".into(),
                    timeout,
                },
            },
        ];

        Self {
            product: DEFAULT_PRODUCT.into(),
            cluster: ClusterSpec {
                name: DEFAULT_CLUSTER_NAME.into(),
                node_image: DEFAULT_NODE_IMAGE.into(),
                api_server_extra_args: ClusterSpec::service_account_issuer_args(),
                port_mappings: vec![
                    PortMapping {
                        container_port: 80,
                        host_port: 8080,
                    },
                    PortMapping {
                        container_port: 443,
                        host_port: 8443,
                    },
                ],
            },
            install_steps,
            components,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
        }
    }

    /// Plan named by [`PLAN_ENV_VAR`], or the built-in one rooted at `root`.
    pub fn from_env_or_default(root: &Path) -> Result<Self> {
        match std::env::var_os(PLAN_ENV_VAR).filter(|v| !v.is_empty()) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::platform_default(root)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&raw, base).with_context(|| format!("invalid plan {}", path.display()))
    }

    /// Parse a TOML plan; relative paths are joined onto `base`.
    pub fn from_toml_str(raw: &str, base: &Path) -> Result<Self> {
        let file: PlanFile = toml::from_str(raw)?;
        file.resolve(base)
    }

    pub fn deploy_target(&self) -> DeployTarget {
        DeployTarget {
            product: self.product.clone(),
            cluster_name: self.cluster.name.clone(),
            propagation_delay: self.propagation_delay,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default = "default_product")]
    product: String,
    #[serde(default)]
    propagation_delay_secs: Option<u64>,
    #[serde(default)]
    cluster: ClusterFile,
    #[serde(default)]
    install: Vec<StepFile>,
    #[serde(default)]
    component: Vec<ComponentFile>,
}

fn default_product() -> String {
    DEFAULT_PRODUCT.to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClusterFile {
    name: Option<String>,
    node_image: Option<String>,
    /// Added to, or overriding, the service-account issuer flags.
    #[serde(default)]
    api_server_extra_args: BTreeMap<String, String>,
    port_mappings: Option<Vec<PortMapping>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    name: String,
    apply: ApplyTarget,
    #[serde(default)]
    patch: Option<ConfigPatch>,
    wait: WaitCondition,
    namespace: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComponentFile {
    name: String,
    source_dir: PathBuf,
    #[serde(default)]
    excluded: Vec<PathBuf>,
    dockerfile: Option<PathBuf>,
    namespace: Option<String>,
    selector: Option<String>,
    timeout_secs: Option<u64>,
    deployment: Option<String>,
    manifest: Option<PathBuf>,
    routing: Option<PathBuf>,
}

impl PlanFile {
    fn resolve(self, base: &Path) -> Result<BootstrapPlan> {
        let defaults = BootstrapPlan::platform_default(base);

        let mut api_server_extra_args = ClusterSpec::service_account_issuer_args();
        api_server_extra_args.extend(self.cluster.api_server_extra_args);
        let cluster = ClusterSpec {
            name: self.cluster.name.unwrap_or(defaults.cluster.name),
            node_image: self.cluster.node_image.unwrap_or(defaults.cluster.node_image),
            api_server_extra_args,
            port_mappings: self
                .cluster
                .port_mappings
                .unwrap_or(defaults.cluster.port_mappings),
        };
        if cluster.name.trim().is_empty() {
            bail!("cluster.name must not be empty");
        }

        let mut seen = HashSet::new();
        let mut install_steps = Vec::with_capacity(self.install.len());
        for (i, step) in self.install.into_iter().enumerate() {
            if step.name.trim().is_empty() {
                bail!("install[{i}].name must not be empty");
            }
            if !seen.insert(step.name.clone()) {
                bail!("install[{i}].name '{}' is listed twice", step.name);
            }
            install_steps.push(InstallStep {
                apply: resolve_target(step.apply, base),
                patch: step.patch,
                wait: WaitFor {
                    condition: step.wait,
                    namespace: step.namespace,
                    timeout: Duration::from_secs(
                        step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
                    ),
                },
                name: step.name,
            });
        }

        let mut seen = HashSet::new();
        let mut components = Vec::with_capacity(self.component.len());
        for (i, c) in self.component.into_iter().enumerate() {
            if c.name.trim().is_empty() {
                bail!("component[{i}].name must not be empty");
            }
            if !seen.insert(c.name.clone()) {
                bail!("component[{i}].name '{}' is listed twice", c.name);
            }
            let mut spec = ComponentSpec::new(c.name, resolve_path(base, c.source_dir));
            spec.excluded = c.excluded;
            spec.dockerfile = c.dockerfile.map(|p| resolve_path(base, p));
            if let Some(namespace) = c.namespace {
                spec.namespace = namespace;
            }
            if let Some(selector) = c.selector {
                spec.selector = selector;
            }
            if let Some(deployment) = c.deployment {
                spec.deployment = deployment;
            }
            spec.readiness_timeout = c
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_READINESS_TIMEOUT);
            spec.manifest = c.manifest.map(|p| resolve_path(base, p));
            spec.routing = c.routing.map(|p| resolve_path(base, p));
            components.push(spec);
        }

        Ok(BootstrapPlan {
            product: self.product,
            cluster,
            install_steps,
            components,
            propagation_delay: self
                .propagation_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROPAGATION_DELAY),
        })
    }
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn resolve_source(base: &Path, source: String) -> String {
    if source.contains("://") {
        source
    } else {
        resolve_path(base, PathBuf::from(source)).display().to_string()
    }
}

fn resolve_target(target: ApplyTarget, base: &Path) -> ApplyTarget {
    match target {
        ApplyTarget::Manifest { source } => ApplyTarget::Manifest {
            source: resolve_source(base, source),
        },
        ApplyTarget::ServerSide { source } => ApplyTarget::ServerSide {
            source: resolve_source(base, source),
        },
        ApplyTarget::Kustomize { dir } => ApplyTarget::Kustomize {
            dir: resolve_path(base, dir),
        },
    }
}
