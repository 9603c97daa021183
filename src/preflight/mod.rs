//! Preflight checks run before any cluster state is touched.
//!
//! Validates that the host has the required tools and that the container
//! engine has enough resources for the platform. This prevents cryptic
//! errors halfway through a bootstrap.
//!
//! # Example
//!
//! ```rust,ignore
//! use stack_bootstrap::engine::EngineKind;
//! use stack_bootstrap::preflight::{check_required_tools, required_tools};
//! use stack_bootstrap::process::command_exists;
//!
//! if let Err(e) = check_required_tools(&required_tools(Some(EngineKind::Podman)), command_exists) {
//!     eprintln!("{e}");
//! }
//! ```

use anyhow::Result;
use tracing::warn;

use crate::console;
use crate::engine::{ContainerEngine, EngineKind, ResourceInfo};
use crate::error::{BootstrapError, MissingTool};
use crate::interaction::Interaction;

const GIB: u64 = 1024 * 1024 * 1024;

/// Tools every bootstrap needs regardless of engine.
///
/// Each tuple is (command_name, package_name).
pub const CLUSTER_TOOLS: &[(&str, &str)] = &[("kind", "kind"), ("kubectl", "kubectl")];

/// Stand-in entry when neither engine is on PATH. Never resolves.
pub const ANY_ENGINE: (&str, &str) = ("podman or docker", "podman or docker-ce");

/// Cluster tools plus the engine's binary.
///
/// `None` means engine detection found nothing; the engine is then listed
/// as [`ANY_ENGINE`] next to whatever cluster tools are missing.
pub fn required_tools(engine: Option<EngineKind>) -> Vec<(&'static str, &'static str)> {
    let mut tools = CLUSTER_TOOLS.to_vec();
    tools.push(match engine {
        Some(EngineKind::Podman) => ("podman", "podman"),
        Some(EngineKind::Docker) => ("docker", "docker-ce or docker.io"),
        None => ANY_ENGINE,
    });
    tools
}

/// Check that specific tools are available.
///
/// Every missing tool is collected before failing, so one run reports the
/// whole list.
pub fn check_required_tools(tools: &[(&str, &str)], exists: impl Fn(&str) -> bool) -> Result<()> {
    let missing: Vec<MissingTool> = tools
        .iter()
        .filter(|(tool, _)| !exists(tool))
        .map(|(tool, package)| MissingTool {
            command: tool.to_string(),
            package: package.to_string(),
        })
        .collect();

    if !missing.is_empty() {
        return Err(BootstrapError::MissingPrerequisite { tools: missing }.into());
    }
    Ok(())
}

/// Smallest engine allocation the full platform is known to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMinimums {
    pub cpus: u64,
    pub memory_bytes: u64,
}

impl Default for ResourceMinimums {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_bytes: 8 * GIB,
        }
    }
}

impl ResourceMinimums {
    /// Human-readable shortfall of `info`, or `None` when it is sufficient.
    pub fn shortfall(&self, info: &ResourceInfo) -> Option<String> {
        let mut problems = Vec::new();
        if info.cpus < self.cpus {
            problems.push(format!("{} CPUs (want {})", info.cpus, self.cpus));
        }
        if info.memory_bytes < self.memory_bytes {
            problems.push(format!(
                "{:.1} GiB memory (want {} GiB)",
                info.memory_bytes as f64 / GIB as f64,
                self.memory_bytes / GIB
            ));
        }
        if problems.is_empty() {
            None
        } else {
            Some(problems.join(", "))
        }
    }
}

/// Compare the engine's resources against `minimums`.
///
/// A shortfall is never ignored silently: force mode warns and continues,
/// interactive mode asks and a "no" aborts the run. Failing to query the
/// engine only warns.
pub fn check_resources(
    engine: &dyn ContainerEngine,
    interaction: &dyn Interaction,
    force: bool,
    minimums: &ResourceMinimums,
) -> Result<Option<ResourceInfo>> {
    let info = match engine.resource_info() {
        Ok(info) => info,
        Err(err) => {
            warn!(engine = %engine.kind(), error = %format!("{err:#}"), "resource query failed");
            console::warn(format!(
                "Could not determine {} resources; continuing without the check",
                engine.kind()
            ));
            return Ok(None);
        }
    };

    let Some(detail) = minimums.shortfall(&info) else {
        return Ok(Some(info));
    };

    console::warn(format!("{} has only {detail}", engine.kind()));
    if force {
        console::warn("Continuing anyway (--force)");
        return Ok(Some(info));
    }
    if interaction.confirm("Continue with insufficient resources?")? {
        Ok(Some(info))
    } else {
        Err(BootstrapError::InsufficientResourceLimits { detail }.into())
    }
}
