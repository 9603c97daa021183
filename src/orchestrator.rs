//! Top-level sequencing of a bootstrap run.
//!
//! A run is an ordered list of [`Step`]s sharing one [`Context`]. Steps run
//! once each, in order, and the first failure ends the run:
//!
//! ```text
//! preflight ─▶ resources ─▶ cluster ─▶ credentials ─▶ dependencies ─▶ components
//! ```
//!
//! Every step is idempotent against the state the previous run left behind,
//! so an interrupted or failed run is resumed by starting over.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cluster::{ClusterLifecycleManager, ClusterOutcome};
use crate::config::EnvironmentConfig;
use crate::console;
use crate::credentials::{credential_stores, CredentialOutcome, RegistryCredentialManager};
use crate::engine::{adapter_for, select_engine, ContainerEngine, EngineKind, ResourceInfo};
use crate::install::DependencyInstaller;
use crate::interaction::{self, Interaction};
use crate::pipeline::{ComponentPipeline, ComponentReport};
use crate::plan::BootstrapPlan;
use crate::preflight::{check_required_tools, check_resources, required_tools, ResourceMinimums};
use crate::process::{command_exists, CommandRunner, SystemRunner};
use crate::retry::{Sleeper, ThreadSleeper};

/// What a run did, filled in step by step.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub engine: Option<EngineKind>,
    pub resources: Option<ResourceInfo>,
    pub cluster: Option<(String, ClusterOutcome)>,
    pub credentials: Option<(String, CredentialOutcome)>,
    pub dependencies_installed: usize,
    pub components: Vec<ComponentReport>,
    pub elapsed: Duration,
    pub finished_at: Option<OffsetDateTime>,
}

impl RunReport {
    /// Multi-line summary printed at the end of a successful run.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(engine) = self.engine {
            let _ = writeln!(out, "engine:       {engine}");
        }
        if let Some((name, outcome)) = &self.cluster {
            let verb = match outcome {
                ClusterOutcome::Created => "created",
                ClusterOutcome::Reused => "reused",
            };
            let _ = writeln!(out, "cluster:      {name} ({verb})");
        }
        if let Some((registry, outcome)) = &self.credentials {
            let _ = writeln!(out, "registry:     {registry} ({outcome})");
        }
        let _ = writeln!(out, "dependencies: {} installed", self.dependencies_installed);
        for component in &self.components {
            let source = if component.cache_hit { "cached" } else { "built" };
            let _ = writeln!(out, "component:    {} {} ({source})", component.name, component.tag);
        }
        let _ = write!(out, "elapsed:      {}s", self.elapsed.as_secs());
        if let Some(at) = self.finished_at {
            let _ = write!(out, ", finished {}", utc_timestamp(at));
        }
        out
    }
}

fn utc_timestamp(at: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Everything a step may use. Collaborators are borrowed so tests can pass
/// fakes; only the report is mutated.
pub struct Context<'a> {
    pub env: &'a EnvironmentConfig,
    pub plan: &'a BootstrapPlan,
    pub runner: &'a dyn CommandRunner,
    pub engine: &'a dyn ContainerEngine,
    pub interaction: &'a dyn Interaction,
    pub sleeper: &'a dyn Sleeper,
    /// Resolves whether a host tool is on `PATH`.
    pub tool_exists: &'a dyn Fn(&str) -> bool,
    pub credential_stores: Vec<PathBuf>,
    pub report: RunReport,
}

pub trait Step {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut Context<'_>) -> Result<()>;
}

/// Required host tools for the active engine.
pub struct Preflight;

impl Step for Preflight {
    fn name(&self) -> &'static str {
        "preflight"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let kind = ctx.engine.kind();
        check_required_tools(&required_tools(Some(kind)), ctx.tool_exists)?;
        ctx.report.engine = Some(kind);
        console::success(format!("Host tools present (engine: {kind})"));
        Ok(())
    }
}

pub struct Resources {
    pub minimums: ResourceMinimums,
}

impl Step for Resources {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.report.resources =
            check_resources(ctx.engine, ctx.interaction, ctx.env.force, &self.minimums)?;
        Ok(())
    }
}

pub struct Cluster;

impl Step for Cluster {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let manager = ClusterLifecycleManager::new(
            ctx.runner,
            ctx.interaction,
            ctx.engine.kind(),
            ctx.env.force,
        );
        let outcome = manager.ensure_cluster(&ctx.plan.cluster)?;
        ctx.report.cluster = Some((ctx.plan.cluster.name.clone(), outcome));
        Ok(())
    }
}

pub struct RegistryLogin;

impl Step for RegistryLogin {
    fn name(&self) -> &'static str {
        "registry credentials"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let manager = RegistryCredentialManager::new(
            ctx.engine,
            ctx.interaction,
            ctx.credential_stores.clone(),
        );
        let registry = ctx.env.registry_host.clone();
        let outcome = manager.ensure_login(&registry, ctx.env.force)?;
        console::success(format!("Registry {registry}: {outcome}"));
        ctx.report.credentials = Some((registry, outcome));
        Ok(())
    }
}

pub struct Dependencies;

impl Step for Dependencies {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let installer = DependencyInstaller::new(ctx.runner, ctx.sleeper);
        ctx.report.dependencies_installed = installer.install_all(&ctx.plan.install_steps)?;
        Ok(())
    }
}

pub struct Components;

impl Step for Components {
    fn name(&self) -> &'static str {
        "components"
    }

    fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let target = ctx.plan.deploy_target();
        let pipeline =
            ComponentPipeline::new(ctx.engine, ctx.runner, ctx.sleeper, ctx.env, &target);
        ctx.report.components = pipeline.run_all(&ctx.plan.components)?;
        Ok(())
    }
}

pub struct Orchestrator {
    steps: Vec<Box<dyn Step>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(vec![
            Box::new(Preflight),
            Box::new(Resources {
                minimums: ResourceMinimums::default(),
            }),
            Box::new(Cluster),
            Box::new(RegistryLogin),
            Box::new(Dependencies),
            Box::new(Components),
        ])
    }
}

impl Orchestrator {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run(&self, ctx: &mut Context<'_>) -> Result<()> {
        let started = Instant::now();
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            console::info(format!("[{}/{}] {}", i + 1, total, step.name()));
            let step_started = Instant::now();
            step.run(ctx)
                .with_context(|| format!("step '{}' failed", step.name()))?;
            debug!(step = step.name(), elapsed = ?step_started.elapsed(), "step finished");
        }
        ctx.report.elapsed = started.elapsed();
        ctx.report.finished_at = Some(OffsetDateTime::now_utc());
        info!(elapsed = ?ctx.report.elapsed, "bootstrap finished");
        Ok(())
    }
}

/// Pick the engine before any step runs.
///
/// When neither engine is on PATH the failure is the full
/// [`BootstrapError::MissingPrerequisite`] list, so the operator sees the
/// missing cluster tools in the same run.
pub fn detect_engine(
    requested: Option<EngineKind>,
    tool_exists: &dyn Fn(&str) -> bool,
) -> Result<EngineKind> {
    match select_engine(requested, tool_exists) {
        Ok(kind) => Ok(kind),
        Err(err) => {
            check_required_tools(&required_tools(None), tool_exists)?;
            Err(err)
        }
    }
}

/// Bootstrap against the real host: select the engine, wire the system
/// runner and terminal, and run the default steps.
pub fn bootstrap(env: &EnvironmentConfig, plan: &BootstrapPlan) -> Result<RunReport> {
    let runner = SystemRunner::new(env.verbose);
    let kind = detect_engine(env.requested_engine_kind()?, &command_exists)?;
    info!(engine = %kind, "selected container engine");
    let engine = adapter_for(kind, &runner);
    let interaction = interaction::for_mode(env.force);
    let sleeper = ThreadSleeper;

    let mut ctx = Context {
        env,
        plan,
        runner: &runner,
        engine: engine.as_ref(),
        interaction: interaction.as_ref(),
        sleeper: &sleeper,
        tool_exists: &command_exists,
        credential_stores: credential_stores(
            kind,
            |name| std::env::var(name).ok(),
            dirs::home_dir(),
        ),
        report: RunReport::default(),
    };
    Orchestrator::default().run(&mut ctx)?;
    Ok(ctx.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Docker;
    use crate::error::BootstrapError;
    use crate::testing::{FakeRunner, RecordingSleeper, ScriptedInteraction};
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        _root: TempDir,
        plan: BootstrapPlan,
        stores: Vec<PathBuf>,
    }

    fn harness() -> Harness {
        let root = TempDir::new().unwrap();
        for name in crate::plan::PLATFORM_COMPONENTS {
            let dir = root.path().join("workspaces").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("Dockerfile"), format!("FROM scratch # {name}\n")).unwrap();
        }
        let apps = root.path().join("deploy/apps");
        fs::create_dir_all(&apps).unwrap();
        for name in crate::plan::PLATFORM_COMPONENTS {
            fs::write(apps.join(format!("{name}.yaml")), "image: ${IMAGE}\n").unwrap();
        }
        let store = root.path().join("config.json");
        fs::write(&store, r#"{"auths": {"localhost:5001": {}}}"#).unwrap();

        let plan = BootstrapPlan::platform_default(root.path());
        Harness {
            _root: root,
            plan,
            stores: vec![store],
        }
    }

    fn healthy_runner() -> FakeRunner {
        let runner = FakeRunner::new();
        runner.on("kind get clusters", FakeRunner::ok("No kind clusters found.\n"));
        runner.on("docker info", FakeRunner::ok(r#"{"NCPU": 8, "MemTotal": 17179869184}"#));
        runner.on("kubectl get pods", FakeRunner::ok("pod/x\n"));
        runner.on(
            "kubectl get oauth2client/platform",
            FakeRunner::ok(r#"{"metadata": {"name": "platform"}, "spec": {}}"#),
        );
        runner
    }

    #[test]
    fn test_default_step_order() {
        assert_eq!(
            Orchestrator::default().step_names(),
            vec![
                "preflight",
                "resources",
                "cluster",
                "registry credentials",
                "dependencies",
                "components"
            ]
        );
    }

    #[test]
    fn test_full_run_with_fakes() {
        let h = harness();
        let runner = healthy_runner();
        let engine = Docker::new(&runner);
        let interaction = ScriptedInteraction::new();
        let sleeper = RecordingSleeper::new();
        let env = EnvironmentConfig::default();
        let tool_exists = |_: &str| true;
        let mut ctx = Context {
            env: &env,
            plan: &h.plan,
            runner: &runner,
            engine: &engine,
            interaction: &interaction,
            sleeper: &sleeper,
            tool_exists: &tool_exists,
            credential_stores: h.stores.clone(),
            report: RunReport::default(),
        };

        Orchestrator::default().run(&mut ctx).unwrap();

        let report = &ctx.report;
        assert_eq!(report.engine, Some(EngineKind::Docker));
        assert_eq!(
            report.cluster,
            Some(("platform-dev".to_string(), ClusterOutcome::Created))
        );
        assert_eq!(report.dependencies_installed, h.plan.install_steps.len());
        assert_eq!(report.components.len(), 3);
        assert!(report.finished_at.is_some());
        assert!(interaction.asked().is_empty());
        assert!(report.render().contains("cluster:      platform-dev (created)"));

        // Dependencies are all in place before the first image is loaded.
        let lines = runner.lines();
        let last_install = lines
            .iter()
            .rposition(|l| l.contains("deployment/identity") && l.starts_with("kubectl wait"))
            .unwrap();
        let first_load = lines.iter().position(|l| l.starts_with("kind load")).unwrap();
        assert!(last_install < first_load);
    }

    #[test]
    fn test_missing_tools_stop_before_cluster() {
        let h = harness();
        let runner = healthy_runner();
        let engine = Docker::new(&runner);
        let interaction = ScriptedInteraction::new();
        let sleeper = RecordingSleeper::new();
        let env = EnvironmentConfig::default();
        let tool_exists = |tool: &str| tool != "kind";
        let mut ctx = Context {
            env: &env,
            plan: &h.plan,
            runner: &runner,
            engine: &engine,
            interaction: &interaction,
            sleeper: &sleeper,
            tool_exists: &tool_exists,
            credential_stores: h.stores.clone(),
            report: RunReport::default(),
        };

        let err = Orchestrator::default().run(&mut ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::MissingPrerequisite { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_forced_run_without_credentials_stops_before_dependencies() {
        let h = harness();
        let runner = healthy_runner();
        let engine = Docker::new(&runner);
        let interaction = ScriptedInteraction::new();
        let sleeper = RecordingSleeper::new();
        let env = EnvironmentConfig {
            force: true,
            registry_host: "quay.io".into(),
            ..Default::default()
        };
        let tool_exists = |_: &str| true;
        let mut ctx = Context {
            env: &env,
            plan: &h.plan,
            runner: &runner,
            engine: &engine,
            interaction: &interaction,
            sleeper: &sleeper,
            tool_exists: &tool_exists,
            credential_stores: h.stores.clone(),
            report: RunReport::default(),
        };

        let err = Orchestrator::default().run(&mut ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::CredentialsUnavailable { .. })
        ));
        assert!(format!("{err:#}").contains("step 'registry credentials' failed"));
        assert!(interaction.asked().is_empty());
        assert_eq!(runner.count("kubectl apply"), 0);
    }

    #[test]
    fn test_bare_host_reports_every_missing_tool_at_once() {
        let err = detect_engine(None, &|_: &str| false).unwrap_err();
        match err.downcast_ref::<BootstrapError>() {
            Some(BootstrapError::MissingPrerequisite { tools }) => {
                let names: Vec<&str> = tools.iter().map(|t| t.command.as_str()).collect();
                assert_eq!(names, vec!["kind", "kubectl", "podman or docker"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_engine_detection_prefers_podman() {
        assert_eq!(detect_engine(None, &|_: &str| true).unwrap(), EngineKind::Podman);
        let docker_only = |t: &str| t != "podman";
        assert_eq!(detect_engine(None, &docker_only).unwrap(), EngineKind::Docker);
        assert_eq!(
            detect_engine(Some(EngineKind::Docker), &|_: &str| false).unwrap(),
            EngineKind::Docker
        );
    }

    #[test]
    fn test_utc_timestamp_format() {
        let at = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(utc_timestamp(at), "1970-01-01T00:00:00Z");
    }
}
