//! Per-component build, load, deploy and validate.
//!
//! ```text
//! tag ─▶ cached? ──yes (not forced)──────────────┐
//!          └─no──▶ build (retried) ──────────────┤
//!                                                ▼
//!        kind load ─▶ apply manifest ─▶ restart ─▶ wait ready
//!                                                ─▶ routing + settle ─▶ rollout status
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::EnvironmentConfig;
use crate::console;
use crate::engine::{BuildContext, ContainerEngine};
use crate::image::{tag_component, ImageTag};
use crate::kube::{Kubectl, WaitFor};
use crate::process::CommandRunner;
use crate::retry::{RetryExecutor, RetryPolicy, Sleeper};

/// Placeholder replaced with the image reference in deployment manifests.
pub const IMAGE_PLACEHOLDER: &str = "${IMAGE}";

pub const DEFAULT_NAMESPACE: &str = "platform";
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(180);

/// One buildable application component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub name: String,
    /// Build context; also the tree that is fingerprinted.
    pub source_dir: PathBuf,
    /// Paths relative to `source_dir` left out of the fingerprint.
    pub excluded: Vec<PathBuf>,
    pub dockerfile: Option<PathBuf>,
    pub namespace: String,
    /// Label selector of the component's pods.
    pub selector: String,
    pub readiness_timeout: Duration,
    /// Deployment workload name.
    pub deployment: String,
    /// Manifest containing [`IMAGE_PLACEHOLDER`]. Without one the image of
    /// an already deployed workload is updated in place.
    pub manifest: Option<PathBuf>,
    /// Traffic-routing config applied after the workload is ready.
    pub routing: Option<PathBuf>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            selector: format!("app.kubernetes.io/name={name}"),
            deployment: name.clone(),
            source_dir: source_dir.into(),
            excluded: Vec::new(),
            dockerfile: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            manifest: None,
            routing: None,
            name,
        }
    }

    fn build_context(&self) -> BuildContext {
        BuildContext {
            dir: self.source_dir.clone(),
            dockerfile: self.dockerfile.clone(),
        }
    }

    fn workload(&self) -> String {
        format!("deployment/{}", self.deployment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentReport {
    pub name: String,
    pub tag: ImageTag,
    /// The image was already present and no build ran.
    pub cache_hit: bool,
}

/// Where components are deployed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub product: String,
    pub cluster_name: String,
    /// Pause after routing changes for the mesh control plane to
    /// reconcile them.
    pub propagation_delay: Duration,
}

pub struct ComponentPipeline<'a> {
    engine: &'a dyn ContainerEngine,
    kubectl: Kubectl<'a>,
    retry: RetryExecutor<'a>,
    sleeper: &'a dyn Sleeper,
    env: &'a EnvironmentConfig,
    target: &'a DeployTarget,
}

impl<'a> ComponentPipeline<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        runner: &'a dyn CommandRunner,
        sleeper: &'a dyn Sleeper,
        env: &'a EnvironmentConfig,
        target: &'a DeployTarget,
    ) -> Self {
        Self {
            engine,
            kubectl: Kubectl::new(runner, sleeper),
            retry: RetryExecutor::new(runner, sleeper, RetryPolicy::default()),
            sleeper,
            env,
            target,
        }
    }

    /// Run every component in order, stopping at the first failure.
    pub fn run_all(&self, components: &[ComponentSpec]) -> Result<Vec<ComponentReport>> {
        let total = components.len();
        let mut reports = Vec::with_capacity(total);
        for (i, component) in components.iter().enumerate() {
            console::progress(i + 1, total, format!("Deploying {}", component.name));
            let report = self
                .build_deploy_validate(component)
                .with_context(|| format!("deploying component '{}'", component.name))?;
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn build_deploy_validate(&self, component: &ComponentSpec) -> Result<ComponentReport> {
        let tag = tag_component(component, &self.target.product, self.env)?;
        let cache_hit = self.ensure_image(component, &tag)?;

        self.engine
            .transfer_image_to_cluster(&tag, &self.target.cluster_name)?;
        self.deploy(component, &tag)?;
        self.validate(component)?;

        console::success(format!("{} running {}", component.name, tag));
        Ok(ComponentReport {
            name: component.name.clone(),
            tag,
            cache_hit,
        })
    }

    /// Build `tag` unless it is already present. Returns whether the local
    /// image was reused.
    fn ensure_image(&self, component: &ComponentSpec, tag: &ImageTag) -> Result<bool> {
        let force = self.env.force;
        if !force && self.engine.image_exists_locally(tag)? {
            console::info(format!("Using cached image {tag}"));
            info!(component = %component.name, %tag, "cache hit");
            return Ok(true);
        }

        console::info(format!("Building {tag}"));
        let context = component.build_context();
        self.retry.attempt(&format!("building {}", component.name), |_| {
            self.engine.build_image(tag, &context, force)
        })?;
        Ok(false)
    }

    fn deploy(&self, component: &ComponentSpec, tag: &ImageTag) -> Result<()> {
        let image = tag.to_string();
        match &component.manifest {
            Some(manifest) => {
                let rendered = render_manifest(manifest, &image)?;
                self.kubectl
                    .apply_document(rendered, &manifest.display().to_string())?;
            }
            None => self
                .kubectl
                .set_image(&component.deployment, &component.namespace, &image)?,
        }
        self.kubectl
            .rollout_restart(&component.workload(), &component.namespace)
    }

    fn validate(&self, component: &ComponentSpec) -> Result<()> {
        self.kubectl.wait(&WaitFor::pods_ready(
            component.selector.clone(),
            component.namespace.clone(),
            component.readiness_timeout,
        ))?;

        if let Some(routing) = &component.routing {
            self.kubectl.apply(&routing.display().to_string())?;
            let delay = self.target.propagation_delay;
            if !delay.is_zero() {
                console::info(format!(
                    "Waiting {}s for routing changes to propagate",
                    delay.as_secs()
                ));
                self.sleeper.sleep(delay);
            }
        }

        self.kubectl.rollout_status(
            &component.workload(),
            &component.namespace,
            component.readiness_timeout,
        )
    }
}

/// Read `manifest` and substitute the image reference.
fn render_manifest(manifest: &Path, image: &str) -> Result<String> {
    let raw = fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
    Ok(raw.replace(IMAGE_PLACEHOLDER, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Docker;
    use crate::error::BootstrapError;
    use crate::testing::{FakeRunner, RecordingSleeper};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, ComponentSpec) {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("backend");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("Dockerfile"), "FROM scratch\n").unwrap();
        let manifest = temp.path().join("backend.yaml");
        fs::write(&manifest, "image: ${IMAGE}\n").unwrap();
        let mut spec = ComponentSpec::new("backend", &src);
        spec.manifest = Some(manifest);
        (temp, spec)
    }

    fn target() -> DeployTarget {
        DeployTarget {
            product: "platform".into(),
            cluster_name: "platform-dev".into(),
            propagation_delay: Duration::from_secs(5),
        }
    }

    fn ready_runner() -> FakeRunner {
        let runner = FakeRunner::new();
        runner.on("kubectl get pods", FakeRunner::ok("pod/backend-1\n"));
        runner
    }

    #[test]
    fn test_cache_hit_skips_build() {
        let (_temp, spec) = fixture();
        let runner = ready_runner();
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let report = pipeline.build_deploy_validate(&spec).unwrap();
        assert!(report.cache_hit);
        assert_eq!(runner.count("docker build"), 0);
        assert_eq!(runner.count("kind load docker-image"), 1);
    }

    #[test]
    fn test_force_rebuilds_without_cache() {
        let (_temp, spec) = fixture();
        let runner = ready_runner();
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig {
            force: true,
            ..Default::default()
        };
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let report = pipeline.build_deploy_validate(&spec).unwrap();
        assert!(!report.cache_hit);
        assert_eq!(runner.count("docker image inspect"), 0);
        let build = runner.last("docker build").unwrap();
        assert!(build.get_args().contains(&"--no-cache".to_string()));
    }

    #[test]
    fn test_flaky_build_is_retried_with_backoff() {
        let (_temp, spec) = fixture();
        let runner = ready_runner();
        runner.on("docker image inspect", FakeRunner::fail(1, "No such image"));
        runner.on_sequence(
            "docker build",
            vec![FakeRunner::fail(1, "network"), FakeRunner::ok("")],
        );
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        pipeline.build_deploy_validate(&spec).unwrap();
        assert_eq!(runner.count("docker build"), 2);
        assert_eq!(sleeper.recorded()[0], Duration::from_secs(10));
    }

    #[test]
    fn test_unreachable_engine_is_not_a_cache_miss() {
        let (_temp, spec) = fixture();
        let runner = ready_runner();
        runner.on(
            "docker image inspect",
            FakeRunner::fail(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
        );
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let err = pipeline.build_deploy_validate(&spec).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::CommandFailed { .. })
        ));
        assert_eq!(runner.count("docker build"), 0);
        assert!(sleeper.recorded().is_empty());
    }

    #[test]
    fn test_build_exhaustion_is_build_error() {
        let (_temp, spec) = fixture();
        let runner = ready_runner();
        runner.on("docker image inspect", FakeRunner::fail(1, "Error: No such image"));
        runner.on("docker build", FakeRunner::fail(1, "broken Dockerfile"));
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let err = pipeline.build_deploy_validate(&spec).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::Build { .. })
        ));
        assert_eq!(runner.count("docker build"), 3);
        assert_eq!(runner.count("kind load"), 0);
    }

    #[test]
    fn test_manifest_receives_tag_and_routing_waits() {
        let (temp, mut spec) = fixture();
        let routing = temp.path().join("backend-routing.yaml");
        fs::write(&routing, "kind: VirtualService\n").unwrap();
        spec.routing = Some(routing);
        let runner = ready_runner();
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let report = pipeline.build_deploy_validate(&spec).unwrap();

        let applied = runner.last("kubectl apply -f -").unwrap();
        let body = String::from_utf8(applied.get_stdin().unwrap().to_vec()).unwrap();
        assert_eq!(body, format!("image: {}\n", report.tag));
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(5)]);
        assert_eq!(runner.count("kubectl rollout restart deployment/backend"), 1);
        assert_eq!(runner.count("kubectl rollout status deployment/backend"), 1);
    }

    #[test]
    fn test_without_manifest_updates_image_in_place() {
        let (_temp, mut spec) = fixture();
        spec.manifest = None;
        let runner = ready_runner();
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        pipeline.build_deploy_validate(&spec).unwrap();
        assert_eq!(runner.count("kubectl set image deployment/backend"), 1);
        assert_eq!(runner.count("kubectl apply"), 0);
    }

    #[test]
    fn test_failure_stops_later_components() {
        let (temp, spec) = fixture();
        let mut frontend = ComponentSpec::new("frontend", temp.path().join("missing"));
        frontend.manifest = None;
        let runner = ready_runner();
        runner.on("kubectl wait", FakeRunner::fail(1, "timed out"));
        let sleeper = RecordingSleeper::new();
        let engine = Docker::new(&runner);
        let env = EnvironmentConfig::default();
        let target = target();
        let pipeline = ComponentPipeline::new(&engine, &runner, &sleeper, &env, &target);

        let err = pipeline.run_all(&[spec, frontend]).unwrap_err();
        assert!(format!("{err:#}").contains("deploying component 'backend'"));
        assert_eq!(runner.count("kind load"), 1);
    }
}
