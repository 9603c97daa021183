//! Docker adapter. kind reads the docker image store directly, so transfer
//! is a single `kind load docker-image`.

use anyhow::{Context, Result};

use super::{
    build_command, json_u64, login_with, parse_info, BuildContext, ContainerEngine, EngineKind,
    ResourceInfo,
};
use crate::credentials::Credentials;
use crate::error::BootstrapError;
use crate::image::ImageTag;
use crate::process::{Cmd, CommandRunner};

/// Messages `docker image inspect` prints when the reference is unknown.
const ABSENT_MARKERS: [&str; 2] = ["No such image", "No such object"];

pub struct Docker<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Docker<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl ContainerEngine for Docker<'_> {
    fn kind(&self) -> EngineKind {
        EngineKind::Docker
    }

    fn image_exists_locally(&self, tag: &ImageTag) -> Result<bool> {
        let output = Cmd::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}"])
            .arg(tag.to_string())
            .error_msg("querying docker image store")
            .output(self.runner)?;
        if output.success() {
            return Ok(true);
        }
        // `docker image inspect` has no distinct "absent" exit code; anything
        // but a missing-image message means the daemon was not reachable.
        let combined = output.combined();
        if ABSENT_MARKERS.iter().any(|m| combined.contains(m)) {
            return Ok(false);
        }
        Err(BootstrapError::CommandFailed {
            command: format!("docker image inspect {tag}"),
            code: output.code,
            output: combined.trim().to_string(),
        }
        .into())
    }

    fn build_image(&self, tag: &ImageTag, context: &BuildContext, no_cache: bool) -> Result<()> {
        let output = build_command("docker", tag, context, no_cache).output(self.runner)?;
        if !output.success() {
            return Err(BootstrapError::Build {
                image: tag.to_string(),
                detail: output.combined().trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn login(&self, registry: &str, credentials: &Credentials) -> Result<()> {
        login_with(self.runner, "docker", registry, credentials)
    }

    fn transfer_image_to_cluster(&self, tag: &ImageTag, cluster_name: &str) -> Result<()> {
        Cmd::new("kind")
            .args(["load", "docker-image"])
            .arg(tag.to_string())
            .args(["--name", cluster_name])
            .error_msg(format!("loading {tag} into cluster '{cluster_name}'"))
            .run(self.runner)?;
        Ok(())
    }

    fn resource_info(&self) -> Result<ResourceInfo> {
        let output = Cmd::new("docker")
            .args(["info", "--format", "{{json .}}"])
            .error_msg("querying docker host resources")
            .run(self.runner)?;
        let doc = parse_info("docker", &output.stdout)?;
        let cpus = json_u64(&doc, &["NCPU"]).context("docker info has no NCPU field")?;
        let memory_bytes =
            json_u64(&doc, &["MemTotal"]).context("docker info has no MemTotal field")?;
        Ok(ResourceInfo { cpus, memory_bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn tag() -> ImageTag {
        ImageTag {
            registry_host: "localhost:5001".into(),
            product: "platform".into(),
            component: "backend".into(),
            tag_suffix: "dev".into(),
            content_hash: "0a1b2c3d".into(),
        }
    }

    #[test]
    fn test_inspect_failure_means_absent() {
        let runner = FakeRunner::new();
        runner.on("docker image inspect", FakeRunner::fail(1, "No such image"));
        assert!(!Docker::new(&runner).image_exists_locally(&tag()).unwrap());
    }

    #[test]
    fn test_unreachable_daemon_is_an_error() {
        let runner = FakeRunner::new();
        runner.on(
            "docker image inspect",
            FakeRunner::fail(
                1,
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            ),
        );
        let err = Docker::new(&runner).image_exists_locally(&tag()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::CommandFailed { code: 1, .. })
        ));
        assert!(err.to_string().contains("Cannot connect"));
    }

    #[test]
    fn test_transfer_loads_from_store() {
        let runner = FakeRunner::new();
        Docker::new(&runner)
            .transfer_image_to_cluster(&tag(), "platform-dev")
            .unwrap();
        assert_eq!(
            runner.lines(),
            vec!["kind load docker-image localhost:5001/platform:backend-dev-0a1b2c3d --name platform-dev"]
        );
    }

    #[test]
    fn test_transfer_failure_propagates() {
        let runner = FakeRunner::new();
        runner.on("kind load", FakeRunner::fail(1, "no nodes found"));
        let err = Docker::new(&runner)
            .transfer_image_to_cluster(&tag(), "gone")
            .unwrap_err();
        assert!(format!("{err:#}").contains("no nodes found"));
    }

    #[test]
    fn test_login_failure_is_login_failed() {
        let runner = FakeRunner::new();
        runner.on("docker login", FakeRunner::fail(1, "unauthorized"));
        let err = Docker::new(&runner)
            .login("ghcr.io", &Credentials::new("me", "wrong"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::LoginFailed { .. })
        ));
    }

    #[test]
    fn test_resource_info_reads_top_level_fields() {
        let runner = FakeRunner::new();
        runner.on(
            "docker info",
            FakeRunner::ok(r#"{"NCPU": 2, "MemTotal": 4294967296, "Name": "host"}"#),
        );
        let info = Docker::new(&runner).resource_info().unwrap();
        assert_eq!(info.cpus, 2);
        assert_eq!(info.memory_bytes, 4 * 1024 * 1024 * 1024);
    }
}
