//! Podman adapter.
//!
//! kind cannot read podman's image store directly, so images are exported to
//! a docker-archive and loaded from that file. The archive lives in a
//! scratch directory removed on every exit path.

use anyhow::{Context, Result};
use tracing::debug;

use super::{
    build_command, json_u64, login_with, parse_info, BuildContext, ContainerEngine, EngineKind,
    ResourceInfo,
};
use crate::credentials::Credentials;
use crate::error::BootstrapError;
use crate::image::ImageTag;
use crate::process::{Cmd, CommandRunner};

pub struct Podman<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Podman<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl ContainerEngine for Podman<'_> {
    fn kind(&self) -> EngineKind {
        EngineKind::Podman
    }

    fn image_exists_locally(&self, tag: &ImageTag) -> Result<bool> {
        // `podman image exists` exits 1 for "absent" and 125 for real errors.
        let output = Cmd::new("podman")
            .args(["image", "exists"])
            .arg(tag.to_string())
            .error_msg("querying podman image store")
            .output(self.runner)?;
        match output.code {
            0 => Ok(true),
            1 => Ok(false),
            code => Err(BootstrapError::CommandFailed {
                command: format!("podman image exists {tag}"),
                code,
                output: output.combined().trim().to_string(),
            }
            .into()),
        }
    }

    fn build_image(&self, tag: &ImageTag, context: &BuildContext, no_cache: bool) -> Result<()> {
        let output = build_command("podman", tag, context, no_cache).output(self.runner)?;
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
        login_with(self.runner, "podman", registry, credentials)
    }

    fn transfer_image_to_cluster(&self, tag: &ImageTag, cluster_name: &str) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("stack-bootstrap-image-")
            .tempdir()
            .context("creating scratch directory for image archive")?;
        let archive = scratch.path().join(format!("{}.tar", tag.component));
        debug!(archive = %archive.display(), image = %tag, "exporting image archive");

        Cmd::new("podman")
            .args(["save", "--format", "docker-archive", "-o"])
            .path_arg(&archive)
            .arg(tag.to_string())
            .error_msg(format!("exporting {tag} to an archive"))
            .run(self.runner)?;

        Cmd::new("kind")
            .args(["load", "image-archive"])
            .path_arg(&archive)
            .args(["--name", cluster_name])
            .env("KIND_EXPERIMENTAL_PROVIDER", "podman")
            .error_msg(format!("loading {tag} into cluster '{cluster_name}'"))
            .run(self.runner)?;

        scratch
            .close()
            .context("removing image archive scratch directory")?;
        Ok(())
    }

    fn resource_info(&self) -> Result<ResourceInfo> {
        let output = Cmd::new("podman")
            .args(["info", "--format", "json"])
            .error_msg("querying podman host resources")
            .run(self.runner)?;
        let doc = parse_info("podman", &output.stdout)?;
        let cpus = json_u64(&doc, &["host", "cpus"])
            .context("podman info has no host.cpus field")?;
        let memory_bytes = json_u64(&doc, &["host", "memTotal"])
            .context("podman info has no host.memTotal field")?;
        Ok(ResourceInfo { cpus, memory_bytes })
    }
}
