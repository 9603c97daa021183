//! stack-bootstrap - bring up the local platform on a fresh kind cluster.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stack_bootstrap::config::{
    parse_registry_host, parse_tag_suffix, DEFAULT_REGISTRY, DEFAULT_TAG_SUFFIX, ENGINE_ENV_VAR,
};
use stack_bootstrap::{bootstrap, console, BootstrapError, BootstrapPlan, EnvironmentConfig};

/// Bootstrap the platform on an ephemeral local Kubernetes cluster.
///
/// Replaces any existing kind cluster, installs platform dependencies and
/// builds, loads and deploys every application component. Safe to re-run.
#[derive(Debug, Parser)]
#[command(name = "stack-bootstrap")]
#[command(version, about, long_about = None)]
#[command(after_help = "Environment:\n  BOOTSTRAP_CONTAINER_ENGINE  podman or docker (default: auto-detect)\n  BOOTSTRAP_PLAN              TOML plan replacing the built-in one")]
struct Cli {
    /// Echo every external command's output.
    #[arg(short, long)]
    verbose: bool,

    /// Never prompt: delete clusters without asking and fail instead of
    /// asking for registry credentials.
    #[arg(short, long)]
    force: bool,

    /// Registry host images are tagged for.
    #[arg(short, long, value_name = "HOST", default_value = DEFAULT_REGISTRY, value_parser = parse_registry_host)]
    registry: String,

    /// Suffix placed between component name and content hash in tags.
    #[arg(short, long, value_name = "SUFFIX", default_value = DEFAULT_TAG_SUFFIX, value_parser = parse_tag_suffix)]
    tag_suffix: String,

    /// Container engine (overrides auto-detection).
    #[arg(long, env = ENGINE_ENV_VAR, value_name = "ENGINE")]
    engine: Option<String>,
}

impl Cli {
    fn environment(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            registry_host: self.registry.clone(),
            tag_suffix: self.tag_suffix.clone(),
            force: self.force,
            verbose: self.verbose,
            requested_engine: self
                .engine
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let env = cli.environment();
    let root = std::env::current_dir().context("resolving current directory")?;
    let plan = BootstrapPlan::from_env_or_default(&root)?;

    console::info(format!(
        "Bootstrapping '{}' on cluster '{}' (registry {}, suffix '{}')",
        plan.product, plan.cluster.name, env.registry_host, env.tag_suffix
    ));
    let report = bootstrap(&env, &plan)?;

    console::success("Platform ready");
    println!("{}", report.render());
    Ok(())
}

fn print_error(err: &anyhow::Error) {
    console::error(format!("{err:#}"));
    if let Some(hint) = err.downcast_ref::<BootstrapError>().and_then(BootstrapError::hint) {
        eprintln!("\nHint: {hint}");
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version land here too and are not failures.
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        print_error(&e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from(["stack-bootstrap", "-v", "-f", "-r", "ghcr.io", "-t", "ci"]).unwrap();
        let env = cli.environment();
        assert!(env.verbose && env.force);
        assert_eq!(env.registry_host, "ghcr.io");
        assert_eq!(env.tag_suffix, "ci");
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["stack-bootstrap"]).unwrap();
        assert_eq!(cli.registry, DEFAULT_REGISTRY);
        assert_eq!(cli.tag_suffix, DEFAULT_TAG_SUFFIX);
    }

    #[test]
    fn test_unknown_flag_is_error() {
        let err = Cli::try_parse_from(["stack-bootstrap", "--bogus"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_malformed_tag_parts_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["stack-bootstrap", "-t", ""]).is_err());
        assert!(Cli::try_parse_from(["stack-bootstrap", "-t", "Feature/X"]).is_err());
        assert!(Cli::try_parse_from(["stack-bootstrap", "-r", "https://ghcr.io"]).is_err());
    }

    #[test]
    fn test_missing_value_is_error() {
        assert!(Cli::try_parse_from(["stack-bootstrap", "--registry"]).is_err());
    }
}
