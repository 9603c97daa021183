//! Bootstrap of an ephemeral local Kubernetes platform.
//!
//! One run takes a developer machine from nothing to a working platform on
//! a disposable kind cluster:
//!
//! - **Preflight** - host tools and container engine resources
//! - **Cluster lifecycle** - replace or reuse the kind cluster
//! - **Registry credentials** - reuse cached logins, prompt otherwise
//! - **Dependencies** - ordered installs gated on readiness
//! - **Components** - content-addressed image build, load, deploy, validate
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (ordered Steps, fail-fast)
//!     │
//!     ├── ClusterLifecycleManager ──┐
//!     ├── RegistryCredentialManager ├── ContainerEngine (podman | docker)
//!     ├── DependencyInstaller ──────┤
//!     └── ComponentPipeline ────────┘
//!             │
//!             ├── ImageTag ◀── content fingerprint of the source tree
//!             └── RetryExecutor (image builds only)
//!
//! every external tool ──▶ CommandRunner (SystemRunner | FakeRunner)
//! ```
//!
//! Every stage is idempotent. There is no rollback: a failed run is
//! recovered by running again.
//!
//! # Example
//!
//! ```rust,ignore
//! use stack_bootstrap::{bootstrap, BootstrapPlan, EnvironmentConfig};
//!
//! let env = EnvironmentConfig::default();
//! let plan = BootstrapPlan::from_env_or_default(&std::env::current_dir()?)?;
//! let report = bootstrap(&env, &plan)?;
//! println!("{}", report.render());
//! ```

pub mod cluster;
pub mod config;
pub mod console;
pub mod content_hash;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod image;
pub mod install;
pub mod interaction;
pub mod kube;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod testing;

pub use config::EnvironmentConfig;
pub use error::BootstrapError;
pub use orchestrator::{bootstrap, Orchestrator, RunReport};
pub use plan::BootstrapPlan;
