//! Registry authentication.
//!
//! ```text
//! CHECK ──found──────────────────────────────▶ AlreadyAuthenticated
//!   │
//!   └─not found─┬─ force ──────────────────────▶ CredentialsUnavailable
//!               └─ interactive ─ PROMPT ─┬─ empty/empty ─▶ Anonymous
//!                                        └─ LOGIN ─┬─────▶ LoggedIn
//!                                                  └─────▶ LoginFailed
//! ```
//!
//! CHECK only reads the engine's own credential stores. Nothing here writes
//! credentials to disk; persistence after a login is the engine's business.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::console;
use crate::engine::{ContainerEngine, EngineKind};
use crate::error::BootstrapError;
use crate::interaction::Interaction;

/// Hostnames under which tooling has recorded the public Docker Hub registry.
pub const DOCKER_HUB_ALIASES: [&str; 5] = [
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "https://index.docker.io/v1/",
    "https://index.docker.io/v1",
];

/// Username and password for one login attempt.
///
/// Lives only as long as the attempt; `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("", "")
    }

    /// Empty username and password requests anonymous access.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// An entry already exists in this store.
    AlreadyAuthenticated { store: PathBuf },
    Anonymous,
    LoggedIn,
}

impl fmt::Display for CredentialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialOutcome::AlreadyAuthenticated { store } => {
                write!(f, "cached credentials ({})", store.display())
            }
            CredentialOutcome::Anonymous => f.write_str("anonymous access"),
            CredentialOutcome::LoggedIn => f.write_str("logged in"),
        }
    }
}

/// Store keys that may hold credentials for `registry`.
///
/// The literal host always comes first. A Docker Hub alias expands to every
/// alias.
pub fn candidate_hosts(registry: &str) -> Vec<String> {
    let registry = registry.trim();
    let mut hosts = vec![registry.to_string()];
    let lowered = registry.to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&lowered.as_str()) {
        for alias in DOCKER_HUB_ALIASES {
            if !hosts.iter().any(|h| h == alias) {
                hosts.push(alias.to_string());
            }
        }
    }
    hosts
}

/// Credential stores consulted for `kind`, in lookup order.
///
/// `var` reads environment variables and `home` is the user's home
/// directory; both are parameters so the resolution can be tested.
pub fn credential_stores(
    kind: EngineKind,
    var: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> Vec<PathBuf> {
    let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    let docker_store = non_empty("DOCKER_CONFIG")
        .map(|dir| PathBuf::from(dir).join("config.json"))
        .or_else(|| home.map(|h| h.join(".docker").join("config.json")));

    let mut stores = Vec::new();
    if kind == EngineKind::Podman {
        let native = non_empty("REGISTRY_AUTH_FILE").map(PathBuf::from).or_else(|| {
            non_empty("XDG_RUNTIME_DIR")
                .map(|dir| PathBuf::from(dir).join("containers").join("auth.json"))
        });
        stores.extend(native);
    }
    stores.extend(docker_store);
    stores
}

#[derive(Debug, Default, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: serde_json::Map<String, Value>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: serde_json::Map<String, Value>,
}

/// Whether the store at `path` has an entry for any of `hosts`.
///
/// A missing store is simply empty. An unreadable or malformed one is
/// reported and treated as empty.
pub fn store_contains(path: &Path, hosts: &[String]) -> bool {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return false,
        Err(err) => {
            warn!(store = %path.display(), error = %err, "cannot read credential store");
            return false;
        }
    };
    let file: AuthFile = match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(err) => {
            warn!(store = %path.display(), error = %err, "ignoring malformed credential store");
            return false;
        }
    };
    hosts
        .iter()
        .any(|h| file.auths.contains_key(h) || file.cred_helpers.contains_key(h))
}

pub struct RegistryCredentialManager<'a> {
    engine: &'a dyn ContainerEngine,
    interaction: &'a dyn Interaction,
    stores: Vec<PathBuf>,
}

impl<'a> RegistryCredentialManager<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        interaction: &'a dyn Interaction,
        stores: Vec<PathBuf>,
    ) -> Self {
        Self {
            engine,
            interaction,
            stores,
        }
    }

    /// First store holding an entry for `registry`.
    pub fn find_cached(&self, registry: &str) -> Option<&Path> {
        let hosts = candidate_hosts(registry);
        self.stores
            .iter()
            .find(|store| store_contains(store, &hosts))
            .map(PathBuf::as_path)
    }

    /// Make sure pulls and pushes against `registry` are authorized.
    ///
    /// With `force` set a missing entry fails immediately; no prompt is ever
    /// shown.
    pub fn ensure_login(&self, registry: &str, force: bool) -> Result<CredentialOutcome> {
        if let Some(store) = self.find_cached(registry) {
            debug!(registry, store = %store.display(), "found cached credentials");
            return Ok(CredentialOutcome::AlreadyAuthenticated {
                store: store.to_path_buf(),
            });
        }

        if force {
            return Err(BootstrapError::CredentialsUnavailable {
                registry: registry.to_string(),
            }
            .into());
        }

        console::info(format!(
            "No cached credentials for {registry}. Leave both fields empty for anonymous access."
        ));
        let username = self.interaction.ask(&format!("Username for {registry}:"))?;
        let password = self.interaction.ask_secret(&format!("Password for {registry}:"))?;
        let credentials = Credentials::new(username.trim(), password);

        if credentials.is_anonymous() {
            console::info(format!("Continuing without logging in to {registry}"));
            return Ok(CredentialOutcome::Anonymous);
        }

        let result = self.engine.login(registry, &credentials);
        drop(credentials);
        result?;
        console::success(format!("Logged in to {registry}"));
        Ok(CredentialOutcome::LoggedIn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Podman;
    use crate::testing::{FakeRunner, ScriptedInteraction};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_store(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("me", "hunter2"));
        assert!(rendered.contains("me"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_candidate_hosts_expands_docker_hub() {
        assert_eq!(candidate_hosts("quay.io"), vec!["quay.io"]);
        let hub = candidate_hosts("docker.io");
        assert_eq!(hub[0], "docker.io");
        assert_eq!(hub.len(), DOCKER_HUB_ALIASES.len());
        assert!(hub.contains(&"https://index.docker.io/v1/".to_string()));
    }

    #[test]
    fn test_store_resolution_per_engine() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("DOCKER_CONFIG", "/cfg/docker"),
        ]);
        let var = |k: &str| env.get(k).map(|v| v.to_string());
        let home = Some(PathBuf::from("/home/dev"));

        assert_eq!(
            credential_stores(EngineKind::Podman, var, home.clone()),
            vec![
                PathBuf::from("/run/user/1000/containers/auth.json"),
                PathBuf::from("/cfg/docker/config.json"),
            ]
        );
        assert_eq!(
            credential_stores(EngineKind::Docker, |_| None, home),
            vec![PathBuf::from("/home/dev/.docker/config.json")]
        );
    }

    #[test]
    fn test_registry_auth_file_overrides_runtime_dir() {
        let var = |k: &str| match k {
            "REGISTRY_AUTH_FILE" => Some("/etc/auth.json".to_string()),
            "XDG_RUNTIME_DIR" => Some("/run/user/1".to_string()),
            _ => None,
        };
        let stores = credential_stores(EngineKind::Podman, var, None);
        assert_eq!(stores, vec![PathBuf::from("/etc/auth.json")]);
    }

    #[test]
    fn test_store_contains_checks_auths_and_helpers() {
        let dir = TempDir::new().unwrap();
        let store = write_store(
            &dir,
            "config.json",
            r#"{"auths": {"https://index.docker.io/v1/": {}}, "credHelpers": {"gcr.io": "gcloud"}}"#,
        );
        assert!(store_contains(&store, &candidate_hosts("docker.io")));
        assert!(store_contains(&store, &candidate_hosts("gcr.io")));
        assert!(!store_contains(&store, &candidate_hosts("quay.io")));
        assert!(!store_contains(&dir.path().join("absent.json"), &candidate_hosts("gcr.io")));
    }

    #[test]
    fn test_malformed_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = write_store(&dir, "auth.json", "{not json");
        assert!(!store_contains(&store, &candidate_hosts("quay.io")));
    }

    #[test]
    fn test_cached_entry_skips_prompt() {
        let dir = TempDir::new().unwrap();
        let native = write_store(&dir, "auth.json", r#"{"auths": {}}"#);
        let shared = write_store(&dir, "config.json", r#"{"auths": {"localhost:5001": {}}}"#);
        let runner = FakeRunner::new();
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new();
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![native, shared.clone()]);

        let outcome = manager.ensure_login("localhost:5001", false).unwrap();
        assert_eq!(outcome, CredentialOutcome::AlreadyAuthenticated { store: shared });
        assert!(interaction.asked().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_first_store_wins() {
        let dir = TempDir::new().unwrap();
        let native = write_store(&dir, "auth.json", r#"{"auths": {"quay.io": {}}}"#);
        let shared = write_store(&dir, "config.json", r#"{"auths": {"quay.io": {}}}"#);
        let runner = FakeRunner::new();
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new();
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![native.clone(), shared]);
        assert_eq!(manager.find_cached("quay.io"), Some(native.as_path()));
    }

    #[test]
    fn test_force_without_cache_fails_without_prompt() {
        let runner = FakeRunner::new();
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new();
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![]);

        let err = manager.ensure_login("quay.io", true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::CredentialsUnavailable { .. })
        ));
        assert!(interaction.asked().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_empty_answers_are_anonymous() {
        let runner = FakeRunner::new();
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new().with_answers(["", ""]);
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![]);

        let outcome = manager.ensure_login("quay.io", false).unwrap();
        assert_eq!(outcome, CredentialOutcome::Anonymous);
        assert_eq!(interaction.asked().len(), 2);
        assert_eq!(runner.count("podman login"), 0);
    }

    #[test]
    fn test_prompted_credentials_log_in() {
        let runner = FakeRunner::new();
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new().with_answers(["dev ", "pw"]);
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![]);

        let outcome = manager.ensure_login("quay.io", false).unwrap();
        assert_eq!(outcome, CredentialOutcome::LoggedIn);
        let login = runner.last("podman login").unwrap();
        assert_eq!(
            login.to_string(),
            "podman login quay.io --username dev --password-stdin"
        );
    }

    #[test]
    fn test_rejected_login_is_fatal() {
        let runner = FakeRunner::new();
        runner.on("podman login", FakeRunner::fail(1, "unauthorized"));
        let engine = Podman::new(&runner);
        let interaction = ScriptedInteraction::new().with_answers(["dev", "bad"]);
        let manager = RegistryCredentialManager::new(&engine, &interaction, vec![]);

        let err = manager.ensure_login("quay.io", false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::LoginFailed { .. })
        ));
    }
}
