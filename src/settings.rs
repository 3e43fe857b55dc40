//! Runtime settings, resolved once at startup and injected into components.
//!
//! Registry coordinates, credentials and deadlines are deliberately not read
//! from the process environment inside business logic; `main` resolves them
//! here and hands the value down.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    pub port: u16,

    /// Substrate namespace all function resources live in.
    pub namespace: String,

    /// Base URL of the substrate's HTTP API (a `kubectl proxy`-style
    /// endpoint needs no token).
    pub substrate_api_url: String,
    /// Bearer token for the substrate API; empty for none.
    pub substrate_token: String,

    /// Image registry host (e.g. "ghcr.io") and project path under it.
    pub registry: String,
    pub registry_project: String,
    /// Base64 `user:token` pushed into the build job's docker config.
    pub registry_credentials: String,

    /// Prefix for derived service names: `<prefix>-<functionId>-srv`.
    pub service_prefix: String,
    /// Port the function container listens on; also the service port and
    /// the proxy target port.
    pub service_port: u16,

    /// Replica count for function deployments.
    pub replicas: i32,

    /// Reconciliation deadlines, seconds.
    pub build_deadline_secs: u64,
    pub deploy_deadline_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            namespace: "cloudfn".to_string(),
            substrate_api_url: "http://127.0.0.1:8001".to_string(),
            substrate_token: String::new(),
            registry: "ghcr.io".to_string(),
            registry_project: String::new(),
            registry_credentials: String::new(),
            service_prefix: "cloudfn".to_string(),
            service_port: 4000,
            replicas: 1,
            build_deadline_secs: 60,
            deploy_deadline_secs: 30,
        }
    }
}

impl Settings {
    pub fn build_deadline(&self) -> Duration {
        Duration::from_secs(self.build_deadline_secs)
    }

    pub fn deploy_deadline(&self) -> Duration {
        Duration::from_secs(self.deploy_deadline_secs)
    }

    /// Apply `CLOUDFN_*` environment overrides on top of whatever the file
    /// (or the defaults) provided. Called once from `main`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from a key lookup. The mapping is separate from the
    /// environment read so tests never touch process-global state.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Some(v) = lookup("CLOUDFN_REGISTRY") {
            self.registry = v;
        }
        if let Some(v) = lookup("CLOUDFN_REGISTRY_PROJECT") {
            self.registry_project = v;
        }
        if let Some(v) = lookup("CLOUDFN_BASE64_CREDENTIALS") {
            self.registry_credentials = v;
        }
        if let Some(v) = lookup("CLOUDFN_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("CLOUDFN_SUBSTRATE_URL") {
            self.substrate_api_url = v;
        }
        if let Some(v) = lookup("CLOUDFN_SUBSTRATE_TOKEN") {
            self.substrate_token = v;
        }
    }
}

/// Load settings from a YAML file. This is the I/O boundary; parsing is
/// plain serde.
pub fn load_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let content = std::fs::read_to_string(path)?;
    let settings = serde_yaml::from_str(&content)?;
    Ok(settings)
}
