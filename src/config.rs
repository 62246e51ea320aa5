//! Server configuration (`toolchat.yaml`).
//!
//! The file is located by `--config`, then `$TOOLCHAT_CONFIG`, then
//! `./toolchat.yaml`; without one the built-in defaults apply. String values
//! may reference the environment as `${VAR}` or `${VAR:-default}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::chat::EngineConfig;
use crate::inference::LlmConfig;
use crate::tool_server::LauncherConfig;

/// Env var naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "TOOLCHAT_CONFIG";

/// File looked up in the working directory as a last resort.
pub const DEFAULT_CONFIG_FILE: &str = "toolchat.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tool_servers: ToolServersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// How long `shutdown_all` may take before the process exits anyway.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolServersConfig {
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Defaults to `toolchat-instance` next to the running executable.
    #[serde(default)]
    pub instance_host_bin: Option<PathBuf>,
    #[serde(default = "default_rendezvous_dir")]
    pub rendezvous_dir: PathBuf,
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
}

impl Default for ToolServersConfig {
    fn default() -> Self {
        Self {
            container_runtime: default_container_runtime(),
            instance_host_bin: None,
            rendezvous_dir: default_rendezvous_dir(),
            rendezvous_timeout_secs: default_rendezvous_timeout_secs(),
        }
    }
}

impl ToolServersConfig {
    pub fn instance_host_bin(&self) -> PathBuf {
        if let Some(bin) = &self.instance_host_bin {
            return bin.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("toolchat-instance")))
            .unwrap_or_else(|| PathBuf::from("toolchat-instance"))
    }
}

impl AppConfig {
    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            container_runtime: self.tool_servers.container_runtime.clone(),
            instance_host_bin: self.tool_servers.instance_host_bin(),
            rendezvous_dir: self.tool_servers.rendezvous_dir.clone(),
            rendezvous_timeout: Duration::from_secs(self.tool_servers.rendezvous_timeout_secs),
            database_path: self.storage.database_path.clone(),
            log_dir: self.storage.log_dir.clone(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".into()
}
fn default_shutdown_grace_secs() -> u64 {
    15
}
fn default_database_path() -> String {
    crate::data_dir()
        .join("toolchat.db")
        .to_string_lossy()
        .into_owned()
}
fn default_log_dir() -> PathBuf {
    crate::data_dir().join("logs")
}
fn default_container_runtime() -> String {
    "docker".into()
}
fn default_rendezvous_dir() -> PathBuf {
    std::env::temp_dir().join("toolchat")
}
fn default_rendezvous_timeout_secs() -> u64 {
    45
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the config file: explicit path, then `$TOOLCHAT_CONFIG`, then `./toolchat.yaml`.
pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Load the config, falling back to defaults when no file is found.
pub fn load(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match locate(explicit) {
        Some(path) => load_file(&path),
        None => Ok(AppConfig::default()),
    }
}

/// Read, interpolate and parse one config file.
pub fn load_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse(&raw)
}

pub fn parse(raw: &str) -> Result<AppConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. An empty variable counts as unset.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
