//! Configuration loaded from `tether.yml`.
//!
//! Every field has a default, so an absent file or a partial file is fine.
//! Values set here are defaults for start requests; a request's own options
//! always win.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_proto::PermissionMode;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tether.yml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub agent: AgentConfig,
    pub executor: ExecutorConfig,
    pub permissions: PermissionsConfig,
    pub store: StoreConfig,
}

/// How the agent process is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable name or path.
    pub command: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
    /// Default model; `None` lets the agent pick.
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    /// Directories prepended to `PATH`. A leading `~` expands to `HOME`.
    pub install_dirs: Vec<String>,
    /// Variables removed from the spawn environment by exact name.
    pub strip_env: Vec<String>,
    /// Variables removed from the spawn environment by prefix.
    pub strip_env_prefixes: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            model: None,
            permission_mode: PermissionMode::Supervised,
            install_dirs: vec![
                "~/.local/bin".to_string(),
                "~/.claude/local".to_string(),
                "/usr/local/bin".to_string(),
                "/opt/homebrew/bin".to_string(),
            ],
            strip_env: vec!["CLAUDECODE".to_string()],
            strip_env_prefixes: vec!["CLAUDE_CODE_".to_string()],
        }
    }
}

/// Limits for local tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub shell_timeout_secs: u64,
    pub file_timeout_secs: u64,
    /// Per-stream cap on captured shell output.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 120,
            file_timeout_secs: 30,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Appended to the built-in denial phrases.
    pub extra_denial_phrases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub resume_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            resume_file: PathBuf::from(".tether/sessions.json"),
        }
    }
}

impl TetherConfig {
    /// Parses YAML text.
    pub fn parse_yaml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads config from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse_yaml(&content, path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `TETHER_AGENT_COMMAND` replaces `agent.command`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(command) = std::env::var("TETHER_AGENT_COMMAND")
            && !command.trim().is_empty()
        {
            self.agent.command = command;
        }
    }
}
