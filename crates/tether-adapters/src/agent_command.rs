//! Argument and environment construction for the agent process.
//!
//! Both are computed once per spawn as plain values. The supervisor's own
//! environment is never mutated.

use std::collections::HashMap;
use std::path::PathBuf;
use tether_core::AgentConfig;
use tether_proto::{PermissionMode, StartOptions};

/// Everything needed to spawn one agent process.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    /// Fresh id for this spawn, distinct from the UI session id.
    pub spawn_id: String,
    /// Conversation being resumed, if any.
    pub resume_id: Option<String>,
}

impl AgentCommand {
    /// Builds the command for a start request.
    ///
    /// `resume_id` is the already-resolved conversation to resume. When it is
    /// `None` the agent is told to open a new conversation under `spawn_id`.
    pub fn build(
        agent: &AgentConfig,
        options: &StartOptions,
        resume_id: Option<String>,
        spawn_id: String,
        base_env: impl IntoIterator<Item = (String, String)>,
        default_cwd: PathBuf,
    ) -> Self {
        let args = build_args(agent, options, resume_id.as_deref(), &spawn_id);
        Self {
            program: agent.command.clone(),
            args,
            env: sanitized_env(base_env, agent),
            cwd: options.cwd.clone().unwrap_or(default_cwd),
            spawn_id,
            resume_id,
        }
    }
}

/// Arguments for a stream-json agent session.
///
/// `agent.args` come first so a wrapper command can take its own arguments.
pub fn build_args(
    agent: &AgentConfig,
    options: &StartOptions,
    resume_id: Option<&str>,
    spawn_id: &str,
) -> Vec<String> {
    let mut args = agent.args.clone();
    args.extend(
        [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]
        .map(String::from),
    );

    match resume_id {
        Some(id) => args.extend(["--resume".to_string(), id.to_string()]),
        None => args.extend(["--session-id".to_string(), spawn_id.to_string()]),
    }

    let mode = options.permission_mode.unwrap_or(agent.permission_mode);
    match mode {
        PermissionMode::Bypass => args.push("--dangerously-skip-permissions".to_string()),
        PermissionMode::Supervised => {
            args.extend(["--permission-mode".to_string(), "default".to_string()]);
        }
        PermissionMode::Plan => {
            args.extend(["--permission-mode".to_string(), "plan".to_string()]);
        }
    }

    let model = options.model.as_deref().or(agent.model.as_deref());
    if let Some(model) = model.filter(|m| !m.is_empty() && *m != "default") {
        args.extend(["--model".to_string(), model.to_string()]);
    }

    if let Some(prompt) = options
        .append_system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        args.extend(["--append-system-prompt".to_string(), prompt.to_string()]);
    }

    if let Some(path) = &options.mcp_config {
        args.extend([
            "--mcp-config".to_string(),
            path.to_string_lossy().into_owned(),
        ]);
    }

    args
}

/// Copies `base`, dropping agent-specific variables and prepending the
/// configured install directories to `PATH`.
pub fn sanitized_env(
    base: impl IntoIterator<Item = (String, String)>,
    agent: &AgentConfig,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = base
        .into_iter()
        .filter(|(name, _)| {
            !agent.strip_env.iter().any(|strip| strip == name)
                && !agent
                    .strip_env_prefixes
                    .iter()
                    .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
        })
        .collect();

    let home = env.get("HOME").cloned();
    let current = env.get("PATH").cloned().unwrap_or_default();
    let existing: Vec<&str> = current.split(':').filter(|p| !p.is_empty()).collect();

    let mut path: Vec<String> = Vec::new();
    for dir in &agent.install_dirs {
        let Some(dir) = expand_home(dir, home.as_deref()) else {
            continue;
        };
        if !path.contains(&dir) && !existing.contains(&dir.as_str()) {
            path.push(dir);
        }
    }
    path.extend(existing.iter().map(|p| (*p).to_string()));
    if !path.is_empty() {
        env.insert("PATH".to_string(), path.join(":"));
    }
    env
}

/// Expands a leading `~`. Directories that need a missing `HOME` are skipped.
fn expand_home(dir: &str, home: Option<&str>) -> Option<String> {
    if dir == "~" {
        return home.map(str::to_string);
    }
    match dir.strip_prefix("~/") {
        Some(rest) => home.map(|home| format!("{}/{rest}", home.trim_end_matches('/'))),
        None => Some(dir.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_new_session_uses_spawn_id() {
        let args = build_args(
            &AgentConfig::default(),
            &StartOptions::default(),
            None,
            "spawn-1",
        );
        assert_eq!(&args[..2], &["-p", "--input-format"]);
        assert_eq!(value_after(&args, "--session-id"), Some("spawn-1"));
        assert!(!args.contains(&"--resume".to_string()));
        assert_eq!(value_after(&args, "--permission-mode"), Some("default"));
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_resume_replaces_session_id() {
        let args = build_args(
            &AgentConfig::default(),
            &StartOptions::default(),
            Some("conv-9"),
            "spawn-2",
        );
        assert_eq!(value_after(&args, "--resume"), Some("conv-9"));
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn test_permission_modes() {
        let agent = AgentConfig::default();
        let mut options = StartOptions {
            permission_mode: Some(PermissionMode::Bypass),
            ..StartOptions::default()
        };
        let args = build_args(&agent, &options, None, "s");
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));

        options.permission_mode = Some(PermissionMode::Plan);
        let args = build_args(&agent, &options, None, "s");
        assert_eq!(value_after(&args, "--permission-mode"), Some("plan"));
    }

    #[test]
    fn test_optional_flags() {
        let agent = AgentConfig {
            model: Some("sonnet".to_string()),
            args: vec!["--wrapper-flag".to_string()],
            ..AgentConfig::default()
        };
        let options = StartOptions {
            append_system_prompt: Some("Be brief".to_string()),
            mcp_config: Some(PathBuf::from("/etc/mcp.json")),
            ..StartOptions::default()
        };
        let args = build_args(&agent, &options, None, "s");
        assert_eq!(args[0], "--wrapper-flag");
        assert_eq!(value_after(&args, "--model"), Some("sonnet"));
        assert_eq!(value_after(&args, "--append-system-prompt"), Some("Be brief"));
        assert_eq!(value_after(&args, "--mcp-config"), Some("/etc/mcp.json"));
    }

    #[test]
    fn test_request_model_overrides_config_and_default_is_skipped() {
        let agent = AgentConfig {
            model: Some("sonnet".to_string()),
            ..AgentConfig::default()
        };
        let options = StartOptions {
            model: Some("opus".to_string()),
            ..StartOptions::default()
        };
        assert_eq!(
            value_after(&build_args(&agent, &options, None, "s"), "--model"),
            Some("opus")
        );

        let options = StartOptions {
            model: Some("default".to_string()),
            ..StartOptions::default()
        };
        assert!(!build_args(&agent, &options, None, "s").contains(&"--model".to_string()));
    }

    #[test]
    fn test_sanitized_env_strips_agent_variables() {
        let result = sanitized_env(
            env(&[
                ("CLAUDECODE", "1"),
                ("CLAUDE_CODE_ENTRYPOINT", "cli"),
                ("CLAUDE_CONFIG_DIR", "/cfg"),
                ("HOME", "/home/u"),
                ("PATH", "/usr/bin"),
            ]),
            &AgentConfig::default(),
        );
        assert!(!result.contains_key("CLAUDECODE"));
        assert!(!result.contains_key("CLAUDE_CODE_ENTRYPOINT"));
        assert_eq!(result.get("CLAUDE_CONFIG_DIR").map(String::as_str), Some("/cfg"));
    }

    #[test]
    fn test_sanitized_env_prepends_install_dirs() {
        let agent = AgentConfig {
            install_dirs: vec!["~/.local/bin".to_string(), "/usr/bin".to_string()],
            ..AgentConfig::default()
        };
        let result = sanitized_env(env(&[("HOME", "/home/u/"), ("PATH", "/usr/bin:/bin")]), &agent);
        assert_eq!(result["PATH"], "/home/u/.local/bin:/usr/bin:/bin");
    }

    #[test]
    fn test_sanitized_env_without_home_skips_tilde_dirs() {
        let agent = AgentConfig {
            install_dirs: vec!["~/.local/bin".to_string(), "/opt/agent".to_string()],
            ..AgentConfig::default()
        };
        let result = sanitized_env(env(&[]), &agent);
        assert_eq!(result["PATH"], "/opt/agent");
    }

    #[test]
    fn test_build_uses_request_cwd() {
        let options = StartOptions {
            cwd: Some(PathBuf::from("/work")),
            ..StartOptions::default()
        };
        let command = AgentCommand::build(
            &AgentConfig::default(),
            &options,
            None,
            "spawn".to_string(),
            env(&[]),
            PathBuf::from("/fallback"),
        );
        assert_eq!(command.cwd, PathBuf::from("/work"));
        assert_eq!(command.program, "claude");
        assert_eq!(command.spawn_id, "spawn");
    }
}
