use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};

/// Top-level Conclave configuration (`conclave.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agent: AgentCommandConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Turn budget for workflows that do not declare `max_turns`.
    #[serde(default = "default_max_turns")]
    pub default_max_turns: usize,
    /// Hard step ceiling = max_turns * this.
    #[serde(default = "default_step_ceiling_multiplier")]
    pub step_ceiling_multiplier: usize,
    /// Per-call agent timeout. 0 disables it.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_turns: default_max_turns(),
            step_ceiling_multiplier: default_step_ceiling_multiplier(),
            agent_timeout_secs: default_agent_timeout(),
            workflows_dir: default_workflows_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Shared directory (relative to a run's workspace) whose files form the final output.
    #[serde(default = "default_collab_dir")]
    pub collab_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            collab_dir: default_collab_dir(),
        }
    }
}

/// External process used as the coding agent.
///
/// `{prompt}` inside `args` is replaced by the rendered prompt. When no
/// argument carries the placeholder, the prompt is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            env: HashMap::new(),
        }
    }
}

impl AgentCommandConfig {
    pub fn takes_prompt_as_arg(&self) -> bool {
        self.args.iter().any(|a| a.contains("{prompt}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relative paths resolve under the workspace root.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary, 2 = replies and transitions, 3 = every state entry.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}
fn default_step_ceiling_multiplier() -> usize {
    3
}
fn default_agent_timeout() -> u64 {
    900
}
fn default_workflows_dir() -> String {
    "workflows".to_string()
}
fn default_workspace_root() -> String {
    "~/.conclave/workspaces".to_string()
}
fn default_collab_dir() -> String {
    "collab".to_string()
}
fn default_agent_command() -> String {
    "aider".to_string()
}
fn default_agent_args() -> Vec<String> {
    ["--yes-always", "--no-pretty", "--message", "{prompt}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30000
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_level() -> u8 {
    2
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConclaveError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| ConclaveError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    fn check(&self) -> Result<()> {
        if self.engine.default_max_turns == 0 {
            return Err(ConclaveError::Config(
                "engine.default_max_turns must be at least 1".into(),
            ));
        }
        if self.engine.step_ceiling_multiplier == 0 {
            return Err(ConclaveError::Config(
                "engine.step_ceiling_multiplier must be at least 1".into(),
            ));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConclaveError::Config("agent.command must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve the workspace root (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace.root)
    }

    /// Resolve the run-log directory; relative paths hang off the workspace root.
    pub fn log_dir(&self) -> PathBuf {
        let dir = expand_home(&self.log.log_dir);
        if dir.is_absolute() {
            dir
        } else {
            self.workspace_dir().join(dir)
        }
    }

    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.engine.workflows_dir)
    }

    /// Per-call agent timeout, if enabled.
    pub fn agent_timeout(&self) -> Option<std::time::Duration> {
        match self.engine.agent_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CONCLAVE_AGENT", "claude");
        let result = expand_env_vars("command = \"${TEST_CONCLAVE_AGENT}\"");
        assert_eq!(result, "command = \"claude\"");
        std::env::remove_var("TEST_CONCLAVE_AGENT");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("root = \"${NONEXISTENT_CONCLAVE_VAR}\"");
        assert_eq!(result, "root = \"${NONEXISTENT_CONCLAVE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_max_turns, 10);
        assert_eq!(config.engine.step_ceiling_multiplier, 3);
        assert_eq!(config.engine.agent_timeout_secs, 900);
        assert_eq!(config.workspace.collab_dir, "collab");
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.log.enabled);
        assert!(config.agent.takes_prompt_as_arg());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[engine]
agent_timeout_secs = 0

[agent]
command = "my-agent"
args = ["--stdin"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(config.agent_timeout().is_none());
        assert_eq!(config.engine.default_max_turns, 10);
        assert_eq!(config.agent.command, "my-agent");
        assert!(!config.agent.takes_prompt_as_arg());
    }

    #[test]
    fn test_relative_log_dir_under_workspace() {
        let mut config = AppConfig::default();
        config.workspace.root = "/srv/conclave".into();
        config.log.log_dir = "logs".into();
        assert_eq!(config.log_dir(), PathBuf::from("/srv/conclave/logs"));
        config.log.log_dir = "/var/log/conclave".into();
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/conclave"));
    }

    #[test]
    fn test_zero_multiplier_rejected() {
        let mut config = AppConfig::default();
        config.engine.step_ceiling_multiplier = 0;
        assert!(matches!(config.check(), Err(ConclaveError::Config(_))));
    }
}
