use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use conclave_core::config::AgentCommandConfig;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::{Agent, AgentFactory, AgentKey};
use conclave_core::types::AgentKind;

/// Coding agent backed by an external command.
///
/// The prompt is substituted for `{prompt}` in the configured arguments, or
/// written to stdin when no argument carries it. Stdout is the reply.
pub struct CommandAgent {
    name: String,
    kind: AgentKind,
    config: AgentCommandConfig,
    working_dir: PathBuf,
    collab_dir: PathBuf,
}

impl CommandAgent {
    fn command(&self, prompt: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.command);
        for arg in &self.config.args {
            cmd.arg(arg.replace("{prompt}", prompt));
        }
        cmd.current_dir(&self.working_dir)
            .envs(&self.config.env)
            .env("CONCLAVE_AGENT", &self.name)
            .env("CONCLAVE_AGENT_KIND", self.kind.as_str())
            .env("CONCLAVE_COLLAB_DIR", &self.collab_dir)
            .stdin(if self.config.takes_prompt_as_arg() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            debug!(agent = %self.name, command = %self.config.command, "Spawning agent command");
            let failed = |e: std::io::Error| ConclaveError::agent(&self.name, e.to_string());

            let mut child = self.command(&prompt).spawn().map_err(failed)?;
            if let Some(mut stdin) = child.stdin.take() {
                // A child that exits without reading is reported by its status
                stdin.write_all(prompt.as_bytes()).await.ok();
            }
            let output = child.wait_with_output().await.map_err(failed)?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if output.status.success() {
                Ok(stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let msg: &str = if stderr.trim().is_empty() { &stdout } else { &stderr };
                Err(ConclaveError::agent(
                    &self.name,
                    format!(
                        "exit code {}: {}",
                        output.status.code().unwrap_or(-1),
                        msg.trim()
                    ),
                ))
            }
        })
    }
}

/// Creates one `CommandAgent` per key, each in `<workspace>/<agent>`.
pub struct CommandAgentFactory {
    config: AgentCommandConfig,
    collab_dir: String,
}

impl CommandAgentFactory {
    pub fn new(config: AgentCommandConfig, collab_dir: impl Into<String>) -> Self {
        Self {
            config,
            collab_dir: collab_dir.into(),
        }
    }
}

impl AgentFactory for CommandAgentFactory {
    fn create(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>> {
        let key = key.clone();
        Box::pin(async move {
            let working_dir = key.workspace.join(&key.agent);
            let collab_dir = key.workspace.join(&self.collab_dir);
            tokio::fs::create_dir_all(&working_dir).await?;
            tokio::fs::create_dir_all(&collab_dir).await?;
            info!(
                agent = %key.agent,
                kind = %key.kind,
                dir = %working_dir.display(),
                "Prepared agent workspace"
            );
            Ok(Arc::new(CommandAgent {
                name: key.agent.clone(),
                kind: key.kind,
                config: self.config.clone(),
                working_dir,
                collab_dir,
            }) as Arc<dyn Agent>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str]) -> AgentCommandConfig {
        AgentCommandConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    async fn agent(config: AgentCommandConfig, ws: &std::path::Path) -> Arc<dyn Agent> {
        let factory = CommandAgentFactory::new(config, "collab");
        let key = AgentKey::new("w", "coder", AgentKind::Coder, ws);
        factory.create(&key).await.unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_as_argument() {
        let ws = tempfile::tempdir().unwrap();
        let agent = agent(config("echo", &["{prompt}"]), ws.path()).await;
        let reply = agent.run("hello world".into()).await.unwrap();
        assert_eq!(reply.trim(), "hello world");
        assert!(ws.path().join("coder").is_dir());
        assert!(ws.path().join("collab").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_on_stdin() {
        let ws = tempfile::tempdir().unwrap();
        let agent = agent(config("cat", &[]), ws.path()).await;
        let reply = agent.run("{\"decisions\": {}}".into()).await.unwrap();
        assert_eq!(reply, "{\"decisions\": {}}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_agent_failure() {
        let ws = tempfile::tempdir().unwrap();
        let agent = agent(config("sh", &["-c", "echo broken >&2; exit 3"]), ws.path()).await;
        let err = agent.run("x".into()).await.unwrap_err();
        assert!(err.is_agent_failure());
        assert!(err.to_string().contains("exit code 3: broken"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_agent_failure() {
        let ws = tempfile::tempdir().unwrap();
        let agent = agent(config("conclave-no-such-binary", &[]), ws.path()).await;
        assert!(agent.run("x".into()).await.unwrap_err().is_agent_failure());
    }
}
