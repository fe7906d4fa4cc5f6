use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::AgentKind;

/// A coding agent: given a prompt, returns free text.
pub trait Agent: Send + Sync + 'static {
    /// Agent slot name (as declared in the workflow).
    fn name(&self) -> &str;

    /// Send one prompt and wait for the full reply.
    fn run(&self, prompt: String) -> BoxFuture<'_, Result<String>>;
}

/// Identity of an agent handle: one per (workflow, agent, workspace).
///
/// `kind` travels with the key for the factory but is not part of identity.
#[derive(Debug, Clone)]
pub struct AgentKey {
    pub workflow: String,
    pub agent: String,
    pub kind: AgentKind,
    pub workspace: PathBuf,
}

impl AgentKey {
    pub fn new(
        workflow: impl Into<String>,
        agent: impl Into<String>,
        kind: AgentKind,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            agent: agent.into(),
            kind,
            workspace: workspace.into(),
        }
    }

    /// `workflow:agent:workspace`, used for logging and stats.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.workflow,
            self.agent,
            self.workspace.display()
        )
    }
}

impl PartialEq for AgentKey {
    fn eq(&self, other: &Self) -> bool {
        self.workflow == other.workflow
            && self.agent == other.agent
            && self.workspace == other.workspace
    }
}

impl Eq for AgentKey {}

impl Hash for AgentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.workflow.hash(state);
        self.agent.hash(state);
        self.workspace.hash(state);
    }
}

/// Builds a fresh agent handle. May perform expensive workspace setup.
pub trait AgentFactory: Send + Sync + 'static {
    fn create(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>>;
}

/// Hands out agent handles to the engine. Acquisition must be idempotent per key.
pub trait AgentProvider: Send + Sync + 'static {
    fn acquire(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>>;
}

/// Owner of the shared output artifacts of a run.
pub trait OutputSource: Send + Sync + 'static {
    /// Produce the final textual output for the run rooted at `workspace`.
    fn snapshot(&self, workflow: &str, workspace: &Path) -> BoxFuture<'_, Result<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = AgentKey::new("review", "client", AgentKind::Ask, "/tmp/ws");
        assert_eq!(key.cache_key(), "review:client:/tmp/ws");
    }

    #[test]
    fn test_identity_ignores_kind() {
        use std::collections::HashSet;

        let coder = AgentKey::new("review", "client", AgentKind::Coder, "/tmp/ws");
        let ask = AgentKey::new("review", "client", AgentKind::Ask, "/tmp/ws");
        assert_eq!(coder, ask);
        assert_eq!(coder.cache_key(), ask.cache_key());

        let keys: HashSet<_> = [coder.clone(), ask].into_iter().collect();
        assert_eq!(keys.len(), 1);

        let other_ws = AgentKey::new("review", "client", AgentKind::Coder, "/tmp/other");
        assert_ne!(coder, other_ws);
    }
}
