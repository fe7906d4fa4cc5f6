use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use conclave_core::config::AppConfig;
use conclave_core::error::Result;
use conclave_core::event::EventBus;
use conclave_core::traits::{AgentProvider, OutputSource};

use crate::extensions::ExtensionRegistry;
use crate::graph::{WorkflowContext, WorkflowEngine, WorkflowResult, WorkflowSpec};
use crate::graph::DEFAULT_CEILING_MULTIPLIER;
use crate::output::CollabSnapshot;

/// Everything a run needs besides the workflow itself.
///
/// A session owns its agent provider, event bus and extension table, so two
/// sessions never share cached agents or events.
pub struct Session {
    agents: Arc<dyn AgentProvider>,
    workspace_root: PathBuf,
    extensions: ExtensionRegistry,
    event_bus: Arc<EventBus>,
    output: Option<Arc<dyn OutputSource>>,
    agent_timeout: Option<Duration>,
    ceiling_multiplier: usize,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(agents: Arc<dyn AgentProvider>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            agents,
            workspace_root: workspace_root.into(),
            extensions: ExtensionRegistry::new(),
            event_bus: Arc::new(EventBus::default()),
            output: None,
            agent_timeout: None,
            ceiling_multiplier: DEFAULT_CEILING_MULTIPLIER,
            cancel: CancellationToken::new(),
        }
    }

    /// Session wired from process configuration: workspace root, agent
    /// timeout, step ceiling and a collab-dir output snapshot.
    pub fn from_config(config: &AppConfig, agents: Arc<dyn AgentProvider>) -> Self {
        Self::new(agents, config.workspace_dir())
            .with_agent_timeout(config.agent_timeout())
            .with_ceiling_multiplier(config.engine.step_ceiling_multiplier)
            .with_output_source(Arc::new(CollabSnapshot::new(
                config.workspace.collab_dir.clone(),
            )))
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_output_source(mut self, output: Arc<dyn OutputSource>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_ceiling_multiplier(mut self, multiplier: usize) -> Self {
        self.ceiling_multiplier = multiplier;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Workspace directory of one workflow.
    pub fn workspace_for(&self, workflow: &str) -> PathBuf {
        self.workspace_root.join(workflow)
    }

    /// Build an engine for `spec` with this session's collaborators.
    pub fn engine(&self, spec: WorkflowSpec) -> Result<WorkflowEngine> {
        let extension = self.extensions.get(&spec.name);
        let mut engine = WorkflowEngine::new(spec, self.agents.clone())?
            .with_agent_timeout(self.agent_timeout)
            .with_ceiling_multiplier(self.ceiling_multiplier)
            .with_cancel_token(self.cancel.clone())
            .with_event_bus(self.event_bus.clone());
        if let Some(ext) = extension {
            engine = engine.with_extension(ext);
        }
        if let Some(output) = &self.output {
            engine = engine.with_output_source(output.clone());
        }
        Ok(engine)
    }

    pub fn context(&self, spec: &WorkflowSpec, initial_message: &str) -> WorkflowContext {
        WorkflowContext::new(&spec.name, initial_message, self.workspace_for(&spec.name))
    }

    /// Run `spec` once. Errors only for an invalid spec; run failures are in
    /// the result.
    pub async fn execute(&self, spec: WorkflowSpec, initial_message: &str) -> Result<WorkflowResult> {
        let ctx = self.context(&spec, initial_message);
        self.execute_with(spec, ctx).await
    }

    pub async fn execute_with(
        &self,
        spec: WorkflowSpec,
        ctx: WorkflowContext,
    ) -> Result<WorkflowResult> {
        let engine = self.engine(spec)?;
        info!(
            workflow = %engine.spec().name,
            workspace = %ctx.workspace.display(),
            "Executing workflow"
        );
        Ok(engine.run(&ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conclave_core::types::WorkflowEvent;
    use conclave_test_utils::{fixtures, ScriptedFactory};

    use crate::condition::PredicateTable;
    use crate::pool::AgentPool;

    fn session(factory: ScriptedFactory) -> Session {
        Session::new(Arc::new(AgentPool::new(Arc::new(factory))), "/tmp/conclave-ws")
    }

    #[tokio::test]
    async fn test_execute() {
        let spec = WorkflowSpec::from_yaml(fixtures::REVIEW_LOOP).unwrap();
        let s = session(
            ScriptedFactory::new()
                .script("coder", vec![r#"{"decisions": {"ready": true}}"#])
                .script("reviewer", vec![r#"{"content": "ok", "decisions": {"approved": true}}"#]),
        );
        let mut rx = s.event_bus().subscribe();

        let result = s.execute(spec, "Add a README").await.unwrap();
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.final_output, "ok");
        assert!(matches!(rx.recv().await.unwrap(), WorkflowEvent::RunStarted { .. }));
    }

    #[tokio::test]
    async fn test_extension_selected_by_workflow() {
        let spec = WorkflowSpec::from_yaml(fixtures::GATED).unwrap();
        let gate = PredicateTable::new().with("gate_open", |_, scope| {
            scope.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) >= 5.0
        });
        let s = session(ScriptedFactory::new().script("worker", vec![r#"{"decisions": {"score": 7}}"#]))
            .with_extensions(ExtensionRegistry::new().register("gated", Arc::new(gate)));

        let result = s.execute(spec, "").await.unwrap();
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.path(), vec!["work"]);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_error() {
        let spec = WorkflowSpec {
            states: vec![],
            ..WorkflowSpec::from_yaml(fixtures::GATED).unwrap()
        };
        let s = session(ScriptedFactory::new());
        assert!(s.execute(spec, "go").await.is_err());
    }

    #[test]
    fn test_workspace_per_workflow() {
        let s = session(ScriptedFactory::new());
        let spec = WorkflowSpec::from_yaml(fixtures::GATED).unwrap();
        let ctx = s.context(&spec, "hi");
        assert_eq!(ctx.workspace, PathBuf::from("/tmp/conclave-ws/gated"));
    }
}
