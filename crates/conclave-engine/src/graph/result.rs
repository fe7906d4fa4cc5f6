use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::Serialize;

use conclave_core::types::{DecisionValue, RunId};

use super::state::{AgentResponseRecord, HistoryEntry, RunState};

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_name: String,
    pub initial_message: String,
    /// Root under which agents get their working directories.
    pub workspace: PathBuf,
    /// Run-scoped variables visible to conditions (lowest priority).
    pub variables: BTreeMap<String, DecisionValue>,
}

impl WorkflowContext {
    pub fn new(
        workflow_name: impl Into<String>,
        initial_message: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            initial_message: initial_message.into(),
            workspace: workspace.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<DecisionValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Outcome of one run. Built once the step loop has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub workflow_name: String,
    pub success: bool,
    pub final_output: String,
    pub total_turns: usize,
    pub agents_used: BTreeSet<String>,
    pub execution_history: Vec<HistoryEntry>,
    pub agent_responses: Vec<AgentResponseRecord>,
    /// Per-edge counters, keyed `turn_count_<agent>_<state>`.
    pub edge_turns: BTreeMap<String, usize>,
    pub error_message: Option<String>,
    pub error_state: Option<String>,
    pub elapsed_ms: u64,
}

impl WorkflowResult {
    pub(crate) fn from_state(state: RunState, final_output: String) -> Self {
        let elapsed_ms = (chrono::Utc::now() - state.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let agents_used = state.agents_used();
        let edge_turns = state.edge_turns_by_name();
        let (error_message, error_state) = match state.error {
            Some(e) => (Some(e.message), e.state),
            None => (None, None),
        };
        Self {
            run_id: state.run_id,
            workflow_name: state.workflow_name,
            success: error_message.is_none(),
            final_output,
            total_turns: state.total_turns,
            agents_used,
            execution_history: state.history,
            agent_responses: state.responses,
            edge_turns,
            error_message,
            error_state,
            elapsed_ms,
        }
    }

    /// States visited, in order.
    pub fn path(&self) -> Vec<&str> {
        self.execution_history
            .iter()
            .map(|h| h.state.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::types::ParsedAgentResponse;

    use crate::graph::spec::WorkflowSpec;

    #[test]
    fn test_from_state() {
        let spec = WorkflowSpec::from_yaml(
            "name: w\nagents: [{name: a}, {name: b}]\nstates: [{name: s, agent: a}, {name: t, agent: b}]",
        )
        .unwrap();
        let mut state = RunState::new(RunId::new(), &spec, "go", BTreeMap::new());
        state.record_step("s", "a", ParsedAgentResponse::default());
        state.record_step("t", "b", ParsedAgentResponse::default());
        state.record_step("s", "a", ParsedAgentResponse::default());

        let result = WorkflowResult::from_state(state, "out".into());
        assert!(result.success);
        assert_eq!(result.total_turns, 3);
        assert_eq!(result.agents_used.len(), 2);
        assert_eq!(result.path(), vec!["s", "t", "s"]);
        assert_eq!(result.final_output, "out");
    }

    #[test]
    fn test_error_makes_unsuccessful() {
        let spec = WorkflowSpec::from_yaml(
            "name: w\nagents: [{name: a}]\nstates: [{name: s, agent: a}]",
        )
        .unwrap();
        let mut state = RunState::new(RunId::new(), &spec, "go", BTreeMap::new());
        state.fail("boom", Some("s"));

        let result = WorkflowResult::from_state(state, String::new());
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert_eq!(result.error_state.as_deref(), Some("s"));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_context_builder() {
        let ctx = WorkflowContext::new("w", "hi", "/tmp/ws").with_variable("strict", true);
        assert_eq!(ctx.variables["strict"], DecisionValue::Bool(true));
    }
}
