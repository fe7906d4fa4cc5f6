use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use conclave_core::types::{DecisionValue, Decisions, ParsedAgentResponse, RunId};

use super::spec::{Target, WorkflowSpec};
use crate::condition::VariableSource;

/// A (source agent, target state) pair with its own turn counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeKey {
    pub from_agent: String,
    pub to_state: String,
}

impl EdgeKey {
    pub fn new(from_agent: impl Into<String>, to_state: impl Into<String>) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_state: to_state.into(),
        }
    }

    /// Name under which conditions see this counter.
    pub fn var_name(&self) -> String {
        format!("turn_count_{}_{}", self.from_agent, self.to_state)
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub state: String,
    pub agent: String,
    pub decisions: Decisions,
    pub total_turns: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponseRecord {
    pub state: String,
    pub agent: String,
    pub response: ParsedAgentResponse,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub message: String,
    /// State being executed when the error happened, if any.
    pub state: Option<String>,
}

/// Mutable state of one run. Owned by the engine for the run's lifetime.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_name: String,
    pub initial_message: String,
    pub max_turns: usize,
    pub total_turns: usize,
    pub edge_turns: HashMap<EdgeKey, usize>,
    pub last_agent: Option<String>,
    pub last_content: String,
    /// Decisions of the most recent reply only; replaced each step.
    pub decisions: Decisions,
    pub history: Vec<HistoryEntry>,
    pub responses: Vec<AgentResponseRecord>,
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub variables: BTreeMap<String, DecisionValue>,
    /// `turn_count_<agent>_<state>` -> edge, for every declared edge.
    edge_vars: HashMap<String, EdgeKey>,
}

impl RunState {
    pub fn new(
        run_id: RunId,
        spec: &WorkflowSpec,
        initial_message: impl Into<String>,
        variables: BTreeMap<String, DecisionValue>,
    ) -> Self {
        let mut edge_vars = HashMap::new();
        for state in &spec.states {
            for t in &state.transitions {
                if let Target::State(target) = &t.target {
                    let key = EdgeKey::new(&state.agent, target);
                    edge_vars.insert(key.var_name(), key);
                }
            }
        }

        Self {
            run_id,
            workflow_name: spec.name.clone(),
            initial_message: initial_message.into(),
            max_turns: spec.max_turns,
            total_turns: 0,
            edge_turns: HashMap::new(),
            last_agent: None,
            last_content: String::new(),
            decisions: Decisions::new(),
            history: Vec::new(),
            responses: Vec::new(),
            error: None,
            started_at: Utc::now(),
            variables,
            edge_vars,
        }
    }

    /// Commit a completed step.
    pub fn record_step(&mut self, state: &str, agent: &str, response: ParsedAgentResponse) {
        self.total_turns += 1;
        self.last_agent = Some(agent.to_string());
        self.last_content = response.content.clone();
        self.decisions = response.decisions.clone();

        self.history.push(HistoryEntry {
            state: state.to_string(),
            agent: agent.to_string(),
            decisions: response.decisions.clone(),
            total_turns: self.total_turns,
        });
        self.responses.push(AgentResponseRecord {
            state: state.to_string(),
            agent: agent.to_string(),
            response,
            timestamp: Utc::now(),
        });
    }

    /// Count a fired non-terminal transition. Returns the new count.
    pub fn record_edge(&mut self, from_agent: &str, to_state: &str) -> usize {
        let count = self
            .edge_turns
            .entry(EdgeKey::new(from_agent, to_state))
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn edge_count(&self, from_agent: &str, to_state: &str) -> usize {
        self.edge_turns
            .get(&EdgeKey::new(from_agent, to_state))
            .copied()
            .unwrap_or(0)
    }

    pub fn fail(&mut self, message: impl Into<String>, state: Option<&str>) {
        self.error = Some(RunError {
            message: message.into(),
            state: state.map(str::to_string),
        });
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Most recent committed response, if any.
    pub fn last_response(&self) -> Option<&AgentResponseRecord> {
        self.responses.last()
    }

    pub fn agents_used(&self) -> BTreeSet<String> {
        self.history.iter().map(|h| h.agent.clone()).collect()
    }

    /// Edge counters keyed by their condition variable name.
    pub fn edge_turns_by_name(&self) -> BTreeMap<String, usize> {
        self.edge_turns
            .iter()
            .map(|(k, v)| (k.var_name(), *v))
            .collect()
    }
}

impl VariableSource for RunState {
    fn lookup(&self, name: &str) -> Option<DecisionValue> {
        match name {
            "total_turns" | "turn_count" => return Some(self.total_turns.into()),
            "max_turns" => return Some(self.max_turns.into()),
            "last_agent" => return self.last_agent.clone().map(DecisionValue::Str),
            "workflow_name" => return Some(self.workflow_name.clone().into()),
            "error" => return self.error.as_ref().map(|e| e.message.clone().into()),
            "error_state" => {
                return self
                    .error
                    .as_ref()
                    .and_then(|e| e.state.clone())
                    .map(DecisionValue::Str)
            }
            _ => {}
        }

        if let Some(key) = self.edge_vars.get(name) {
            return Some(self.edge_turns.get(key).copied().unwrap_or(0).into());
        }
        // Counters for edges taken but not declared (hand-built state)
        if let Some(count) = self
            .edge_turns
            .iter()
            .find(|(k, _)| k.var_name() == name)
            .map(|(_, v)| *v)
        {
            return Some(count.into());
        }

        if let Some(v) = self.decisions.get(name) {
            return Some(v.clone());
        }
        self.variables.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkflowSpec {
        WorkflowSpec::from_yaml(
            r#"
name: loop
max_turns: 6
agents:
  - name: a
  - name: b
states:
  - name: first
    agent: a
    transitions:
      - condition: "go"
        to: second
      - to: END
  - name: second
    agent: b
    transitions:
      - to: first
"#,
        )
        .unwrap()
    }

    fn reply(pairs: &[(&str, DecisionValue)]) -> ParsedAgentResponse {
        ParsedAgentResponse {
            content: "ok".into(),
            decisions: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_fresh_state() {
        let state = RunState::new(RunId::new(), &spec(), "hello", BTreeMap::new());
        assert_eq!(state.total_turns, 0);
        assert_eq!(state.lookup("max_turns"), Some(DecisionValue::Int(6)));
        assert_eq!(state.lookup("turn_count_a_second"), Some(DecisionValue::Int(0)));
        assert_eq!(state.lookup("turn_count_b_first"), Some(DecisionValue::Int(0)));
        assert_eq!(state.lookup("last_agent"), None);
        assert_eq!(state.lookup("error"), None);
        assert_eq!(state.lookup("nope"), None);
    }

    #[test]
    fn test_record_step_replaces_decisions() {
        let mut state = RunState::new(RunId::new(), &spec(), "hello", BTreeMap::new());
        state.record_step("first", "a", reply(&[("go", true.into()), ("x", 1.into())]));
        state.record_step("second", "b", reply(&[("y", 2.into())]));

        assert_eq!(state.total_turns, 2);
        assert_eq!(state.last_agent.as_deref(), Some("b"));
        assert!(state.decisions.get("x").is_none());
        assert_eq!(state.lookup("y"), Some(DecisionValue::Int(2)));
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].total_turns, 1);
        assert_eq!(state.history[0].decisions["go"], DecisionValue::Bool(true));
        assert_eq!(state.responses.len(), 2);
        assert_eq!(
            state.agents_used().into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_edge_counters() {
        let mut state = RunState::new(RunId::new(), &spec(), "hello", BTreeMap::new());
        assert_eq!(state.record_edge("a", "second"), 1);
        assert_eq!(state.record_edge("a", "second"), 2);
        assert_eq!(state.edge_count("a", "second"), 2);
        assert_eq!(state.edge_count("b", "first"), 0);
        assert_eq!(state.lookup("turn_count_a_second"), Some(DecisionValue::Int(2)));
        assert_eq!(state.edge_turns_by_name()["turn_count_a_second"], 2);
    }

    #[test]
    fn test_error_lookup() {
        let mut state = RunState::new(RunId::new(), &spec(), "hello", BTreeMap::new());
        state.fail("agent crashed", Some("first"));
        assert!(state.is_failed());
        assert_eq!(state.lookup("error"), Some(DecisionValue::Str("agent crashed".into())));
        assert_eq!(state.lookup("error_state"), Some(DecisionValue::Str("first".into())));
    }

    #[test]
    fn test_variables_have_lowest_priority() {
        let mut vars = BTreeMap::new();
        vars.insert("priority".to_string(), DecisionValue::from("low"));
        vars.insert("total_turns".to_string(), DecisionValue::from(99));
        let mut state = RunState::new(RunId::new(), &spec(), "hello", vars);
        assert_eq!(state.lookup("priority"), Some(DecisionValue::Str("low".into())));
        assert_eq!(state.lookup("total_turns"), Some(DecisionValue::Int(0)));

        state.record_step("first", "a", reply(&[("priority", "high".into())]));
        assert_eq!(state.lookup("priority"), Some(DecisionValue::Str("high".into())));
    }
}
