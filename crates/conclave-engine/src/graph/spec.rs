//! Workflow definitions loaded from YAML.
//!
//! ```yaml
//! name: code_review
//! description: "Author writes, reviewer approves"
//! max_turns: 8
//! agents:
//!   - name: author
//!     type: coder
//!   - name: reviewer
//!     type: ask
//! states:
//!   - name: write
//!     agent: author
//!     start: true
//!     prompt: "{{initial_message}}"
//!     transitions:
//!       - to: review
//!   - name: review
//!     agent: reviewer
//!     prompt: "Review this:\n{{last_agent_content}}"
//!     transitions:
//!       - condition: "approved"
//!         to: END
//!       - condition: "turn_count_reviewer_write < 3"
//!         to: write
//! exit_conditions:
//!   - condition: "error_occurred"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::AgentKind;

/// Default turn budget when a workflow omits `max_turns`.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    State(String),
    Terminal,
}

impl Target {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Target::Terminal)
    }

    pub fn state(&self) -> Option<&str> {
        match self {
            Target::State(name) => Some(name),
            Target::Terminal => None,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::State(name) => f.write_str(name),
            Target::Terminal => f.write_str("END"),
        }
    }
}

/// `END` / `terminal`, any case.
pub fn is_terminal_marker(name: &str) -> bool {
    let name = name.trim();
    name.eq_ignore_ascii_case("end") || name.eq_ignore_ascii_case("terminal")
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSlot {
    pub name: String,
    pub kind: AgentKind,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionDef {
    pub condition: String,
    pub target: Target,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateDef {
    pub name: String,
    pub agent: String,
    pub prompt: String,
    pub is_start: bool,
    pub transitions: Vec<TransitionDef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitConditionDef {
    pub condition: String,
}

/// A validated, immutable workflow definition.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub description: Option<String>,
    pub agents: Vec<AgentSlot>,
    pub states: Vec<StateDef>,
    pub exit_conditions: Vec<ExitConditionDef>,
    pub max_turns: usize,
    pub initial_message: Option<String>,
}

/// Counts reported by `conclave validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecSummary {
    pub name: String,
    pub agents: usize,
    pub states: usize,
    pub transitions: usize,
    pub exit_conditions: usize,
    pub max_turns: usize,
    pub start_state: String,
}

// On-disk shape. Everything optional so missing keys become validation
// errors with useful messages rather than serde errors.

#[derive(Debug, Deserialize)]
struct RawSpec {
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    agents: Option<Vec<RawAgent>>,
    states: Option<Vec<RawState>>,
    #[serde(default)]
    exit_conditions: Vec<RawExit>,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    initial_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    name: Option<String>,
    agent: Option<String>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    start: bool,
    #[serde(default)]
    transitions: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExit {
    condition: String,
}

fn config_err(msg: impl Into<String>) -> ConclaveError {
    ConclaveError::Config(msg.into())
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(config_err(format!("{} is required", what))),
    }
}

impl WorkflowSpec {
    /// Parse and validate a YAML workflow.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_default(yaml, DEFAULT_MAX_TURNS)
    }

    /// Parse and validate, using `default_max_turns` when the file omits it.
    pub fn from_yaml_with_default(yaml: &str, default_max_turns: usize) -> Result<Self> {
        let raw: RawSpec = serde_yaml::from_str(yaml)
            .map_err(|e| config_err(format!("Failed to parse workflow YAML: {}", e)))?;
        Self::from_raw(raw, default_max_turns)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_default(path, DEFAULT_MAX_TURNS)
    }

    pub fn from_file_with_default(path: &Path, default_max_turns: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConclaveError::ConfigNotFound(path.display().to_string()))?;
        Self::from_yaml_with_default(&content, default_max_turns).map_err(|e| match e {
            ConclaveError::Config(msg) => config_err(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    fn from_raw(raw: RawSpec, default_max_turns: usize) -> Result<Self> {
        let name = required(raw.name, "workflow 'name'")?;

        let raw_agents = raw
            .agents
            .ok_or_else(|| config_err("workflow 'agents' is required"))?;
        if raw_agents.is_empty() {
            return Err(config_err("workflow must declare at least one agent"));
        }
        let raw_states = raw
            .states
            .ok_or_else(|| config_err("workflow 'states' is required"))?;
        if raw_states.is_empty() {
            return Err(config_err("workflow must declare at least one state"));
        }

        let mut agents = Vec::with_capacity(raw_agents.len());
        for (i, a) in raw_agents.into_iter().enumerate() {
            let agent_name = required(a.name, &format!("agents[{}].name", i))?;
            let kind = match a.kind.as_deref() {
                None => AgentKind::default(),
                Some(k) => k
                    .parse::<AgentKind>()
                    .map_err(|e| config_err(format!("agent '{}': {}", agent_name, e)))?,
            };
            agents.push(AgentSlot {
                name: agent_name,
                kind,
                role: a.role,
            });
        }

        let mut states = Vec::with_capacity(raw_states.len());
        for (i, s) in raw_states.into_iter().enumerate() {
            let state_name = required(s.name, &format!("states[{}].name", i))?;
            let agent = required(s.agent, &format!("state '{}' agent", state_name))?;
            let transitions = s
                .transitions
                .into_iter()
                .map(|t| TransitionDef {
                    condition: t
                        .condition
                        .filter(|c| !c.trim().is_empty())
                        .unwrap_or_else(|| "true".to_string()),
                    target: match t.to {
                        Some(to) if !is_terminal_marker(&to) => Target::State(to.trim().to_string()),
                        _ => Target::Terminal,
                    },
                })
                .collect();
            states.push(StateDef {
                name: state_name,
                agent,
                prompt: s.prompt,
                is_start: s.start,
                transitions,
            });
        }

        let max_turns = raw.max_turns.unwrap_or(default_max_turns);

        let spec = WorkflowSpec {
            name,
            description: raw.description,
            agents,
            states,
            exit_conditions: raw
                .exit_conditions
                .into_iter()
                .map(|e| ExitConditionDef {
                    condition: e.condition,
                })
                .collect(),
            max_turns,
            initial_message: raw.initial_message,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks. Run on load; also usable on hand-built specs.
    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(config_err("max_turns must be at least 1"));
        }
        if self.agents.is_empty() {
            return Err(config_err("workflow must declare at least one agent"));
        }
        if self.states.is_empty() {
            return Err(config_err("workflow must declare at least one state"));
        }

        let mut agent_names = HashSet::new();
        for agent in &self.agents {
            if !agent_names.insert(agent.name.as_str()) {
                return Err(config_err(format!("duplicate agent '{}'", agent.name)));
            }
        }

        let mut state_names = HashSet::new();
        for state in &self.states {
            if is_terminal_marker(&state.name) {
                return Err(config_err(format!(
                    "state name '{}' is reserved for the terminal state",
                    state.name
                )));
            }
            if !state_names.insert(state.name.as_str()) {
                return Err(config_err(format!("duplicate state '{}'", state.name)));
            }
            if !agent_names.contains(state.agent.as_str()) {
                return Err(config_err(format!(
                    "state '{}' uses undeclared agent '{}'",
                    state.name, state.agent
                )));
            }
        }

        let starts: Vec<&str> = self
            .states
            .iter()
            .filter(|s| s.is_start)
            .map(|s| s.name.as_str())
            .collect();
        if starts.len() > 1 {
            return Err(config_err(format!(
                "more than one start state: {}",
                starts.join(", ")
            )));
        }

        for state in &self.states {
            for t in &state.transitions {
                if let Target::State(target) = &t.target {
                    if !state_names.contains(target.as_str()) {
                        return Err(config_err(format!(
                            "state '{}' transitions to unknown state '{}'",
                            state.name, target
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// The flagged start state, or the first declared one.
    pub fn start_state(&self) -> &StateDef {
        self.states
            .iter()
            .find(|s| s.is_start)
            .unwrap_or(&self.states[0])
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSlot> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Every condition string in the workflow, with where it appears.
    pub fn conditions(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        for state in &self.states {
            for (i, t) in state.transitions.iter().enumerate() {
                out.push((
                    format!("states.{}.transitions[{}]", state.name, i),
                    t.condition.as_str(),
                ));
            }
        }
        for (i, e) in self.exit_conditions.iter().enumerate() {
            out.push((format!("exit_conditions[{}]", i), e.condition.as_str()));
        }
        out
    }

    /// Message used when the caller supplies none.
    pub fn default_initial_message(&self) -> String {
        self.initial_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Start {} workflow", self.name))
    }

    pub fn summary(&self) -> SpecSummary {
        SpecSummary {
            name: self.name.clone(),
            agents: self.agents.len(),
            states: self.states.len(),
            transitions: self.states.iter().map(|s| s.transitions.len()).sum(),
            exit_conditions: self.exit_conditions.len(),
            max_turns: self.max_turns,
            start_state: self.start_state().name.clone(),
        }
    }
}

/// Finds workflow files by name under a directory.
#[derive(Debug, Clone)]
pub struct WorkflowLoader {
    dir: PathBuf,
    default_max_turns: usize,
}

impl WorkflowLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_default_max_turns(mut self, max_turns: usize) -> Self {
        self.default_max_turns = max_turns;
        self
    }

    /// Candidate paths, in lookup order.
    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        vec![
            self.dir.join(name).join("workflow.yaml"),
            self.dir.join(name).join("workflow.yml"),
            self.dir.join(format!("{}.yaml", name)),
            self.dir.join(format!("{}.yml", name)),
        ]
    }

    /// Locate the file for `name` without loading it.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.candidates(name).into_iter().find(|p| p.is_file())
    }

    /// Load by workflow name, or by path if `name_or_path` is an existing file.
    pub fn find(&self, name_or_path: &str) -> Result<WorkflowSpec> {
        let as_path = Path::new(name_or_path);
        if as_path.is_file() {
            return WorkflowSpec::from_file_with_default(as_path, self.default_max_turns);
        }
        match self.locate(name_or_path) {
            Some(path) => WorkflowSpec::from_file_with_default(&path, self.default_max_turns),
            None => Err(ConclaveError::ConfigNotFound(format!(
                "workflow '{}' (searched {})",
                name_or_path,
                self.dir.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REVIEW: &str = r#"
name: code_review
description: "Author writes, reviewer approves"
max_turns: 8
agents:
  - name: author
    type: coder
    role: "Implements the change"
  - name: reviewer
    type: Ask
states:
  - name: write
    agent: author
    prompt: "{{initial_message}}"
    transitions:
      - to: review
  - name: review
    agent: reviewer
    start: true
    prompt: "Review: {{last_agent_content}}"
    transitions:
      - condition: "approved"
        to: END
      - condition: "turn_count_reviewer_write < 3"
        to: write
exit_conditions:
  - condition: "error_occurred"
"#;

    #[test]
    fn test_parse_full_workflow() {
        let spec = WorkflowSpec::from_yaml(REVIEW).unwrap();
        assert_eq!(spec.name, "code_review");
        assert_eq!(spec.max_turns, 8);
        assert_eq!(spec.agents[1].kind, AgentKind::Ask);
        assert_eq!(spec.agents[0].role.as_deref(), Some("Implements the change"));
        assert_eq!(spec.start_state().name, "review");

        let write = spec.state("write").unwrap();
        assert_eq!(write.transitions[0].condition, "true");
        assert_eq!(write.transitions[0].target, Target::State("review".into()));

        let review = spec.state("review").unwrap();
        assert!(review.transitions[0].target.is_terminal());
        assert_eq!(spec.exit_conditions[0].condition, "error_occurred");
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
name: solo
agents:
  - name: helper
states:
  - name: only
    agent: helper
    transitions:
      - condition: "done"
"#;
        let spec = WorkflowSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(spec.agents[0].kind, AgentKind::Coder);
        assert_eq!(spec.start_state().name, "only");
        assert!(spec.states[0].transitions[0].target.is_terminal());
        assert_eq!(spec.default_initial_message(), "Start solo workflow");

        let spec = WorkflowSpec::from_yaml_with_default(yaml, 4).unwrap();
        assert_eq!(spec.max_turns, 4);
    }

    #[test]
    fn test_terminal_marker_spellings() {
        assert!(is_terminal_marker("END"));
        assert!(is_terminal_marker("end"));
        assert!(is_terminal_marker(" Terminal "));
        assert!(!is_terminal_marker("ending"));
    }

    fn expect_config_error(yaml: &str, needle: &str) {
        match WorkflowSpec::from_yaml(yaml) {
            Err(ConclaveError::Config(msg)) => {
                assert!(msg.contains(needle), "'{}' does not mention '{}'", msg, needle)
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_fields() {
        expect_config_error("agents: []\nstates: []", "'name'");
        expect_config_error("name: x\nstates: []", "'agents'");
        expect_config_error("name: x\nagents: [{name: a}]", "'states'");
        expect_config_error("name: x\nagents: []\nstates: [{name: s, agent: a}]", "at least one agent");
        expect_config_error("name: x\nagents: [{type: coder}]\nstates: [{name: s, agent: a}]", "agents[0].name");
        expect_config_error("name: x\nagents: [{name: a}]\nstates: [{agent: a}]", "states[0].name");
        expect_config_error("name: x\nagents: [{name: a}]\nstates: [{name: s}]", "state 's' agent");
    }

    #[test]
    fn test_semantic_validation() {
        expect_config_error(
            "name: x\nagents: [{name: a, type: reviewer}]\nstates: [{name: s, agent: a}]",
            "unknown agent type",
        );
        expect_config_error(
            "name: x\nagents: [{name: a}]\nstates: [{name: s, agent: b}]",
            "undeclared agent 'b'",
        );
        expect_config_error(
            "name: x\nagents: [{name: a}]\nstates: [{name: s, agent: a, start: true}, {name: t, agent: a, start: true}]",
            "more than one start state",
        );
        expect_config_error(
            "name: x\nagents: [{name: a}, {name: a}]\nstates: [{name: s, agent: a}]",
            "duplicate agent",
        );
        expect_config_error(
            "name: x\nagents: [{name: a}]\nstates: [{name: s, agent: a, transitions: [{to: nowhere}]}]",
            "unknown state 'nowhere'",
        );
        expect_config_error(
            "name: x\nagents: [{name: a}]\nstates: [{name: End, agent: a}]",
            "reserved",
        );
    }

    #[test]
    fn test_conditions_and_summary() {
        let spec = WorkflowSpec::from_yaml(REVIEW).unwrap();
        let conditions = spec.conditions();
        assert_eq!(conditions.len(), 4);
        assert_eq!(conditions[3].0, "exit_conditions[0]");

        let summary = spec.summary();
        assert_eq!(summary.states, 2);
        assert_eq!(summary.transitions, 3);
        assert_eq!(summary.start_state, "review");
    }

    #[test]
    fn test_loader_finds_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code_review.yml"), REVIEW).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested").join("workflow.yaml"),
            REVIEW.replace("name: code_review", "name: nested"),
        )
        .unwrap();

        let loader = WorkflowLoader::new(dir.path());
        assert_eq!(loader.find("code_review").unwrap().name, "code_review");
        assert_eq!(loader.find("nested").unwrap().name, "nested");

        let path = dir.path().join("code_review.yml");
        assert_eq!(
            loader.find(path.to_str().unwrap()).unwrap().name,
            "code_review"
        );

        assert!(matches!(
            loader.find("missing"),
            Err(ConclaveError::ConfigNotFound(_))
        ));
    }
}
