use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single value in an agent's decision map.
///
/// Agents emit free-form JSON, so values are restricted to the scalar kinds the
/// condition language understands. Coercion rules live here so the evaluator
/// and the prompt renderer agree on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecisionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl DecisionValue {
    /// Convert a JSON value. `null` has no decision meaning and is dropped;
    /// arrays and objects are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            other => Some(Self::Str(other.to_string())),
        }
    }

    /// Best-effort scalar parse of user-supplied text (`--var key=value`).
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Self::Float(f);
        }
        Self::Str(text.to_string())
    }

    /// Numeric coercion used by comparisons. Booleans count as 1/0.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else {
                    s.parse::<f64>().ok()
                }
            }
        }
    }

    /// Boolean coercion for bare identifiers.
    ///
    /// Zero is false; `"true"/"1"/"yes"` are true and `"false"/"0"/"no"` are
    /// false (any case); other non-empty strings are true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => {
                let lowered = s.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "" | "false" | "0" | "no" => false,
                    _ => true,
                }
            }
        }
    }
}

impl fmt::Display for DecisionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for DecisionValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for DecisionValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for DecisionValue {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<usize> for DecisionValue {
    fn from(n: usize) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for DecisionValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for DecisionValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for DecisionValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// An agent's decision map. Ordered so rendering and logging are stable.
pub type Decisions = BTreeMap<String, DecisionValue>;

/// Build a decision map from a JSON object, dropping `null` entries.
pub fn decisions_from_json(obj: &serde_json::Map<String, serde_json::Value>) -> Decisions {
    obj.iter()
        .filter_map(|(k, v)| DecisionValue::from_json(v).map(|dv| (k.clone(), dv)))
        .collect()
}

/// An agent reply split into prose and the structured decision record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedAgentResponse {
    pub content: String,
    pub decisions: Decisions,
}

/// The flavour of coding agent bound to an agent slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Coder,
    Architect,
    Ask,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Coder => "coder",
            AgentKind::Architect => "architect",
            AgentKind::Ask => "ask",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coder" => Ok(AgentKind::Coder),
            "architect" => Ok(AgentKind::Architect),
            "ask" => Ok(AgentKind::Ask),
            other => Err(format!(
                "unknown agent type '{}' (expected coder, architect or ask)",
                other
            )),
        }
    }
}

/// Events emitted while a workflow runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: RunId,
        workflow: String,
    },
    StateEntered {
        run_id: RunId,
        state: String,
        agent: String,
        turn: usize,
    },
    AgentReplied {
        run_id: RunId,
        state: String,
        agent: String,
        decisions: Decisions,
        elapsed_ms: u64,
    },
    Transition {
        run_id: RunId,
        from: String,
        /// `None` when the run moves to the terminal state.
        to: Option<String>,
        condition: Option<String>,
    },
    ExitTriggered {
        run_id: RunId,
        reason: String,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
        total_turns: usize,
        error: Option<String>,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StateEntered { run_id, .. }
            | WorkflowEvent::AgentReplied { run_id, .. }
            | WorkflowEvent::Transition { run_id, .. }
            | WorkflowEvent::ExitTriggered { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. } => run_id,
        }
    }
}
