use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConclaveError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Agent errors
    #[error("Agent invocation failed: {agent}: {message}")]
    AgentInvocation { agent: String, message: String },

    #[error("Agent reply violates the response contract: {agent} in state '{state}': {message}")]
    ResponseContract {
        agent: String,
        state: String,
        message: String,
    },

    // Run bounds
    #[error("Turn budget exhausted ({max_turns} turns) without reaching a terminal state")]
    TurnBudgetExhausted { max_turns: usize },

    #[error("Step ceiling exceeded ({limit} steps)")]
    RecursionBound { limit: usize },

    #[error("Workflow run cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConclaveError {
    /// Shorthand for an agent-call failure.
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        ConclaveError::AgentInvocation {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Whether this error happened while talking to an agent (and may succeed on retry).
    pub fn is_agent_failure(&self) -> bool {
        matches!(self, ConclaveError::AgentInvocation { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let e = ConclaveError::agent("client", "connection refused");
        assert_eq!(
            e.to_string(),
            "Agent invocation failed: client: connection refused"
        );
        assert!(e.is_agent_failure());
    }

    #[test]
    fn test_contract_error_is_not_agent_failure() {
        let e = ConclaveError::ResponseContract {
            agent: "supplier".into(),
            state: "clarify".into(),
            message: "no decisions object".into(),
        };
        assert!(!e.is_agent_failure());
        assert!(e.to_string().contains("clarify"));
    }
}
