//! Workflow graph engine.
//!
//! A workflow is a set of states, each bound to one agent, joined by
//! conditional transitions. `WorkflowEngine` runs one state at a time:
//! render the prompt, call the agent, parse the decision record, then take
//! the first transition whose condition holds. The run stops at the terminal
//! state, on an exit condition, or when a bound is hit.

pub mod executor;
pub mod prompt;
pub mod result;
pub mod spec;
pub mod state;

pub use executor::{WorkflowEngine, DEFAULT_CEILING_MULTIPLIER};
pub use prompt::{render_prompt, COLLABORATION_GUIDE};
pub use result::{WorkflowContext, WorkflowResult};
pub use spec::{
    is_terminal_marker, AgentSlot, ExitConditionDef, SpecSummary, StateDef, Target,
    TransitionDef, WorkflowLoader, WorkflowSpec, DEFAULT_MAX_TURNS,
};
pub use state::{AgentResponseRecord, EdgeKey, HistoryEntry, RunError, RunState};
