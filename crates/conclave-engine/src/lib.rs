pub mod condition;
pub mod extensions;
pub mod graph;
pub mod middleware;
pub mod output;
pub mod pool;
pub mod response;
pub mod run_log;
pub mod session;

pub use condition::{ConditionError, ConditionEvaluator, ConditionExtension, PredicateTable, Scope, VariableSource};
pub use extensions::ExtensionRegistry;
pub use graph::{WorkflowContext, WorkflowEngine, WorkflowLoader, WorkflowResult, WorkflowSpec};
pub use middleware::{LayeredFactory, RetryingAgent, TracedAgent};
pub use output::CollabSnapshot;
pub use pool::{AgentPool, PoolStats};
pub use response::{parse_lenient, parse_strict, ResponseError};
pub use run_log::RunLogger;
pub use session::Session;
