pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ConclaveError, Result};
pub use event::EventBus;
pub use traits::{Agent, AgentFactory, AgentKey, AgentProvider, OutputSource};
pub use types::*;
