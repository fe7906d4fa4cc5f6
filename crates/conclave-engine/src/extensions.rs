use std::collections::HashMap;
use std::sync::Arc;

use crate::condition::ConditionExtension;

/// Workflow name to routing extension, supplied when a session is built.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    entries: HashMap<String, Arc<dyn ConditionExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `extension` for `workflow`, replacing any previous one.
    pub fn register(
        mut self,
        workflow: impl Into<String>,
        extension: Arc<dyn ConditionExtension>,
    ) -> Self {
        self.entries.insert(workflow.into(), extension);
        self
    }

    pub fn get(&self, workflow: &str) -> Option<Arc<dyn ConditionExtension>> {
        self.entries.get(workflow).cloned()
    }

    pub fn workflows(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
