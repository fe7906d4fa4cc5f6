//! Scripted agents and workflow fixtures shared by Conclave tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::{Agent, AgentFactory, AgentKey};

pub mod fixtures;

/// Shared log of `(agent, prompt)` pairs in call order.
pub type PromptLog = Arc<Mutex<Vec<(String, String)>>>;

/// Agent that replays queued replies and fails once they run out.
pub struct ScriptedAgent {
    name: String,
    replies: Mutex<VecDeque<String>>,
    prompts: PromptLog,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_prompt_log(mut self, prompts: PromptLog) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.prompts
                .lock()
                .unwrap()
                .push((self.name.clone(), prompt));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ConclaveError::agent(&self.name, "script exhausted"))
        })
    }
}

/// Agent whose every call fails with an invocation error.
pub struct FailingAgent {
    name: String,
    message: String,
}

impl FailingAgent {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Err(ConclaveError::agent(&self.name, &self.message)) })
    }
}

/// Agent that sleeps before replying. Pair with timeouts and cancellation.
pub struct SlowAgent {
    name: String,
    delay: Duration,
    reply: String,
}

impl SlowAgent {
    pub fn new(name: impl Into<String>, delay: Duration, reply: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay,
            reply: reply.into(),
        }
    }
}

impl Agent for SlowAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        })
    }
}

/// Agent that fails a fixed number of times, then keeps replying.
pub struct FlakyAgent {
    name: String,
    failures: usize,
    reply: String,
    calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(name: impl Into<String>, failures: usize, reply: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failures,
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Agent for FlakyAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ConclaveError::agent(&self.name, format!("transient failure {}", call + 1)))
            } else {
                Ok(self.reply.clone())
            }
        })
    }
}

/// Factory handing out scripted or prebuilt agents by agent name.
///
/// A script is consumed by the first `create` for that name; prebuilt
/// agents can be created any number of times.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, Vec<String>>>,
    agents: HashMap<String, Arc<dyn Agent>>,
    prompts: PromptLog,
    created: AtomicUsize,
    create_delay: Option<Duration>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        agent: impl Into<String>,
        replies: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.into(), replies.into_iter().map(Into::into).collect());
        self
    }

    pub fn agent(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(name.into(), agent);
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Prompts received by scripted agents, in call order.
    pub fn prompts(&self) -> PromptLog {
        self.prompts.clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl AgentFactory for ScriptedFactory {
    fn create(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>> {
        let name = key.agent.clone();
        Box::pin(async move {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            let agent: Arc<dyn Agent> = if let Some(agent) = self.agents.get(&name) {
                agent.clone()
            } else {
                let replies = self
                    .scripts
                    .lock()
                    .unwrap()
                    .remove(&name)
                    .ok_or_else(|| ConclaveError::agent(&name, "no script"))?;
                Arc::new(ScriptedAgent::new(&name, replies).with_prompt_log(self.prompts.clone()))
            };
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(agent)
        })
    }
}
