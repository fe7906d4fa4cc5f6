//! Agent decorators.
//!
//! A `Layer` wraps an agent handle in another handle. `LayeredFactory` applies
//! its layers to every agent the inner factory creates, so cross-cutting
//! behaviour is configured once at the call site instead of per agent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use conclave_core::config::RetryConfig;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::{Agent, AgentFactory, AgentKey};

pub type Layer = Arc<dyn Fn(Arc<dyn Agent>) -> Arc<dyn Agent> + Send + Sync>;

/// Factory that decorates every created agent. Layers apply in order, so the
/// last one added is outermost.
pub struct LayeredFactory {
    inner: Arc<dyn AgentFactory>,
    layers: Vec<Layer>,
}

impl LayeredFactory {
    pub fn new(inner: Arc<dyn AgentFactory>) -> Self {
        Self {
            inner,
            layers: Vec::new(),
        }
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Retry failed agent calls per `config`. No-op when `max_retries` is 0.
    pub fn with_retry(self, config: RetryConfig) -> Self {
        if config.max_retries == 0 {
            return self;
        }
        self.layer(Arc::new(move |agent| {
            Arc::new(RetryingAgent::new(agent, config.clone())) as Arc<dyn Agent>
        }))
    }

    pub fn with_tracing(self) -> Self {
        self.layer(Arc::new(|agent| Arc::new(TracedAgent::new(agent)) as Arc<dyn Agent>))
    }
}

impl AgentFactory for LayeredFactory {
    fn create(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>> {
        let key = key.clone();
        Box::pin(async move {
            let mut agent = self.inner.create(&key).await?;
            for layer in &self.layers {
                agent = layer(agent);
            }
            Ok(agent)
        })
    }
}

/// Retries agent invocation failures with exponential backoff.
pub struct RetryingAgent {
    inner: Arc<dyn Agent>,
    config: RetryConfig,
}

impl RetryingAgent {
    pub fn new(inner: Arc<dyn Agent>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

/// Only call failures are retried; cancellation and other errors are final.
fn is_retryable(e: &ConclaveError) -> bool {
    e.is_agent_failure()
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Agent for RetryingAgent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let max_retries = self.config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.run(prompt.clone()).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.config);
                        warn!(
                            agent = %self.inner.name(),
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying agent call"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

/// Logs call latency and reply size.
pub struct TracedAgent {
    inner: Arc<dyn Agent>,
}

impl TracedAgent {
    pub fn new(inner: Arc<dyn Agent>) -> Self {
        Self { inner }
    }
}

impl Agent for TracedAgent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let started = Instant::now();
            let prompt_chars = prompt.chars().count();
            let result = self.inner.run(prompt).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(reply) => debug!(
                    agent = %self.inner.name(),
                    prompt_chars,
                    reply_chars = reply.chars().count(),
                    elapsed_ms,
                    "Agent call completed"
                ),
                Err(e) => warn!(
                    agent = %self.inner.name(),
                    elapsed_ms,
                    error = %e,
                    "Agent call failed"
                ),
            }
            result
        })
    }
}
