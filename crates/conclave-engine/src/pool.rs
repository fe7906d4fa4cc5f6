use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use conclave_core::error::Result;
use conclave_core::traits::{Agent, AgentFactory, AgentKey, AgentProvider};

type Slot = Arc<OnceCell<Arc<dyn Agent>>>;

/// Acquire-or-create cache of agent handles, one per (workflow, agent, workspace).
///
/// Each key owns a `OnceCell`, so concurrent acquisitions of the same key
/// wait on a single creation. A failed creation leaves the cell empty and the
/// next caller retries.
pub struct AgentPool {
    factory: Arc<dyn AgentFactory>,
    slots: Mutex<HashMap<AgentKey, Slot>>,
}

/// Snapshot of pool contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub by_workflow: BTreeMap<String, usize>,
    pub keys: Vec<String>,
}

impl AgentPool {
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &AgentKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Get the cached handle for `key`, creating it on first use.
    pub async fn get_or_create(&self, key: &AgentKey) -> Result<Arc<dyn Agent>> {
        let slot = self.slot(key);
        if let Some(agent) = slot.get() {
            debug!(key = %key.cache_key(), "Reusing pooled agent");
            return Ok(agent.clone());
        }

        let agent = slot
            .get_or_try_init(|| async {
                info!(
                    workflow = %key.workflow,
                    agent = %key.agent,
                    kind = %key.kind,
                    "Creating agent"
                );
                self.factory.create(key).await
            })
            .await?;
        Ok(agent.clone())
    }

    /// Drop every handle belonging to `workflow`. Returns how many were removed.
    pub fn evict_workflow(&self, workflow: &str) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|k, _| k.workflow != workflow);
        let removed = before - slots.len();
        if removed > 0 {
            info!(workflow, removed, "Evicted pooled agents");
        }
        removed
    }

    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Only initialised handles count.
    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = PoolStats::default();
        for (key, slot) in slots.iter() {
            if slot.initialized() {
                stats.total += 1;
                *stats.by_workflow.entry(key.workflow.clone()).or_insert(0) += 1;
                stats.keys.push(key.cache_key());
            }
        }
        stats.keys.sort();
        stats
    }
}

impl AgentProvider for AgentPool {
    fn acquire(&self, key: &AgentKey) -> BoxFuture<'_, Result<Arc<dyn Agent>>> {
        let key = key.clone();
        Box::pin(async move { self.get_or_create(&key).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conclave_core::types::AgentKind;
    use conclave_test_utils::{FailingAgent, ScriptedFactory};

    fn key(workflow: &str, agent: &str) -> AgentKey {
        AgentKey::new(workflow, agent, AgentKind::Coder, "/tmp/ws")
    }

    #[tokio::test]
    async fn test_reuses_handles() {
        let factory = Arc::new(ScriptedFactory::new().script("a", vec!["x"]));
        let pool = AgentPool::new(factory.clone());

        let first = pool.get_or_create(&key("w", "a")).await.unwrap();
        let second = pool.get_or_create(&key("w", "a")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_kind_does_not_split_the_cache() {
        let factory = Arc::new(ScriptedFactory::new().script("a", vec!["x"]));
        let pool = AgentPool::new(factory.clone());

        let coder = pool.get_or_create(&key("w", "a")).await.unwrap();
        let ask = AgentKey::new("w", "a", AgentKind::Ask, "/tmp/ws");
        let asked = pool.get_or_create(&ask).await.unwrap();
        assert!(Arc::ptr_eq(&coder, &asked));
        assert_eq!(factory.created_count(), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_once() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .script("a", vec!["x"])
                .with_create_delay(Duration::from_millis(30)),
        );
        let pool = Arc::new(AgentPool::new(factory.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire(&key("w", "a")).await.map(|_| ()) })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let factory = Arc::new(ScriptedFactory::new());
        let pool = AgentPool::new(factory.clone());
        assert!(pool.get_or_create(&key("w", "ghost")).await.is_err());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_stats_and_eviction() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .agent("a", Arc::new(FailingAgent::new("a", "unused")))
                .agent("b", Arc::new(FailingAgent::new("b", "unused"))),
        );
        let pool = AgentPool::new(factory);
        pool.get_or_create(&key("review", "a")).await.unwrap();
        pool.get_or_create(&key("review", "b")).await.unwrap();
        pool.get_or_create(&key("deploy", "a")).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_workflow["review"], 2);
        assert_eq!(stats.keys[0], "deploy:a:/tmp/ws");

        assert_eq!(pool.evict_workflow("review"), 2);
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.evict_workflow("review"), 0);

        pool.clear();
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
