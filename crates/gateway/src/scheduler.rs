use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use coderunner_core::CodeExecutor;

use crate::cache::ResultCache;
use crate::queue::ExecutionQueue;

/// One [`ExecutionQueue`] per caller key, created on demand.
/// - Jobs from the same caller run strictly in order, one at a time.
/// - Different callers never wait on each other.
/// - All queues share one executor and one result cache.
pub struct QueueRegistry {
    queues: DashMap<String, Arc<ExecutionQueue>>,
    executor: Arc<dyn CodeExecutor>,
    cache: Arc<ResultCache>,
}

impl QueueRegistry {
    pub fn new(executor: Arc<dyn CodeExecutor>, cache: Arc<ResultCache>) -> Self {
        Self {
            queues: DashMap::new(),
            executor,
            cache,
        }
    }

    /// The caller's queue, created if missing.
    pub fn get_or_create(&self, client_id: &str) -> Arc<ExecutionQueue> {
        self.queues
            .entry(client_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(client_id = %client_id, "Creating execution queue");
                Arc::new(ExecutionQueue::new(self.executor.clone(), self.cache.clone()))
            })
            .clone()
    }

    /// The caller's queue, if one exists.
    pub fn get(&self, client_id: &str) -> Option<Arc<ExecutionQueue>> {
        self.queues.get(client_id).map(|q| q.clone())
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Drop queues with no work that have been idle for at least `max_idle`
    /// and are not referenced by an in-progress request.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, queue| {
            Arc::strong_count(queue) > 1 || queue.idle_for().map_or(true, |idle| idle < max_idle)
        });
        let pruned = before.saturating_sub(self.queues.len());
        if pruned > 0 {
            tracing::debug!(pruned, remaining = self.queues.len(), "Pruned idle queues");
        }
        pruned
    }
}
