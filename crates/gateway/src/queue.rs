//! Per-caller execution queue.
//!
//! Strict FIFO with a single job in flight. Jobs run through the shared
//! [`ResultCache`], so a queued request identical to one already stored (or
//! running anywhere else) does not execute twice. Cancellation resolves the
//! running job immediately and discards everything still waiting.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

use coderunner_core::{CodeExecutor, Error, ExecutionRequest, ExecutionResult, Result};

use crate::cache::ResultCache;

type Responder = oneshot::Sender<Result<ExecutionResult>>;

struct QueuedJob {
    request: ExecutionRequest,
    responder: Responder,
}

struct ActiveJob {
    request_id: String,
    started: Instant,
    /// Taken by whoever answers first: the runner or `cancel`.
    responder: Option<Responder>,
    abort: Option<oneshot::Sender<()>>,
}

struct QueueState {
    pending: VecDeque<QueuedJob>,
    active: Option<ActiveJob>,
    last_activity: Instant,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    executor: Arc<dyn CodeExecutor>,
    cache: Arc<ResultCache>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of [`ExecutionQueue::cancel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSummary {
    /// Whether a running job was resolved as cancelled.
    pub running_cancelled: bool,
    /// Waiting jobs that were dropped.
    pub discarded: usize,
}

/// Snapshot of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub running: bool,
}

/// FIFO queue with one job in flight, served by a background task.
pub struct ExecutionQueue {
    shared: Arc<Shared>,
}

impl ExecutionQueue {
    /// Create a queue and spawn its runner on the current runtime.
    pub fn new(executor: Arc<dyn CodeExecutor>, cache: Arc<ResultCache>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
                last_activity: Instant::now(),
                closed: false,
            }),
            notify: Notify::new(),
            executor,
            cache,
        });
        tokio::spawn(run(shared.clone()));
        Self { shared }
    }

    /// Enqueue a request and wait for its result.
    ///
    /// A stored result is returned at once without taking a place in the
    /// queue, unless the request skips the cache.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        if !request.skip_cache {
            if let Some(hit) = self.shared.cache.peek(&request.cache_key(), &request.id) {
                return Ok(hit);
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(Error::internal("execution queue is closed"));
            }
            tracing::debug!(
                request_id = %request.id,
                position = state.pending.len() + usize::from(state.active.is_some()),
                "Job queued"
            );
            state.pending.push_back(QueuedJob {
                request,
                responder: tx,
            });
            state.last_activity = Instant::now();
        }
        self.shared.notify.notify_one();

        rx.await
            .map_err(|_| Error::internal("execution queue dropped the job"))?
    }

    /// Cancel the running job and discard every waiting one.
    ///
    /// All affected callers receive a result with `cancelled = true`.
    pub fn cancel(&self) -> CancelSummary {
        let (discarded, running_cancelled) = {
            let mut state = self.shared.lock();
            state.last_activity = Instant::now();
            let discarded: Vec<QueuedJob> = state.pending.drain(..).collect();

            let mut running_cancelled = false;
            if let Some(active) = state.active.as_mut() {
                if let Some(responder) = active.responder.take() {
                    let elapsed = active.started.elapsed().as_millis() as u64;
                    let _ = responder.send(Ok(ExecutionResult::cancelled(&active.request_id, elapsed)));
                    running_cancelled = true;
                }
                if let Some(abort) = active.abort.take() {
                    let _ = abort.send(());
                }
            }
            (discarded, running_cancelled)
        };

        let summary = CancelSummary {
            running_cancelled,
            discarded: discarded.len(),
        };
        for job in discarded {
            let _ = job
                .responder
                .send(Ok(ExecutionResult::cancelled(&job.request.id, 0)));
        }

        tracing::info!(
            running_cancelled = summary.running_cancelled,
            discarded = summary.discarded,
            "Queue cancelled"
        );
        summary
    }

    /// Jobs waiting behind the running one.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Whether a job is executing.
    pub fn is_running(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.lock();
        QueueStatus {
            pending: state.pending.len(),
            running: state.active.is_some(),
        }
    }

    /// Time since the last submission or cancellation, or `None` while the
    /// queue still has work.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.shared.lock();
        (state.pending.is_empty() && state.active.is_none()).then(|| state.last_activity.elapsed())
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

/// Pop the next job whose caller is still waiting and make it the active one.
fn take_next(state: &mut QueueState) -> Option<(ExecutionRequest, oneshot::Receiver<()>)> {
    while let Some(job) = state.pending.pop_front() {
        if job.responder.is_closed() {
            tracing::debug!(request_id = %job.request.id, "Skipping abandoned job");
            continue;
        }
        let (abort_tx, abort_rx) = oneshot::channel();
        state.active = Some(ActiveJob {
            request_id: job.request.id.clone(),
            started: Instant::now(),
            responder: Some(job.responder),
            abort: Some(abort_tx),
        });
        return Some((job.request, abort_rx));
    }
    None
}

/// Run one request through the cache, executing on a miss.
pub async fn execute_cached(
    cache: &ResultCache,
    executor: &dyn CodeExecutor,
    request: ExecutionRequest,
) -> Result<ExecutionResult> {
    let key = request.cache_key();
    let id = request.id.clone();
    let skip = request.skip_cache;
    cache
        .get_or_execute(key, &id, skip, move || executor.execute(request))
        .await
}

async fn run(shared: Arc<Shared>) {
    loop {
        // Dequeue and mark active under one lock, so `cancel` always sees
        // the job either waiting or running.
        let (request, abort_rx) = loop {
            {
                let mut state = shared.lock();
                if state.closed {
                    return;
                }
                if let Some(next) = take_next(&mut state) {
                    break next;
                }
            }
            shared.notify.notified().await;
        };

        let request_id = request.id.clone();
        // Losing the select drops the execution, which kills a local child
        // process or aborts the HTTP call to a remote worker.
        let outcome = tokio::select! {
            result = execute_cached(&shared.cache, shared.executor.as_ref(), request) => Some(result),
            _ = abort_rx => None,
        };

        let responder = {
            let mut state = shared.lock();
            state.last_activity = Instant::now();
            state.active.take().and_then(|active| active.responder)
        };
        match (outcome, responder) {
            (Some(result), Some(responder)) => {
                let _ = responder.send(result);
            }
            (None, _) => {
                tracing::debug!(request_id = %request_id, "Running job aborted");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_core::mocks::MockExecutor;

    fn queue_with(executor: Arc<MockExecutor>) -> ExecutionQueue {
        let cache = Arc::new(ResultCache::new(50, Duration::from_secs(300)));
        ExecutionQueue::new(executor, cache)
    }

    #[tokio::test]
    async fn test_fifo_single_flight() {
        let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(20)));
        let queue = Arc::new(queue_with(executor.clone()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(ExecutionRequest::new("python", format!("job{}", i)))
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success());
        }

        assert_eq!(executor.calls(), vec!["job0", "job1", "job2", "job3"]);
        assert_eq!(queue.status(), QueueStatus::default());
    }

    #[tokio::test]
    async fn test_cancel_resolves_running_and_discards_waiting() {
        let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_secs(30)));
        let queue = Arc::new(queue_with(executor.clone()));

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ExecutionRequest::new("python", "slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ExecutionRequest::new("python", "next")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.status(), QueueStatus { pending: 1, running: true });

        let summary = queue.cancel();
        assert_eq!(
            summary,
            CancelSummary {
                running_cancelled: true,
                discarded: 1
            }
        );

        let running = running.await.unwrap().unwrap();
        assert!(running.cancelled);
        let waiting = waiting.await.unwrap().unwrap();
        assert!(waiting.cancelled);
        assert_eq!(waiting.duration_ms, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.call_count(), 1);
        assert_eq!(executor.finished_count(), 0);
        assert!(!queue.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_never_misses_a_job_being_dequeued() {
        for i in 0..100 {
            let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_secs(30)));
            let queue = Arc::new(queue_with(executor.clone()));

            let submitted = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .submit(ExecutionRequest::new("python", format!("job{}", i)))
                        .await
                })
            };
            while queue.status() == QueueStatus::default() {
                tokio::task::yield_now().await;
            }

            let summary = queue.cancel();
            assert_eq!(
                usize::from(summary.running_cancelled) + summary.discarded,
                1,
                "iteration {}: {:?}",
                i,
                summary
            );
            assert!(submitted.await.unwrap().unwrap().cancelled);
            assert_eq!(executor.finished_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_abandoned_job_is_skipped() {
        let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(50)));
        let queue = Arc::new(queue_with(executor.clone()));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ExecutionRequest::new("python", "slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let abandoned = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(ExecutionRequest::new("python", "gone")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.status(), QueueStatus { pending: 1, running: true });

        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        assert!(first.await.unwrap().unwrap().success());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.calls(), vec!["slow"]);
        assert_eq!(queue.status(), QueueStatus::default());
    }

    #[tokio::test]
    async fn test_repeat_submission_hits_cache() {
        let executor = Arc::new(MockExecutor::new());
        let queue = queue_with(executor.clone());

        let first = queue.submit(ExecutionRequest::new("python", "print(1)")).await.unwrap();
        let second = queue.submit(ExecutionRequest::new("python", "print(1)")).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(executor.call_count(), 1);

        let third = queue
            .submit(ExecutionRequest::new("python", "print(1)").skipping_cache())
            .await
            .unwrap();
        assert!(!third.from_cache);
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_on_idle_queue() {
        let queue = queue_with(Arc::new(MockExecutor::new()));
        assert_eq!(queue.cancel(), CancelSummary::default());
        assert!(queue.idle_for().is_some());
    }
}
