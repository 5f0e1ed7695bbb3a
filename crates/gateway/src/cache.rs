//! Result cache with in-flight deduplication.
//!
//! Keys are [`CacheKey`]s over `(language, source, stdin)`. A key is either
//! `Ready` (a stored result with an expiry) or `InFlight` (an execution is
//! running and later callers wait on it). Check-then-insert happens under
//! one lock, so two identical requests never both execute.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use coderunner_core::{CacheKey, ExecutionResult, Result};
use coderunner_telemetry::track_cache;

type Flight = watch::Receiver<Option<Result<ExecutionResult>>>;

/// A stored result.
#[derive(Debug, Clone)]
struct CacheEntry {
    result: ExecutionResult,
    created_at: Instant,
    expires_at: Instant,
    generation: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

enum Slot {
    Ready(CacheEntry),
    InFlight { generation: u64, flight: Flight },
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<CacheKey, Slot>,
    /// Insertion order of `Ready` entries; stale generations are skipped.
    order: VecDeque<(CacheKey, u64)>,
    ready: usize,
    next_generation: u64,
}

impl CacheInner {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.slots.remove(key);
        if matches!(slot, Some(Slot::Ready(_))) {
            self.ready -= 1;
        }
        slot
    }

    fn store(&mut self, key: CacheKey, result: ExecutionResult, ttl: Duration, capacity: usize) {
        self.remove(&key);
        let generation = self.generation();
        let created_at = Instant::now();
        self.slots.insert(
            key,
            Slot::Ready(CacheEntry {
                result,
                created_at,
                expires_at: created_at + ttl,
                generation,
            }),
        );
        self.ready += 1;
        self.order.push_back((key, generation));

        while self.ready > capacity {
            let Some((oldest, generation)) = self.order.pop_front() else {
                break;
            };
            if self.is_current(&oldest, generation) {
                self.remove(&oldest);
            }
        }
        if self.order.len() > capacity * 2 + 16 {
            self.compact();
        }
    }

    fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        matches!(self.slots.get(key), Some(Slot::Ready(e)) if e.generation == generation)
    }

    fn compact(&mut self) {
        let order = std::mem::take(&mut self.order);
        self.order = order
            .into_iter()
            .filter(|(key, generation)| self.is_current(key, *generation))
            .collect();
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Stored results.
    pub entries: usize,
    /// Lookups answered without executing.
    pub hits: u64,
    /// Lookups that led an execution.
    pub misses: u64,
}

/// Bounded, TTL-expiring result cache.
pub struct ResultCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

enum Action {
    Hit(ExecutionResult),
    Wait(Flight),
    Lead(watch::Sender<Option<Result<ExecutionResult>>>, u64),
    Bypass,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` results for `ttl` each.
    /// A capacity of 0 stores nothing but still deduplicates in-flight work.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        track_cache(true);
    }

    /// Stored, unexpired result for `key`, re-addressed to `request_id`.
    ///
    /// Misses are not counted; [`get_or_execute`](Self::get_or_execute) does that.
    pub fn peek(&self, key: &CacheKey, request_id: &str) -> Option<ExecutionResult> {
        let started = Instant::now();
        let stored = {
            let inner = self.lock();
            match inner.slots.get(key) {
                Some(Slot::Ready(entry)) if !entry.is_expired(started) => Some(entry.result.clone()),
                _ => None,
            }
        }?;
        self.hit();
        Some(stored.replayed_for(request_id, elapsed_ms(started)))
    }

    /// Store a result if it may be memoized.
    pub fn insert(&self, key: CacheKey, result: &ExecutionResult) {
        if self.capacity == 0 || !result.is_cacheable() {
            return;
        }
        let mut stored = result.clone();
        stored.from_cache = false;
        self.lock().store(key, stored, self.ttl, self.capacity);
    }

    /// Return the cached result for `key`, join an identical in-flight
    /// execution, or run `execute` as the leader for `key`.
    ///
    /// With `skip_lookup` the stored result is ignored and a fresh execution
    /// always runs; its result is still stored. Errors are shared with
    /// waiters but never stored. If the leader is dropped, a waiter takes
    /// over.
    pub async fn get_or_execute<F, Fut>(
        &self,
        key: CacheKey,
        request_id: &str,
        skip_lookup: bool,
        execute: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionResult>>,
    {
        let started = Instant::now();

        loop {
            let action = {
                let mut inner = self.lock();
                let now = Instant::now();
                match inner.slots.get(&key) {
                    Some(Slot::InFlight { .. }) if skip_lookup => Action::Bypass,
                    Some(Slot::InFlight { flight, .. }) => Action::Wait(flight.clone()),
                    Some(Slot::Ready(entry)) if !skip_lookup && !entry.is_expired(now) => {
                        Action::Hit(entry.result.clone())
                    }
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        let generation = inner.generation();
                        inner.remove(&key);
                        inner.slots.insert(key, Slot::InFlight { generation, flight: rx });
                        Action::Lead(tx, generation)
                    }
                }
            };

            match action {
                Action::Hit(result) => {
                    self.hit();
                    tracing::debug!(key = %key, request_id = %request_id, "Cache hit");
                    return Ok(result.replayed_for(request_id, elapsed_ms(started)));
                }
                Action::Wait(mut flight) => {
                    let shared = match flight.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        Err(_) => {
                            // Leader dropped; its guard cleared the slot.
                            tracing::debug!(key = %key, request_id = %request_id, "In-flight leader gone, retrying");
                            continue;
                        }
                    };
                    let Some(shared) = shared else { continue };
                    self.hit();
                    tracing::debug!(key = %key, request_id = %request_id, "Joined in-flight execution");
                    return shared.map(|r| r.replayed_for(request_id, elapsed_ms(started)));
                }
                Action::Lead(tx, generation) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    track_cache(false);
                    let mut guard = FlightGuard {
                        cache: self,
                        key,
                        generation,
                        done: false,
                    };
                    let result = execute().await;
                    guard.finish(&result);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Action::Bypass => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    track_cache(false);
                    let result = execute().await;
                    if let Ok(ref r) = result {
                        self.insert(key, r);
                    }
                    return result;
                }
            }
        }
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<CacheKey> = inner
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) if entry.is_expired(now) => Some(*key),
                _ => None,
            })
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        if !expired.is_empty() {
            inner.compact();
        }
        expired.len()
    }

    /// Drop every stored result. In-flight executions are unaffected.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.slots.retain(|_, slot| matches!(slot, Slot::InFlight { .. }));
        inner.order.clear();
        inner.ready = 0;
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock().ready,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Age of the stored entry for `key`, if any.
    pub fn age(&self, key: &CacheKey) -> Option<Duration> {
        match self.lock().slots.get(key) {
            Some(Slot::Ready(entry)) => Some(entry.created_at.elapsed()),
            _ => None,
        }
    }
}

/// Clears the leader's `InFlight` slot, storing the result on success.
/// Dropping it unfinished (leader cancelled) just clears the slot, which
/// wakes the waiters so one of them can lead.
struct FlightGuard<'a> {
    cache: &'a ResultCache,
    key: CacheKey,
    generation: u64,
    done: bool,
}

impl FlightGuard<'_> {
    fn finish(&mut self, result: &Result<ExecutionResult>) {
        self.release();
        if let Ok(result) = result {
            self.cache.insert(self.key, result);
        }
    }

    fn release(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut inner = self.cache.lock();
        if matches!(
            inner.slots.get(&self.key),
            Some(Slot::InFlight { generation, .. }) if *generation == self.generation
        ) {
            inner.remove(&self.key);
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_core::{Error, ExecutionRequest};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn key(code: &str) -> CacheKey {
        ExecutionRequest::new("python", code).cache_key()
    }

    fn ok(id: &str, stdout: &str) -> Result<ExecutionResult> {
        Ok(ExecutionResult::completed(id, stdout, "", 0, 100))
    }

    #[tokio::test]
    async fn test_second_call_hits() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        let first = cache
            .get_or_execute(key("a"), "r1", false, || async { ok("r1", "1") })
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second = cache
            .get_or_execute(key("a"), "r2", false, || async { ok("r2", "2") })
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.stdout, "1");
        assert_eq!(second.request_id, "r2");
        assert_eq!(cache.stats(), CacheStats { entries: 1, hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn test_oldest_entry_evicted() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        for code in ["a", "b", "c"] {
            cache.insert(key(code), &ExecutionResult::completed("r", code, "", 0, 1));
        }
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.peek(&key("a"), "x").is_none());
        assert!(cache.peek(&key("b"), "x").is_some());
        assert!(cache.peek(&key("c"), "x").is_some());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = ResultCache::new(10, Duration::from_millis(20));
        cache.insert(key("a"), &ExecutionResult::completed("r", "a", "", 0, 1));
        assert!(cache.peek(&key("a"), "x").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.peek(&key("a"), "x").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_timeouts_and_errors_are_not_stored() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        cache
            .get_or_execute(key("loop"), "r1", false, || async {
                Ok(ExecutionResult::timed_out("r1", 2000))
            })
            .await
            .unwrap();
        let _ = cache
            .get_or_execute(key("boom"), "r2", false, || async {
                Err(Error::worker_unreachable("python", "refused"))
            })
            .await;
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_stores_nothing() {
        let cache = ResultCache::new(0, Duration::from_secs(60));
        cache.insert(key("a"), &ExecutionResult::completed("r", "a", "", 0, 1));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_execute_once() {
        let cache = Arc::new(ResultCache::new(10, Duration::from_secs(60)));
        let runs = Arc::new(AtomicUsize::new(0));

        let call = |id: &'static str| {
            let cache = cache.clone();
            let runs = runs.clone();
            async move {
                cache
                    .get_or_execute(key("slow"), id, false, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ok(id, "done")
                    })
                    .await
            }
        };

        let (a, b, c) = tokio::join!(call("r1"), call("r2"), call("r3"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for (result, id) in [(a, "r1"), (b, "r2"), (c, "r3")] {
            let result = result.unwrap();
            assert_eq!(result.stdout, "done");
            assert_eq!(result.request_id, id);
        }
    }

    #[tokio::test]
    async fn test_waiter_takes_over_from_dropped_leader() {
        let cache = Arc::new(ResultCache::new(10, Duration::from_secs(60)));

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_execute(key("k"), "leader", false, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        ok("leader", "never")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_execute(key("k"), "waiter", false, || async { ok("waiter", "fresh") })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.stdout, "fresh");
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn test_skip_lookup_refreshes_entry() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        cache.insert(key("a"), &ExecutionResult::completed("r", "old", "", 0, 1));

        let fresh = cache
            .get_or_execute(key("a"), "r2", true, || async { ok("r2", "new") })
            .await
            .unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(cache.peek(&key("a"), "r3").unwrap().stdout, "new");
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        cache.insert(key("a"), &ExecutionResult::completed("r", "a", "", 0, 1));
        assert!(cache.age(&key("a")).is_some());
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.peek(&key("a"), "x").is_none());
    }
}
