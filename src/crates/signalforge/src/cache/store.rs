use super::Fingerprint;
use crate::error::{Result, SignalError};
use crate::outcome::RequestOutcome;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// A stored outcome. Never mutated; an expired entry is replaced.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub outcome: RequestOutcome,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Where a lookup's outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Stored entry
    Hit,
    /// This caller ran the producer
    Produced,
    /// Another caller's in-flight producer
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct Lookup {
    pub outcome: RequestOutcome,
    pub source: CacheSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
}

#[derive(Debug, Clone)]
enum Flight {
    Running,
    Finished(Result<RequestOutcome>),
    Abandoned,
}

enum Slot {
    Ready(CacheEntry),
    InFlight {
        flight: u64,
        rx: watch::Receiver<Flight>,
    },
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<Fingerprint, Slot>,
    next_flight: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
}

impl CacheInner {
    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    fn release(&mut self, fingerprint: &Fingerprint, flight: u64) {
        if matches!(
            self.slots.get(fingerprint),
            Some(Slot::InFlight { flight: current, .. }) if *current == flight
        ) {
            self.slots.remove(fingerprint);
        }
    }

    /// Make room for one more ready entry.
    fn evict_for(&mut self, fingerprint: &Fingerprint, max_entries: usize, now: Instant) {
        if matches!(self.slots.get(fingerprint), Some(Slot::Ready(_))) {
            return;
        }
        if self.ready_count() < max_entries {
            return;
        }

        self.slots
            .retain(|_, slot| !matches!(slot, Slot::Ready(entry) if entry.is_expired(now)));

        while self.ready_count() >= max_entries {
            let oldest = self
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((key, entry.created_at)),
                    Slot::InFlight { .. } => None,
                })
                .min_by_key(|(_, created_at)| *created_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!(fingerprint = %key.short(), "Evicting oldest cache entry");
                    self.slots.remove(&key);
                }
                None => break,
            }
        }
    }
}

enum Found {
    Ready(RequestOutcome),
    InFlight(watch::Receiver<Flight>),
}

enum Step {
    Hit(RequestOutcome),
    Wait(watch::Receiver<Flight>),
    Lead(FlightGuard),
}

/// Result cache with per-fingerprint single-flight producers.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Mutex<CacheInner>>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            max_entries: max_entries.max(1),
        }
    }

    /// Return the cached outcome for `fingerprint`, or run `producer` to
    /// create it. At most one producer runs per fingerprint at a time; other
    /// callers await its result. Failures are handed to current waiters but
    /// never stored. If the running producer is dropped, one waiter takes over
    /// with its own producer.
    pub async fn get_or_create<F>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        producer: F,
    ) -> Result<Lookup>
    where
        F: Future<Output = Result<RequestOutcome>>,
    {
        let mut producer = Some(producer);
        loop {
            match self.enter(fingerprint) {
                Step::Hit(outcome) => {
                    return Ok(Lookup {
                        outcome,
                        source: CacheSource::Hit,
                    })
                }
                Step::Wait(mut rx) => {
                    let state = rx
                        .wait_for(|flight| !matches!(flight, Flight::Running))
                        .await
                        .map(|flight| flight.clone());
                    match state {
                        Ok(Flight::Finished(result)) => {
                            return result.map(|outcome| Lookup {
                                outcome,
                                source: CacheSource::Coalesced,
                            })
                        }
                        _ => {
                            debug!(
                                fingerprint = %fingerprint.short(),
                                "In-flight producer abandoned, taking over"
                            );
                        }
                    }
                }
                Step::Lead(guard) => {
                    let producer = producer.take().ok_or_else(|| {
                        SignalError::InternalFault(format!(
                            "producer for {} already consumed",
                            fingerprint.short()
                        ))
                    })?;
                    let result = producer.await;
                    guard.finish(&result, ttl);
                    return result.map(|outcome| Lookup {
                        outcome,
                        source: CacheSource::Produced,
                    });
                }
            }
        }
    }

    fn enter(&self, fingerprint: &Fingerprint) -> Step {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let existing = match inner.slots.get(fingerprint) {
            Some(Slot::Ready(entry)) if !entry.is_expired(now) => {
                Some(Found::Ready(entry.outcome.clone()))
            }
            Some(Slot::InFlight { rx, .. }) => Some(Found::InFlight(rx.clone())),
            Some(Slot::Ready(_)) => {
                debug!(fingerprint = %fingerprint.short(), "Cache entry expired");
                None
            }
            None => None,
        };

        match existing {
            Some(Found::Ready(outcome)) => {
                inner.hits += 1;
                debug!(fingerprint = %fingerprint.short(), "Cache hit");
                return Step::Hit(outcome);
            }
            Some(Found::InFlight(rx)) => {
                inner.coalesced += 1;
                debug!(fingerprint = %fingerprint.short(), "Joining in-flight producer");
                return Step::Wait(rx);
            }
            None => {}
        }

        inner.misses += 1;
        inner.next_flight += 1;
        let flight = inner.next_flight;
        let (tx, rx) = watch::channel(Flight::Running);
        inner
            .slots
            .insert(fingerprint.clone(), Slot::InFlight { flight, rx });
        debug!(fingerprint = %fingerprint.short(), flight, "Cache miss, producing");

        Step::Lead(FlightGuard {
            inner: self.inner.clone(),
            fingerprint: fingerprint.clone(),
            flight,
            max_entries: self.max_entries,
            tx: Some(tx),
        })
    }

    /// Unexpired outcome for `fingerprint`, without waiting on producers.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<RequestOutcome> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired = match inner.slots.get(fingerprint) {
            Some(Slot::Ready(entry)) if !entry.is_expired(now) => {
                return Some(entry.outcome.clone())
            }
            Some(Slot::Ready(_)) => true,
            _ => false,
        };
        if expired {
            inner.slots.remove(fingerprint);
        }
        None
    }

    /// Drop a stored entry. In-flight producers are left alone.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.slots.get(fingerprint), Some(Slot::Ready(_))) {
            inner.slots.remove(fingerprint);
            true
        } else {
            false
        }
    }

    /// Drop every stored entry.
    pub fn clear(&self) {
        self.inner
            .lock()
            .slots
            .retain(|_, slot| matches!(slot, Slot::InFlight { .. }));
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            coalesced: inner.coalesced,
            entries: inner.ready_count(),
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Held by the producing caller. Dropping it without `finish` releases the
/// in-flight marker and wakes waiters so one of them can take over.
struct FlightGuard {
    inner: Arc<Mutex<CacheInner>>,
    fingerprint: Fingerprint,
    flight: u64,
    max_entries: usize,
    tx: Option<watch::Sender<Flight>>,
}

impl FlightGuard {
    fn finish(mut self, result: &Result<RequestOutcome>, ttl: Duration) {
        {
            let mut inner = self.inner.lock();
            match result {
                Ok(outcome) => {
                    let now = Instant::now();
                    inner.evict_for(&self.fingerprint, self.max_entries, now);
                    inner.slots.insert(
                        self.fingerprint.clone(),
                        Slot::Ready(CacheEntry {
                            fingerprint: self.fingerprint.clone(),
                            outcome: outcome.clone(),
                            created_at: now,
                            ttl,
                        }),
                    );
                }
                Err(_) => inner.release(&self.fingerprint, self.flight),
            }
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Flight::Finished(result.clone()));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.inner.lock().release(&self.fingerprint, self.flight);
            let _ = tx.send(Flight::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{OutcomeStatus, TaskResult};
    use crate::task::{TaskPayload, TaskType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn outcome(text: &str) -> RequestOutcome {
        RequestOutcome {
            task_id: Uuid::new_v4(),
            task_type: TaskType::ContentGen,
            status: OutcomeStatus::Success,
            result: TaskResult::default_for(TaskType::ContentGen, &TaskPayload::new()),
            raw_response: text.to_string(),
            diagnostics: None,
            retries_used: 0,
            latency: Duration::ZERO,
            tokens_used: 10,
            from_cache: false,
        }
    }

    fn key(topic: &str) -> Fingerprint {
        Fingerprint::of(TaskType::ContentGen, &TaskPayload::new().with_topic(topic))
    }

    #[tokio::test]
    async fn test_second_lookup_hits() {
        let cache = ResultCache::new(16);
        let fp = key("tea");
        let ttl = Duration::from_secs(60);

        let first = cache
            .get_or_create(&fp, ttl, async { Ok(outcome("one")) })
            .await
            .unwrap();
        assert_eq!(first.source, CacheSource::Produced);

        let second = cache
            .get_or_create(&fp, ttl, async { Ok(outcome("two")) })
            .await
            .unwrap();
        assert_eq!(second.source, CacheSource::Hit);
        assert_eq!(second.outcome.raw_response, "one");
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_producer() {
        let cache = ResultCache::new(16);
        let fp = key("launch");
        let runs = Arc::new(AtomicUsize::new(0));

        let call = |label: &'static str| {
            let cache = cache.clone();
            let fp = fp.clone();
            let runs = runs.clone();
            async move {
                cache
                    .get_or_create(&fp, Duration::from_secs(60), async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(outcome(label))
                    })
                    .await
            }
        };

        let (a, b, c) = tokio::join!(call("a"), call("b"), call("c"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let a = a.unwrap();
        let b = b.unwrap();
        let c = c.unwrap();
        assert_eq!(a.outcome.raw_response, b.outcome.raw_response);
        assert_eq!(b.outcome.raw_response, c.outcome.raw_response);
        assert_eq!(cache.stats().coalesced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_replaced() {
        let cache = ResultCache::new(16);
        let fp = key("ttl");
        let ttl = Duration::from_secs(30);

        cache
            .get_or_create(&fp, ttl, async { Ok(outcome("old")) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get(&fp).is_none());

        let fresh = cache
            .get_or_create(&fp, ttl, async { Ok(outcome("new")) })
            .await
            .unwrap();
        assert_eq!(fresh.source, CacheSource::Produced);
        assert_eq!(fresh.outcome.raw_response, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reach_waiters_but_are_not_stored() {
        let cache = ResultCache::new(16);
        let fp = key("fail");
        let ttl = Duration::from_secs(60);

        let leader = cache.get_or_create(&fp, ttl, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(SignalError::UpstreamAuthError("401".into()))
        });
        let waiter = cache.get_or_create(&fp, ttl, async { Ok(outcome("unused")) });

        let (leader, waiter) = tokio::join!(leader, waiter);
        assert!(matches!(leader, Err(SignalError::UpstreamAuthError(_))));
        assert!(matches!(waiter, Err(SignalError::UpstreamAuthError(_))));
        assert_eq!(cache.stats().entries, 0);

        let retry = cache
            .get_or_create(&fp, ttl, async { Ok(outcome("ok")) })
            .await
            .unwrap();
        assert_eq!(retry.source, CacheSource::Produced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_hands_over() {
        let cache = ResultCache::new(16);
        let fp = key("cancel");
        let ttl = Duration::from_secs(60);

        let leader_cache = cache.clone();
        let leader_fp = fp.clone();
        let leader = tokio::spawn(async move {
            leader_cache
                .get_or_create(&leader_fp, ttl, async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(outcome("never"))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter_cache = cache.clone();
        let waiter_fp = fp.clone();
        let waiter = tokio::spawn(async move {
            waiter_cache
                .get_or_create(&waiter_fp, ttl, async { Ok(outcome("takeover")) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.source, CacheSource::Produced);
        assert_eq!(result.outcome.raw_response, "takeover");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_expired_then_oldest() {
        let cache = ResultCache::new(2);
        let short = Duration::from_secs(5);
        let long = Duration::from_secs(600);

        cache
            .get_or_create(&key("a"), short, async { Ok(outcome("a")) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache
            .get_or_create(&key("b"), long, async { Ok(outcome("b")) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        // "a" has expired and goes first
        cache
            .get_or_create(&key("c"), long, async { Ok(outcome("c")) })
            .await
            .unwrap();
        assert!(cache.get(&key("b")).is_some());
        assert_eq!(cache.stats().entries, 2);

        // both live now, so the oldest ("b") is evicted
        tokio::time::advance(Duration::from_secs(1)).await;
        cache
            .get_or_create(&key("d"), long, async { Ok(outcome("d")) })
            .await
            .unwrap();
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert!(cache.get(&key("d")).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = ResultCache::new(4);
        let ttl = Duration::from_secs(60);
        for topic in ["x", "y"] {
            cache
                .get_or_create(&key(topic), ttl, async { Ok(outcome(topic)) })
                .await
                .unwrap();
        }
        assert!(cache.invalidate(&key("x")));
        assert!(!cache.invalidate(&key("x")));
        assert_eq!(cache.stats().entries, 1);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
