//! Per-key single-flight regeneration.
//!
//! At most one generation runs for a key at a time.  The first caller that
//! finds no ticket for the key claims it and spawns the generation; every
//! later caller either joins that ticket (blocking mode) or leaves it alone
//! (background mode).  A ticket is released on every exit path of the
//! generation task, including timeout and panic, and only by the task that
//! claimed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::store::{ArtifactRecord, ArtifactStore};
use crate::error::CardError;
use crate::generator::CardGenerator;
use crate::metrics::{GenerationMode, GenerationOutcome, Metrics};

/// Result shared with every caller waiting on one generation.
pub type GenerationResult = Result<Arc<ArtifactRecord>, CardError>;

type Slot = Option<GenerationResult>;

struct Ticket {
    id: u64,
    rx: watch::Receiver<Slot>,
}

/// Cheap to clone; clones share the same ticket table.
#[derive(Clone)]
pub struct RegenerationCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: ArtifactStore,
    generator: Arc<dyn CardGenerator>,
    timeout: Duration,
    tickets: Mutex<HashMap<CacheKey, Ticket>>,
    next_ticket: AtomicU64,
    metrics: Arc<Metrics>,
}

enum Claim {
    Started(watch::Receiver<Slot>),
    Joined(watch::Receiver<Slot>),
}

impl RegenerationCoordinator {
    pub fn new(
        store: ArtifactStore,
        generator: Arc<dyn CardGenerator>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                generator,
                timeout,
                tickets: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Whether a generation for `key` is currently running.
    pub fn in_flight(&self, key: &CacheKey) -> bool {
        self.inner.tickets.lock().contains_key(key)
    }

    /// Produce a card for `key` and wait for it.
    ///
    /// Joins the running generation if there is one, otherwise starts one.
    /// All callers attached to the same generation receive the same result.
    pub async fn obtain_blocking(&self, key: &CacheKey) -> GenerationResult {
        let rx = match self.claim(key, GenerationMode::Blocking) {
            Claim::Started(rx) => rx,
            Claim::Joined(rx) => {
                self.inner.metrics.generation_waiters_joined_total.inc();
                debug!(repo = %key, "joined in-flight generation");
                rx
            }
        };
        wait(rx).await
    }

    /// Start a background regeneration for `key` unless one is already
    /// running.  Returns `true` when a new generation was started.
    pub fn refresh_in_background(&self, key: &CacheKey) -> bool {
        match self.claim(key, GenerationMode::Background) {
            Claim::Started(_) => {
                debug!(repo = %key, "background regeneration started");
                true
            }
            Claim::Joined(_) => {
                self.inner.metrics.background_refresh_skipped_total.inc();
                debug!(repo = %key, "regeneration already in flight");
                false
            }
        }
    }

    /// Check for a ticket and create one in a single critical section.
    fn claim(&self, key: &CacheKey, mode: GenerationMode) -> Claim {
        let (id, tx, rx) = {
            let mut tickets = self.inner.tickets.lock();
            if let Some(ticket) = tickets.get(key) {
                return Claim::Joined(ticket.rx.clone());
            }
            let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = watch::channel(None);
            tickets.insert(
                key.clone(),
                Ticket {
                    id,
                    rx: rx.clone(),
                },
            );
            (id, tx, rx)
        };

        self.inner.metrics.generations_in_flight.inc();
        let guard = TicketGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        };
        tokio::spawn(run_generation(Arc::clone(&self.inner), key.clone(), mode, tx, guard));
        Claim::Started(rx)
    }
}

/// Removes the ticket it was created for when dropped, unless the slot has
/// since been claimed by a newer ticket.
struct TicketGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let mut tickets = self.inner.tickets.lock();
        if tickets.get(&self.key).is_some_and(|t| t.id == self.id) {
            tickets.remove(&self.key);
        }
        drop(tickets);
        self.inner.metrics.generations_in_flight.dec();
    }
}

async fn run_generation(
    inner: Arc<Inner>,
    key: CacheKey,
    mode: GenerationMode,
    tx: watch::Sender<Slot>,
    guard: TicketGuard,
) {
    let started = Instant::now();

    let generator = Arc::clone(&inner.generator);
    let task_key = key.clone();
    let handle = tokio::spawn(async move { generator.generate(&task_key).await });
    let abort = handle.abort_handle();

    let mut timed_out = false;
    let result = match tokio::time::timeout(inner.timeout, handle).await {
        Ok(Ok(Ok(card))) => inner.store.publish(&key, card.bytes, card.metadata).await,
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(CardError::Internal("card generation panicked".to_string()))
        }
        Ok(Err(join_err)) => Err(CardError::Internal(format!("card generation aborted: {join_err}"))),
        Err(_) => {
            abort.abort();
            timed_out = true;
            Err(CardError::transient(format!(
                "card generation timed out after {}s",
                inner.timeout.as_secs_f32()
            )))
        }
    };

    let elapsed = started.elapsed();
    inner
        .metrics
        .generation_duration_seconds
        .observe(elapsed.as_secs_f64());
    inner
        .metrics
        .record_generation(mode.clone(), outcome_label(&result, timed_out));

    match &result {
        Ok(record) => {
            inner.metrics.cards_stored.set(inner.store.len() as i64);
            info!(
                repo = %key,
                etag = %record.etag,
                elapsed_ms = elapsed.as_millis() as u64,
                ?mode,
                "card generated"
            );
        }
        Err(e) => warn!(
            repo = %key,
            error = %e,
            kind = e.kind(),
            elapsed_ms = elapsed.as_millis() as u64,
            ?mode,
            "card generation failed"
        ),
    }

    // The ticket holds a receiver until the guard drops, so this is stored.
    let _ = tx.send(Some(result));
    drop(guard);
}

async fn wait(mut rx: watch::Receiver<Slot>) -> GenerationResult {
    match rx.wait_for(Option::is_some).await {
        Ok(slot) => (*slot)
            .clone()
            .unwrap_or_else(|| Err(CardError::Internal("empty generation result".to_string()))),
        Err(_) => Err(CardError::Internal(
            "card generation ended without a result".to_string(),
        )),
    }
}

fn outcome_label(result: &GenerationResult, timed_out: bool) -> GenerationOutcome {
    match result {
        Ok(_) => GenerationOutcome::Success,
        Err(_) if timed_out => GenerationOutcome::Timeout,
        Err(CardError::UpstreamNotFound(_)) => GenerationOutcome::NotFound,
        Err(CardError::UpstreamTransient { .. }) => GenerationOutcome::Transient,
        Err(CardError::Storage(_)) => GenerationOutcome::Storage,
        Err(CardError::InvalidIdentifier(_) | CardError::Internal(_)) => GenerationOutcome::Internal,
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::cache::system_clock;
    use crate::generator::testing::{FakeGenerator, Outcome};
    use crate::metrics::MetricsRegistry;

    struct Harness {
        _dir: tempfile::TempDir,
        generator: Arc<FakeGenerator>,
        coordinator: RegenerationCoordinator,
    }

    fn harness(generator: FakeGenerator, timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), system_clock()).unwrap();
        let generator = Arc::new(generator);
        let coordinator = RegenerationCoordinator::new(
            store,
            generator.clone(),
            timeout,
            MetricsRegistry::new().metrics,
        );
        Harness {
            _dir: dir,
            generator,
            coordinator,
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("acme", "widgets").unwrap()
    }

    async fn wait_until_idle(coordinator: &RegenerationCoordinator, key: &CacheKey) {
        for _ in 0..200 {
            if !coordinator.in_flight(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation for {key} never finished");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_generation() {
        let h = harness(
            FakeGenerator::new().with_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
        );

        let key = key();
        let results = join_all((0..16).map(|_| h.coordinator.obtain_blocking(&key))).await;

        assert_eq!(h.generator.calls(), 1);
        let etags: Vec<_> = results.into_iter().map(|r| r.unwrap().etag.clone()).collect();
        assert!(etags.iter().all(|e| *e == etags[0]));
        assert_eq!(h.coordinator.store().lookup(&key).unwrap().etag, etags[0]);
        assert!(!h.coordinator.in_flight(&key));
    }

    #[tokio::test]
    async fn distinct_keys_generate_independently() {
        let h = harness(
            FakeGenerator::new().with_delay(Duration::from_millis(50)),
            Duration::from_secs(5),
        );
        let first = key();
        let other = CacheKey::new("acme", "gadgets").unwrap();

        let (a, b) = tokio::join!(
            h.coordinator.obtain_blocking(&first),
            h.coordinator.obtain_blocking(&other)
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.generator.calls(), 2);
        assert_eq!(h.coordinator.store().len(), 2);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_publishes_nothing() {
        let generator = FakeGenerator::new().with_delay(Duration::from_millis(50));
        generator.set_outcome(Outcome::Fail(CardError::UpstreamNotFound("acme/widgets".into())));
        let h = harness(generator, Duration::from_secs(5));

        let key = key();
        let results = join_all((0..4).map(|_| h.coordinator.obtain_blocking(&key))).await;

        assert_eq!(h.generator.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap_err(), CardError::UpstreamNotFound("acme/widgets".into()));
        }
        assert!(h.coordinator.store().lookup(&key).is_none());
        assert!(!h.coordinator.in_flight(&key));
    }

    #[tokio::test]
    async fn next_request_after_failure_retries() {
        let generator = FakeGenerator::new();
        generator.set_outcome(Outcome::Fail(CardError::transient("boom")));
        let h = harness(generator, Duration::from_secs(5));

        assert!(h.coordinator.obtain_blocking(&key()).await.is_err());
        h.generator.set_outcome(Outcome::Succeed);
        let record = h.coordinator.obtain_blocking(&key()).await.unwrap();

        assert_eq!(h.generator.calls(), 2);
        assert_eq!(record.metadata.stars, 2);
    }

    #[tokio::test]
    async fn hung_generation_times_out_and_releases_ticket() {
        let generator = FakeGenerator::new();
        generator.set_outcome(Outcome::Hang);
        let h = harness(generator, Duration::from_millis(100));

        let err = h.coordinator.obtain_blocking(&key()).await.unwrap_err();
        assert_eq!(err.kind(), "transient");
        assert!(err.to_string().contains("timed out"), "{err}");

        wait_until_idle(&h.coordinator, &key()).await;
        h.generator.set_outcome(Outcome::Succeed);
        assert!(h.coordinator.obtain_blocking(&key()).await.is_ok());
        assert_eq!(h.generator.calls(), 2);
    }

    #[tokio::test]
    async fn hung_background_refresh_times_out_and_releases_ticket() {
        let h = harness(FakeGenerator::new(), Duration::from_millis(100));
        let v1 = h.coordinator.obtain_blocking(&key()).await.unwrap();

        h.generator.set_outcome(Outcome::Hang);
        assert!(h.coordinator.refresh_in_background(&key()));
        assert!(h.coordinator.in_flight(&key()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!h.coordinator.in_flight(&key()));
        assert_eq!(h.coordinator.store().lookup(&key()).unwrap().etag, v1.etag);

        h.generator.set_outcome(Outcome::Succeed);
        assert!(h.coordinator.refresh_in_background(&key()));
        wait_until_idle(&h.coordinator, &key()).await;
        assert_eq!(h.generator.calls(), 3);
        assert_ne!(h.coordinator.store().lookup(&key()).unwrap().etag, v1.etag);
    }

    #[tokio::test]
    async fn panicking_generator_yields_internal_error() {
        let generator = FakeGenerator::new();
        generator.set_outcome(Outcome::Panic);
        let h = harness(generator, Duration::from_secs(5));

        let err = h.coordinator.obtain_blocking(&key()).await.unwrap_err();
        assert_eq!(err.kind(), "internal");

        wait_until_idle(&h.coordinator, &key()).await;
        assert!(h.coordinator.store().lookup(&key()).is_none());
    }

    #[tokio::test]
    async fn background_refresh_is_deduplicated() {
        let h = harness(
            FakeGenerator::new().with_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
        );

        assert!(h.coordinator.refresh_in_background(&key()));
        for _ in 0..10 {
            assert!(!h.coordinator.refresh_in_background(&key()));
        }
        assert!(h.coordinator.in_flight(&key()));

        wait_until_idle(&h.coordinator, &key()).await;
        assert_eq!(h.generator.calls(), 1);
        assert!(h.coordinator.store().lookup(&key()).is_some());
    }

    #[tokio::test]
    async fn blocking_caller_joins_background_generation() {
        let h = harness(
            FakeGenerator::new().with_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
        );

        assert!(h.coordinator.refresh_in_background(&key()));
        let record = h.coordinator.obtain_blocking(&key()).await.unwrap();

        assert_eq!(h.generator.calls(), 1);
        assert_eq!(record.metadata.stars, 1);
    }

    #[tokio::test]
    async fn background_failure_keeps_previous_card() {
        let h = harness(FakeGenerator::new(), Duration::from_secs(5));
        let v1 = h.coordinator.obtain_blocking(&key()).await.unwrap();

        h.generator.set_outcome(Outcome::Fail(CardError::transient("upstream down")));
        assert!(h.coordinator.refresh_in_background(&key()));
        wait_until_idle(&h.coordinator, &key()).await;

        let current = h.coordinator.store().lookup(&key()).unwrap();
        assert_eq!(current.etag, v1.etag);
        assert!(current.path.exists());
    }

    #[test]
    fn stale_guard_does_not_release_newer_ticket() {
        let h = harness(FakeGenerator::new(), Duration::from_secs(5));

        let (_tx, rx) = watch::channel(None);
        h.coordinator
            .inner
            .tickets
            .lock()
            .insert(key(), Ticket { id: 42, rx });
        h.coordinator.inner.metrics.generations_in_flight.inc_by(2);

        drop(TicketGuard {
            inner: Arc::clone(&h.coordinator.inner),
            key: key(),
            id: 7,
        });
        assert!(h.coordinator.in_flight(&key()));

        drop(TicketGuard {
            inner: Arc::clone(&h.coordinator.inner),
            key: key(),
            id: 42,
        });
        assert!(!h.coordinator.in_flight(&key()));
    }
}
