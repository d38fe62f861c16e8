//! Card request handling: classify the stored card and pick the response path.
//!
//! - absent: generate (joining any in-flight generation) and wait
//! - fresh: serve the stored bytes, or "not modified" on a matching etag
//! - stale: serve the stored bytes (or "not modified") immediately and start a
//!   background regeneration

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::{freshness, ArtifactRecord, CacheKey, Clock, Freshness, RegenerationCoordinator};
use crate::error::CardError;
use crate::metrics::{CacheStatus, Metrics};

/// A card file can be superseded or lost between lookup and read; retry
/// this many times before giving up.
const READ_ATTEMPTS: usize = 3;

/// How the card in a response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSource {
    /// Generated while the caller waited.
    Created,
    Fresh,
    /// Older than the TTL; a refresh was requested.
    Stale,
}

impl CardSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CardResponse {
    pub source: CardSource,
    pub record: Arc<ArtifactRecord>,
    /// `None` when the caller's `If-None-Match` matched.
    pub body: Option<Bytes>,
    /// Cache lifetime hint for the client.
    pub max_age: Duration,
}

impl CardResponse {
    pub fn not_modified(&self) -> bool {
        self.body.is_none()
    }
}

/// Composes the store, the freshness policy and the coordinator.
#[derive(Clone)]
pub struct CardService {
    coordinator: RegenerationCoordinator,
    ttl: Duration,
    clock: Clock,
    metrics: Arc<Metrics>,
}

impl CardService {
    pub fn new(
        coordinator: RegenerationCoordinator,
        ttl: Duration,
        clock: Clock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            coordinator,
            ttl,
            clock,
            metrics,
        }
    }

    pub fn coordinator(&self) -> &RegenerationCoordinator {
        &self.coordinator
    }

    /// Drop the stored card for `key`, if any.
    pub async fn evict(&self, key: &CacheKey) -> Option<Arc<ArtifactRecord>> {
        let removed = self.coordinator.store().evict(key).await;
        self.metrics
            .cards_stored
            .set(self.coordinator.store().len() as i64);
        removed
    }

    /// Answer a card request for `key`, honoring `If-None-Match`.
    pub async fn serve(&self, key: &CacheKey, if_none_match: Option<&str>) -> Result<CardResponse, CardError> {
        let result = self.serve_inner(key, if_none_match).await;
        let status = match &result {
            Ok(r) if r.not_modified() => CacheStatus::NotModified,
            Ok(r) => match r.source {
                CardSource::Created => CacheStatus::Created,
                CardSource::Fresh => CacheStatus::Fresh,
                CardSource::Stale => CacheStatus::Stale,
            },
            Err(_) => CacheStatus::Error,
        };
        self.metrics.record_request(status);
        result
    }

    /// Generate `key` synchronously, joining an in-flight generation if
    /// there is one.  Used by the JSON API.
    pub async fn generate(&self, key: &CacheKey) -> Result<Arc<ArtifactRecord>, CardError> {
        self.coordinator.obtain_blocking(key).await
    }

    async fn serve_inner(&self, key: &CacheKey, if_none_match: Option<&str>) -> Result<CardResponse, CardError> {
        let store = self.coordinator.store();

        for _ in 0..READ_ATTEMPTS {
            let current = store.lookup(key);
            let now = (self.clock)();
            let state = freshness::classify(current.as_deref(), now, self.ttl);
            debug!(repo = %key, ?state, "card lookup");

            let (source, record) = match (state, current) {
                (Freshness::Fresh, Some(record)) => (CardSource::Fresh, record),
                (Freshness::Stale, Some(record)) => (CardSource::Stale, record),
                _ => {
                    let record = self.coordinator.obtain_blocking(key).await?;
                    (CardSource::Created, record)
                }
            };

            if source == CardSource::Stale && self.coordinator.refresh_in_background(key) {
                info!(repo = %key, etag = %record.etag, "stale card found, refresh started");
            }

            let max_age = match source {
                CardSource::Fresh => freshness::remaining_ttl(&record, now, self.ttl),
                CardSource::Created | CardSource::Stale => self.ttl,
            };

            let matched = source != CardSource::Created
                && if_none_match.is_some_and(|header| etag_matches(header, &record.etag));

            let body = if matched {
                None
            } else {
                match store.read(&record).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        if store.discard_if_current(&record) {
                            warn!(repo = %key, etag = %record.etag, "card file missing, dropping record");
                            self.metrics.cards_stored.set(store.len() as i64);
                        } else {
                            debug!(repo = %key, etag = %record.etag, "card superseded during read, retrying");
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            return Ok(CardResponse {
                source,
                record,
                body,
                max_age,
            });
        }

        Err(CardError::Storage(format!(
            "card for {key} was replaced repeatedly while being read"
        )))
    }
}

/// Whether an `If-None-Match` header value matches `etag`.
///
/// Handles lists, `*`, weak validators and unquoted values.
pub fn etag_matches(header: &str, etag: &str) -> bool {
    let etag = normalize_etag(etag);
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || (!candidate.is_empty() && normalize_etag(candidate) == etag)
    })
}

fn normalize_etag(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value.trim_matches('"')
}
