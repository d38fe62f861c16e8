//! TTL-based freshness classification of stored cards.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::store::ArtifactRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No card exists for the key.
    Absent,
    /// The card is younger than the TTL.
    Fresh,
    /// The card exists but has outlived the TTL.
    Stale,
}

/// Classify `record` as absent, fresh or stale relative to `now`.
///
/// A record dated in the future (clock adjustment) counts as fresh.
pub fn classify(record: Option<&ArtifactRecord>, now: DateTime<Utc>, ttl: Duration) -> Freshness {
    let Some(record) = record else {
        return Freshness::Absent;
    };
    match (now - record.created_at).to_std() {
        Ok(age) if age >= ttl => Freshness::Stale,
        _ => Freshness::Fresh,
    }
}

/// Time left in the freshness window of `record`, zero once stale.
pub fn remaining_ttl(record: &ArtifactRecord, now: DateTime<Utc>, ttl: Duration) -> Duration {
    let age = (now - record.created_at).to_std().unwrap_or_default();
    ttl.saturating_sub(age)
}
