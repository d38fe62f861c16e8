//! Stale-while-revalidate card cache.
//!
//! Provides the [`ArtifactStore`] that owns generated cards on disk, the
//! [`freshness`] policy that classifies them against the TTL, and the
//! [`RegenerationCoordinator`] that collapses concurrent regeneration of the
//! same card into a single upstream call.

pub mod coordinator;
pub mod freshness;
pub mod key;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use coordinator::RegenerationCoordinator;
pub use freshness::Freshness;
pub use key::CacheKey;
pub use store::{ArtifactRecord, ArtifactStore};

/// Source of "now" for record timestamps and freshness checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
