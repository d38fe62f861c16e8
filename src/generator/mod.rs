//! Card generation: fetch repository data, then draw the card.
//!
//! The cache core only sees the [`CardGenerator`] trait.  The production
//! implementation, [`GitHubCardGenerator`], combines the GitHub API client
//! with the PNG renderer.

pub mod github;
pub mod rate_limit;
pub mod render;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::error::CardError;

use self::github::GitHubClient;
use self::render::{CardContent, CardRenderer};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Repository facts captured at generation time and returned alongside the
/// card by the JSON API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoMetadata {
    pub description: String,
    pub stars: u64,
    pub forks: u64,
    pub issues: u64,
    pub contributors: u64,
}

/// Output of one successful generation.
#[derive(Debug, Clone)]
pub struct GeneratedCard {
    /// Encoded PNG.
    pub bytes: Bytes,
    pub metadata: RepoMetadata,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Produces the card for a repository.  May be slow and may fail.
#[async_trait]
pub trait CardGenerator: Send + Sync {
    async fn generate(&self, key: &CacheKey) -> Result<GeneratedCard, CardError>;
}

// ---------------------------------------------------------------------------
// GitHub-backed generator
// ---------------------------------------------------------------------------

pub struct GitHubCardGenerator {
    client: GitHubClient,
    renderer: Arc<CardRenderer>,
}

impl GitHubCardGenerator {
    pub fn new(client: GitHubClient, renderer: CardRenderer) -> Self {
        Self {
            client,
            renderer: Arc::new(renderer),
        }
    }
}

#[async_trait]
impl CardGenerator for GitHubCardGenerator {
    async fn generate(&self, key: &CacheKey) -> Result<GeneratedCard, CardError> {
        let repo = self.client.fetch_repo(key).await?;

        let contributors = self
            .client
            .fetch_contributor_count(key)
            .await
            .unwrap_or_else(|e| {
                warn!(repo = %key, error = %e, "contributor count unavailable, using 0");
                0
            });

        let avatar = match repo.owner.avatar_url.as_deref() {
            Some(url) => match self.client.download_avatar(url).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(repo = %key, error = %e, "avatar download failed, drawing placeholder");
                    None
                }
            },
            None => None,
        };

        let metadata = RepoMetadata {
            description: repo.description.clone().unwrap_or_default(),
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            issues: repo.open_issues_count,
            contributors,
        };

        let (owner, name) = display_names(&repo.full_name, key);
        let content = CardContent {
            owner,
            name,
            description: repo.description,
            stars: metadata.stars,
            forks: metadata.forks,
            issues: metadata.issues,
            contributors,
            avatar,
        };

        let renderer = Arc::clone(&self.renderer);
        let png = tokio::task::spawn_blocking(move || renderer.render(&content))
            .await
            .map_err(|e| CardError::Internal(format!("render task failed: {e}")))??;

        debug!(
            repo = %key,
            size_bytes = png.len(),
            rate_limit_remaining = self.client.rate_limit().remaining(),
            "card rendered"
        );
        Ok(GeneratedCard {
            bytes: Bytes::from(png),
            metadata,
        })
    }
}

/// Owner and repository name as GitHub spells them.  Cache keys are
/// lowercased, so the title comes from `full_name` when it is usable.
fn display_names(full_name: &str, key: &CacheKey) -> (String, String) {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            (owner.to_string(), name.to_string())
        }
        _ => (key.owner().to_string(), key.repo().to_string()),
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Outcome {
        Succeed,
        Fail(CardError),
        Hang,
        Panic,
    }

    /// Generator that counts invocations and produces `card-{n}` bytes, so
    /// every successful call yields a distinct etag.
    pub struct FakeGenerator {
        calls: AtomicUsize,
        delay: Mutex<Duration>,
        outcome: Mutex<Outcome>,
    }

    impl FakeGenerator {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Mutex::new(Duration::ZERO),
                outcome: Mutex::new(Outcome::Succeed),
            }
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock() = delay;
            self
        }

        pub fn set_outcome(&self, outcome: Outcome) {
            *self.outcome.lock() = outcome;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CardGenerator for FakeGenerator {
        async fn generate(&self, _key: &CacheKey) -> Result<GeneratedCard, CardError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = self.outcome.lock().clone();
            match outcome {
                Outcome::Succeed => Ok(GeneratedCard {
                    bytes: Bytes::from(format!("card-{n}")),
                    metadata: RepoMetadata {
                        description: "Widgets for everyone".into(),
                        stars: n as u64,
                        ..RepoMetadata::default()
                    },
                }),
                Outcome::Fail(err) => Err(err),
                Outcome::Hang => std::future::pending().await,
                Outcome::Panic => panic!("generator exploded"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_keeps_upstream_casing() {
        let key = CacheKey::new("microsoft", "TypeScript").unwrap();
        assert_eq!(key.repo(), "typescript");
        assert_eq!(
            display_names("microsoft/TypeScript", &key),
            ("microsoft".to_string(), "TypeScript".to_string())
        );
    }

    #[test]
    fn title_falls_back_to_key_without_full_name() {
        let key = CacheKey::new("Acme", "Widgets").unwrap();
        for full_name in ["", "acme", "/widgets", "acme/", "a/b/c"] {
            assert_eq!(
                display_names(full_name, &key),
                ("acme".to_string(), "widgets".to_string()),
                "{full_name:?}"
            );
        }
    }
}
