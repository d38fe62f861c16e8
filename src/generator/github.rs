//! GitHub REST API client used to gather the facts printed on a card.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::config::GitHubConfig;
use crate::error::CardError;

use super::rate_limit::RateLimitState;

const ACCEPT: &str = "application/vnd.github+json";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoResponse {
    #[serde(default)]
    pub full_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    #[serde(default)]
    pub owner: OwnerResponse,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerResponse {
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
    rate_limit: RateLimitState,
    rate_limit_buffer: u32,
}

impl GitHubClient {
    /// Build a client from configuration.  The API token, if any, is read
    /// from the environment variable named by `token_env`.
    pub fn new(config: &GitHubConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!(
                token_env = %config.token_env,
                "no GitHub token configured; unauthenticated rate limits apply"
            );
        }

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            rate_limit: RateLimitState::new(),
            rate_limit_buffer: config.rate_limit_buffer,
        })
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// `GET /repos/{owner}/{repo}`.
    pub async fn fetch_repo(&self, key: &CacheKey) -> Result<RepoResponse, CardError> {
        let url = format!("{}/repos/{}/{}", self.api_url, key.owner(), key.repo());
        let resp = self.api_get(&url).await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(CardError::UpstreamNotFound(key.to_string()));
        }
        if !status.is_success() {
            return Err(self.failure_for(status));
        }

        let repo: RepoResponse = resp
            .json()
            .await
            .map_err(|e| CardError::transient(format!("failed to decode repository response: {e}")))?;
        debug!(repo = %key, full_name = %repo.full_name, "repository metadata fetched");
        Ok(repo)
    }

    /// Number of contributors, read from the `rel="last"` page of a
    /// one-per-page listing.  A non-success reply counts as zero.
    pub async fn fetch_contributor_count(&self, key: &CacheKey) -> Result<u64, CardError> {
        let url = format!(
            "{}/repos/{}/{}/contributors?per_page=1&anon=1",
            self.api_url,
            key.owner(),
            key.repo()
        );
        let resp = self.api_get(&url).await?;
        let status = resp.status();

        if status == StatusCode::NO_CONTENT || !status.is_success() {
            debug!(repo = %key, %status, "no contributor listing");
            return Ok(0);
        }

        if let Some(last) = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(last_page_from_link)
        {
            return Ok(last);
        }

        let page: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| CardError::transient(format!("failed to decode contributors: {e}")))?;
        Ok(page.len() as u64)
    }

    /// Download the owner's avatar image.
    pub async fn download_avatar(&self, url: &str) -> Result<Bytes, CardError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(CardError::transient(format!("avatar download returned {}", resp.status())));
        }
        resp.bytes().await.map_err(request_error)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn api_get(&self, url: &str) -> Result<reqwest::Response, CardError> {
        self.rate_limit.check(self.rate_limit_buffer)?;

        let mut req = self.http.get(url).header(reqwest::header::ACCEPT, ACCEPT);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(request_error)?;
        self.rate_limit.update_from_headers(resp.headers());
        Ok(resp)
    }

    fn failure_for(&self, status: StatusCode) -> CardError {
        let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && self.rate_limit.remaining() == 0);
        if rate_limited {
            let retry_after = self.rate_limit.retry_after_secs();
            warn!(%status, retry_after, "GitHub API rate limit hit");
            return CardError::UpstreamTransient {
                message: "GitHub API rate limit exceeded".to_string(),
                retry_after_secs: (retry_after > 0).then_some(retry_after),
            };
        }
        warn!(%status, "GitHub API returned non-success status");
        CardError::transient(format!("GitHub API returned {status}"))
    }
}

fn request_error(err: reqwest::Error) -> CardError {
    if err.is_timeout() {
        CardError::transient("GitHub request timed out")
    } else {
        CardError::transient(format!("GitHub request failed: {err}"))
    }
}

/// Extract the `page` query parameter of the `rel="last"` entry of a `Link`
/// header.
pub fn last_page_from_link(link: &str) -> Option<u64> {
    link.split(',')
        .find(|part| part.contains("rel=\"last\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part[start..].find('>')? + start;
            let (_, query) = part[start..end].split_once('?')?;
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == "page")
                .and_then(|(_, value)| value.parse().ok())
        })
}
