//! Main axum router and HTTP request handlers for the card service.
//!
//! Routes:
//! - `GET  /cards/{owner}/{repo}`  - Card image (alias `/github/{owner}/{repo}`)
//! - `DELETE /cards/{owner}/{repo}` - Drop the stored card
//! - `POST /generate`              - Synchronous generation (alias `/api/generate`)
//! - `GET  /health`                - Liveness (alias `/api/health`)
//! - `GET  /metrics`               - Prometheus metrics

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::cards::CardResponse;
use crate::cache::{ArtifactRecord, CacheKey};
use crate::error::CardError;
use crate::generator::RepoMetadata;
use crate::AppState;

const CARD_CACHE_HEADER: &str = "x-card-cache";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Card images
        .route("/cards/{owner}/{repo}", get(handle_card).delete(handle_evict))
        .route("/github/{owner}/{repo}", get(handle_card))
        // JSON API
        .route("/generate", post(handle_generate))
        .route("/api/generate", post(handle_generate))
        // Health, metrics
        .route("/health", get(handle_health))
        .route("/api/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    repo_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    success: bool,
    message: String,
    data: GenerateData,
}

#[derive(Debug, Serialize)]
struct GenerateData {
    owner: String,
    repo_name: String,
    image_url: String,
    filename: String,
    repo_info: RepoMetadata,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /cards/{owner}/{repo}`
///
/// Serves the stored card, generating it first when none exists.  A stale
/// card is served as-is while a refresh runs in the background.
#[instrument(skip(state, headers), fields(%owner, %repo))]
async fn handle_card(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let key = CacheKey::new(&owner, &repo)?;
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    let card = state.cards.serve(&key, if_none_match).await?;
    debug!(
        repo = %key,
        source = card.source.as_str(),
        not_modified = card.not_modified(),
        "card request answered"
    );
    Ok(card_response(card))
}

/// `DELETE /cards/{owner}/{repo}`
///
/// Removes the stored card so the next request regenerates it.
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_evict(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let key = CacheKey::new(&owner, &repo)?;
    match state.cards.evict(&key).await {
        Some(record) => {
            info!(repo = %key, etag = %record.etag, "card evicted on request");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        None => Err(AppError::NotFound(format!("no stored card for {key}"))),
    }
}

/// `POST /generate`
///
/// Accepts `{"repo_url": "..."}` and returns the card's location and the
/// repository facts printed on it.
#[instrument(skip(state, body))]
async fn handle_generate(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let key = CacheKey::from_repo_url(&request.repo_url)?;

    info!(repo = %key, "generation requested");
    let record = state.cards.generate(&key).await?;

    Ok(Json(generate_response(&record)).into_response())
}

/// `GET /health`
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    state
        .metrics
        .metrics
        .cards_stored
        .set(state.cards.coordinator().store().len() as i64);
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn card_response(card: CardResponse) -> Response {
    let status = if card.not_modified() {
        StatusCode::NOT_MODIFIED
    } else {
        StatusCode::OK
    };
    let cache_control = format!(
        "public, max-age={}, must-revalidate",
        card.max_age.as_secs()
    );

    let mut response = match card.body {
        Some(bytes) => Response::new(Body::from(bytes)),
        None => Response::new(Body::empty()),
    };
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if status == StatusCode::OK {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    }
    insert_header(headers, header::ETAG, &card.record.etag);
    insert_header(headers, header::CACHE_CONTROL, &cache_control);
    insert_header(headers, header::LAST_MODIFIED, &http_date(card.record.created_at));
    headers.insert(
        CARD_CACHE_HEADER,
        HeaderValue::from_static(card.source.as_str()),
    );
    response
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(e) => warn!(%name, error = %e, "dropping unrepresentable header value"),
    }
}

/// IMF-fixdate, as used by `Last-Modified`.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn generate_response(record: &ArtifactRecord) -> GenerateResponse {
    let key = &record.key;
    GenerateResponse {
        success: true,
        message: format!("Card for {key} is ready"),
        data: GenerateData {
            owner: key.owner().to_string(),
            repo_name: key.repo().to_string(),
            image_url: format!("/cards/{}/{}", key.owner(), key.repo()),
            filename: record.file_name(),
            repo_info: record.metadata.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Unified error type for HTTP handlers.  Every variant renders as a JSON
/// `{"detail": ...}` body.
#[derive(Debug)]
pub enum AppError {
    /// Failure classified by the card pipeline.
    Card(CardError),
    /// The request body could not be understood.
    BadRequest(String),
    /// Nothing to act on.
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail, retry_after) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"), None)
            }
            AppError::Card(err) => {
                let status = match &err {
                    CardError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
                    CardError::UpstreamNotFound(_) => StatusCode::NOT_FOUND,
                    CardError::UpstreamTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    CardError::Storage(_) | CardError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    warn!(error = %err, kind = err.kind(), "card request failed");
                }
                let retry_after = match &err {
                    CardError::UpstreamTransient {
                        retry_after_secs, ..
                    } => *retry_after_secs,
                    _ => None,
                };
                (status, err.to_string(), retry_after)
            }
        };

        let mut response = (status, Json(json!({ "detail": detail }))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<CardError> for AppError {
    fn from(err: CardError) -> Self {
        AppError::Card(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
