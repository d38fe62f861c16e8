use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CardRequestLabels {
    pub cache_status: CacheStatus,
}

/// How a card request was answered.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    Created,
    Fresh,
    Stale,
    NotModified,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GenerationLabels {
    pub mode: GenerationMode,
    pub outcome: GenerationOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GenerationMode {
    /// A caller waits for the result.
    Blocking,
    /// Triggered by a stale hit; nobody waits.
    Background,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GenerationOutcome {
    Success,
    NotFound,
    Transient,
    Storage,
    Timeout,
    Internal,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the card service.
pub struct Metrics {
    // -- requests --
    pub card_requests_total: Family<CardRequestLabels, Counter>,

    // -- generation --
    pub generations_total: Family<GenerationLabels, Counter>,
    pub generation_duration_seconds: Histogram,
    pub generation_waiters_joined_total: Counter,
    pub background_refresh_skipped_total: Counter,
    pub generations_in_flight: Gauge,

    // -- store --
    pub cards_stored: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let card_requests_total = Family::<CardRequestLabels, Counter>::default();
        registry.register(
            "repocard_card_requests",
            "Card requests by cache status",
            card_requests_total.clone(),
        );

        let generations_total = Family::<GenerationLabels, Counter>::default();
        registry.register(
            "repocard_generations",
            "Card generations by mode and outcome",
            generations_total.clone(),
        );

        let generation_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "repocard_generation_duration_seconds",
            "Card generation latency in seconds",
            generation_duration_seconds.clone(),
        );

        let generation_waiters_joined_total = Counter::default();
        registry.register(
            "repocard_generation_waiters_joined",
            "Requests that joined an in-flight generation instead of starting one",
            generation_waiters_joined_total.clone(),
        );

        let background_refresh_skipped_total = Counter::default();
        registry.register(
            "repocard_background_refresh_skipped",
            "Stale hits that found a regeneration already in flight",
            background_refresh_skipped_total.clone(),
        );

        let generations_in_flight: Gauge = Gauge::default();
        registry.register(
            "repocard_generations_in_flight",
            "Card generations currently running",
            generations_in_flight.clone(),
        );

        let cards_stored: Gauge = Gauge::default();
        registry.register(
            "repocard_cards_stored",
            "Number of cards currently held in the store",
            cards_stored.clone(),
        );

        Self {
            card_requests_total,
            generations_total,
            generation_duration_seconds,
            generation_waiters_joined_total,
            background_refresh_skipped_total,
            generations_in_flight,
            cards_stored,
        }
    }

    pub fn record_request(&self, cache_status: CacheStatus) {
        self.card_requests_total
            .get_or_create(&CardRequestLabels { cache_status })
            .inc();
    }

    pub fn record_generation(&self, mode: GenerationMode, outcome: GenerationOutcome) {
        self.generations_total
            .get_or_create(&GenerationLabels { mode, outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all card metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
