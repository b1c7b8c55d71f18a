//! Prometheus metrics for the voting pipeline.
//!
//! [`VotingMetrics`] owns its own [`Registry`], so every pipeline (and every
//! test) counts in isolation. `GET /metrics` encodes it in the Prometheus
//! text exposition format.

use std::time::Duration;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};

use crate::admission::AdmissionStats;

/// Counters, gauges and histograms written by the voting pipeline.
pub struct VotingMetrics {
    pub registry: Registry,

    pub votes_total: IntCounter,
    pub votes_success: IntCounter,
    pub votes_failed: IntCounter,
    pub rate_limit_hits: IntCounter,
    pub circuit_breaker_trips: IntCounter,

    /// Live rate buckets per traffic class, refreshed on export.
    pub voting_buckets: IntGauge,
    pub query_buckets: IntGauge,
    pub admin_buckets: IntGauge,

    /// Time to store one vote, in milliseconds.
    pub vote_processing_time_ms: Histogram,
    /// Time to process a whole batch, in milliseconds.
    pub batch_processing_time_ms: Histogram,
}

impl VotingMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let votes_total = register_int_counter_with_registry!(
            Opts::new("votes_total", "Votes handed to the processor"),
            registry
        )
        .expect("failed to register votes_total counter");

        let votes_success = register_int_counter_with_registry!(
            Opts::new("votes_success_total", "Votes stored successfully"),
            registry
        )
        .expect("failed to register votes_success counter");

        let votes_failed = register_int_counter_with_registry!(
            Opts::new("votes_failed_total", "Votes that failed to store"),
            registry
        )
        .expect("failed to register votes_failed counter");

        let rate_limit_hits = register_int_counter_with_registry!(
            Opts::new("ratelimit_hits_total", "Requests rejected by admission control"),
            registry
        )
        .expect("failed to register rate_limit_hits counter");

        let circuit_breaker_trips = register_int_counter_with_registry!(
            Opts::new(
                "circuitbreaker_trips_total",
                "Times a store circuit breaker opened"
            ),
            registry
        )
        .expect("failed to register circuit_breaker_trips counter");

        let voting_buckets = register_int_gauge_with_registry!(
            Opts::new("ratelimit_voting_buckets", "Live voting rate buckets"),
            registry
        )
        .expect("failed to register voting_buckets gauge");

        let query_buckets = register_int_gauge_with_registry!(
            Opts::new("ratelimit_query_buckets", "Live query rate buckets"),
            registry
        )
        .expect("failed to register query_buckets gauge");

        let admin_buckets = register_int_gauge_with_registry!(
            Opts::new("ratelimit_admin_buckets", "Live admin rate buckets"),
            registry
        )
        .expect("failed to register admin_buckets gauge");

        // 0.5 ms up to roughly 8 s.
        let vote_processing_time_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "vote_processing_time_ms",
                "Time to store a single vote in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(0.5, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register vote_processing_time_ms histogram");

        // 1 ms up to roughly 16 s.
        let batch_processing_time_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "vote_batch_processing_time_ms",
                "Time to process a vote batch in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register batch_processing_time_ms histogram");

        Self {
            registry,
            votes_total,
            votes_success,
            votes_failed,
            rate_limit_hits,
            circuit_breaker_trips,
            voting_buckets,
            query_buckets,
            admin_buckets,
            vote_processing_time_ms,
            batch_processing_time_ms,
        }
    }

    pub fn observe_vote(&self, elapsed: Duration) {
        self.vote_processing_time_ms.observe(as_millis(elapsed));
    }

    pub fn observe_batch(&self, elapsed: Duration) {
        self.batch_processing_time_ms.observe(as_millis(elapsed));
    }

    pub fn set_rate_buckets(&self, stats: &AdmissionStats) {
        self.voting_buckets.set(gauge_value(stats.voting_buckets));
        self.query_buckets.set(gauge_value(stats.query_buckets));
        self.admin_buckets.set(gauge_value(stats.admin_buckets));
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for VotingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn as_millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

fn gauge_value(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
