//! Prometheus metrics for the upload pipeline.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no repository names or tokens, but they do expose aggregate
//! upload volume, so keep the endpoint off public networks.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Uploads started, by flow (`single`, `multipart`).
pub static UPLOADS_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "indexgate_uploads_started_total",
            "Total number of upload records created, by flow",
        ),
        &["flow"],
    )
    .expect("metric creation failed")
});

pub static UPLOADS_QUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "indexgate_uploads_queued_total",
        "Total number of uploads handed to processing",
    )
    .expect("metric creation failed")
});

/// Uploads marked failed, by classified reason (`object_store`, `unknown`).
pub static UPLOADS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "indexgate_uploads_failed_total",
            "Total number of uploads marked failed, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static PARTS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "indexgate_parts_received_total",
        "Total number of multipart parts stored",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "indexgate_bytes_received_total",
        "Total payload bytes written to the blob store",
    )
    .expect("metric creation failed")
});

/// Code host check denials, by error code.
pub static AUTH_GATE_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "indexgate_auth_gate_denials_total",
            "Total number of uploads denied by the code host check",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static COMPOSE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "indexgate_compose_duration_seconds",
            "Time taken to compose multipart parts into one payload",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests can build as many routers as they like.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_QUEUED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PARTS_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AUTH_GATE_DENIALS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COMPOSE_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
