//! Prometheus metrics & middleware helper.
//!
//! HTTP metrics come from the `actix-web-prom` middleware; job metrics are
//! registered in the same registry so `/metrics` exposes both.

use actix_web_prom::{PrometheusMetrics, PrometheusMetricsBuilder};
use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

/// Global Prometheus handle reused in tests.
pub static METRICS: Lazy<PrometheusMetrics> = Lazy::new(|| {
    PrometheusMetricsBuilder::new("api")
        .endpoint("/metrics")
        .build()
        .expect("metrics builder")
});

/// Finished job executions by queue and outcome
/// (`completed`, `retried`, `dead`).
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("engine_jobs_total", "Job executions by outcome"),
        &["queue", "outcome"],
    )
    .expect("engine_jobs_total");
    if let Err(e) = METRICS.registry.register(Box::new(counter.clone())) {
        log::warn!("engine_jobs_total not registered: {e}");
    }
    counter
});

pub static JOB_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("engine_job_seconds", "Job processing time"),
        &["queue"],
    )
    .expect("engine_job_seconds");
    if let Err(e) = METRICS.registry.register(Box::new(histogram.clone())) {
        log::warn!("engine_job_seconds not registered: {e}");
    }
    histogram
});

pub fn record_job(queue: &str, outcome: &str, seconds: f64) {
    JOBS_TOTAL.with_label_values(&[queue, outcome]).inc();
    JOB_SECONDS.with_label_values(&[queue]).observe(seconds);
}
