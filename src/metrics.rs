//! Lightweight in-process counters for connects and statements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct DispatchMetrics {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    queries: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    pool_reuses: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static DISPATCH_METRICS: OnceLock<DispatchMetrics> = OnceLock::new();

fn metrics() -> &'static DispatchMetrics {
    DISPATCH_METRICS.get_or_init(DispatchMetrics::default)
}

pub fn record_connect(success: bool) {
    let metrics = metrics();
    metrics.connects.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_query(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.queries.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);
    metrics
        .duration_max_ms
        .fetch_max(duration_ms, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_pool_reuse() {
    metrics().pool_reuses.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connects: u64,
    pub connect_failures: u64,
    pub queries: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub pool_reuses: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> MetricsSnapshot {
    let metrics = metrics();
    let queries = metrics.queries.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    MetricsSnapshot {
        connects: metrics.connects.load(Ordering::Relaxed),
        connect_failures: metrics.connect_failures.load(Ordering::Relaxed),
        queries,
        failed: metrics.failed.load(Ordering::Relaxed),
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        pool_reuses: metrics.pool_reuses.load(Ordering::Relaxed),
        avg_ms: (queries > 0).then(|| duration_total as f64 / queries as f64),
        max_ms: (max_ms > 0).then_some(max_ms),
    }
}
