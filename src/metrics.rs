//! Metrics for the fetch, ledger and dispatch phases.
//!
//! Recording is always on; without an installed recorder the calls are
//! no-ops. The Prometheus exporter is installed only when
//! `NOTIFY_METRICS_ADDR` is set.

use std::net::SocketAddr;
use tracing::{info, warn};

pub fn init_metrics() {
    let addr_str = match std::env::var("NOTIFY_METRICS_ADDR") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return,
    };
    let addr: SocketAddr = match addr_str.trim().parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid NOTIFY_METRICS_ADDR '{}': {}", addr_str, e);
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed: {}", e),
    }
}

// ============================================================================
// Fetch Metrics
// ============================================================================

pub mod fetch {
    pub fn repository_checked() {
        ::metrics::counter!("notify_fetch_repositories_checked_total").increment(1);
    }

    pub fn new_release() {
        ::metrics::counter!("notify_fetch_new_releases_total").increment(1);
    }

    pub fn no_qualifying_release() {
        ::metrics::counter!("notify_fetch_no_release_total").increment(1);
    }

    pub fn lookup_error() {
        ::metrics::counter!("notify_fetch_errors_total").increment(1);
    }

    pub fn rate_limited() {
        ::metrics::counter!("notify_fetch_rate_limited_total").increment(1);
    }

    pub fn lookup_duration(secs: f64) {
        ::metrics::histogram!("notify_fetch_lookup_duration_seconds").record(secs);
    }

    pub fn batch_duration(secs: f64) {
        ::metrics::histogram!("notify_fetch_batch_duration_seconds").record(secs);
    }
}

// ============================================================================
// Ledger Metrics
// ============================================================================

pub mod ledger {
    pub fn committed() {
        ::metrics::counter!("notify_ledger_commits_total").increment(1);
    }

    pub fn unchanged() {
        ::metrics::counter!("notify_ledger_unchanged_total").increment(1);
    }

    pub fn persist_error() {
        ::metrics::counter!("notify_ledger_persist_errors_total").increment(1);
    }
}

// ============================================================================
// Dispatch Metrics
// ============================================================================

pub mod dispatch {
    pub fn delivered(channel: &str) {
        ::metrics::counter!("notify_dispatch_delivered_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn delivery_error(channel: &str) {
        ::metrics::counter!("notify_dispatch_errors_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn throttled(channel: &str) {
        ::metrics::counter!("notify_dispatch_throttled_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn skipped(channel: &str) {
        ::metrics::counter!("notify_dispatch_skipped_total", "channel" => channel.to_string()).increment(1);
    }

    pub fn delivery_duration(channel: &str, secs: f64) {
        ::metrics::histogram!("notify_dispatch_delivery_duration_seconds", "channel" => channel.to_string())
            .record(secs);
    }
}
