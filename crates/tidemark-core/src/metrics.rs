//! Prometheus metrics helpers for tidemark.
//!
//! Centralizes recorder installation, the `/metrics` endpoint and the
//! descriptions of every metric the indexer emits.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidemark_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("subscription_messages_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`subscription_`, `indexing_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: low cardinality only (`action`, `kind`, `collection`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `port`.
///
/// Binds before returning so that address conflicts surface to the caller;
/// serving happens on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric emitted by the indexer.
fn register_common_metrics() {
    // =========================================================================
    // Subscription
    // =========================================================================

    describe_counter!(
        "subscription_messages_total",
        "Commit messages fully applied (operations + cursor committed)"
    );
    describe_counter!(
        "subscription_messages_invalid_total",
        "Inbound messages skipped because they failed schema validation"
    );
    describe_counter!(
        "subscription_ops_total",
        "Write operations applied (label: action)"
    );
    describe_counter!(
        "subscription_errors_total",
        "Errors that restarted the subscription cycle (label: kind)"
    );
    describe_counter!(
        "subscription_reconnects_total",
        "Transport-level reconnect attempts"
    );
    describe_counter!(
        "subscription_events_emitted_total",
        "Derived events handed to the event sink"
    );
    describe_counter!(
        "subscription_leader_acquired_total",
        "Times this process acquired the subscription lease"
    );
    describe_counter!(
        "subscription_leader_busy_total",
        "Lease acquisition attempts that found another holder"
    );
    describe_gauge!("subscription_cursor", "Last durably committed sequence number");
    describe_gauge!(
        "subscription_running",
        "Whether the subscription loop is running (1=yes, 0=no)"
    );
    describe_gauge!(
        "subscription_is_leader",
        "Whether this process currently holds the lease (1=yes, 0=no)"
    );
    describe_histogram!(
        "subscription_apply_seconds",
        "Time spent applying one commit message in its transaction"
    );

    // =========================================================================
    // Indexing
    // =========================================================================

    describe_counter!(
        "indexing_duplicates_total",
        "Records shadowed by an existing canonical record (label: collection)"
    );
    describe_counter!(
        "indexing_promotions_total",
        "Duplicates promoted to canonical after a delete (label: collection)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one install can succeed per process
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        let _ = try_init_metrics();
        register_common_metrics();
        register_common_metrics();
    }
}
