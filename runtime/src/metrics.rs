//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the relay, the consumer/dispatcher, and the
//! generic retry primitive. Library code (`substrate-core`, `substrate-postgres`,
//! `substrate-redis-streams`) only ever calls the `metrics::counter!`/`histogram!` macros
//! directly; this module's [`MetricsServer`] is what binary entry points use to install the
//! exporter and expose the HTTP scrape endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use substrate_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be installed or the server cannot bind.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "metrics server started");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Outbox metrics
    describe_counter!("outbox_appended_total", "Events staged into the outbox");
    describe_counter!("outbox_published_total", "Outbox rows marked published");
    describe_counter!("outbox_retry_total", "Outbox rows returned to pending after a publish failure");
    describe_counter!("outbox_failed_total", "Outbox rows that exhausted retries");
    describe_counter!("outbox_reclaimed_total", "Outbox rows reclaimed from a stuck publishing state");

    // Relay metrics
    describe_counter!("relay_batches_total", "Relay poll iterations");
    describe_histogram!("relay_batch_duration_seconds", "Time taken to process one relay batch");

    // Transport metrics
    describe_counter!("transport_published_total", "Entries appended to a stream");
    describe_counter!("transport_claimed_stale_total", "Pending entries reclaimed via XCLAIM");

    // Ledger metrics
    describe_counter!("ledger_recorded_total", "Events recorded as processed");
    describe_counter!("ledger_duplicate_detected_total", "Duplicate RecordProcessed attempts");

    // Dispatcher metrics
    describe_counter!("dispatcher_commits_total", "Entries committed and acked");
    describe_counter!("dispatcher_duplicate_acks_total", "Entries acked without dispatch (already processed)");
    describe_counter!("dispatcher_retries_total", "Entries that aborted and will be redelivered");
    describe_counter!("dispatcher_parked_total", "Entries parked to the dead-letter table");
    describe_histogram!("dispatcher_handler_duration_seconds", "Time taken to run a handler chain for one entry");

    // Dead-letter metrics
    describe_counter!("dead_letter_parked_total", "Entries written to the dead-letter table");

    // Retry metrics (generic backoff primitive)
    describe_counter!("retry_attempts_total", "Retry attempts across all retrying callers");
    describe_counter!("retry_successes_total", "Retries that eventually succeeded");
    describe_counter!("retry_exhausted_total", "Retries that exhausted max_retries");
}

/// Relay metrics recorder.
pub struct RelayMetrics;

impl RelayMetrics {
    /// Record one relay batch iteration.
    pub fn record_batch(duration: Duration) {
        counter!("relay_batches_total").increment(1);
        histogram!("relay_batch_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record a successful commit-and-ack.
    pub fn record_commit(duration: Duration) {
        counter!("dispatcher_commits_total").increment(1);
        histogram!("dispatcher_handler_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an ack of an already-processed entry.
    pub fn record_duplicate_ack() {
        counter!("dispatcher_duplicate_acks_total").increment(1);
    }

    /// Record an abort that will be retried.
    pub fn record_retry() {
        counter!("dispatcher_retries_total").increment(1);
    }

    /// Record an entry parked to the dead-letter table.
    pub fn record_parked() {
        counter!("dispatcher_parked_total").increment(1);
    }
}

/// Retry metrics recorder, shared by the relay's backoff loop and any other caller of
/// [`crate::retry::retry_with_backoff`].
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_server_creation_has_no_handle_until_started() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn metrics_server_start_does_not_error() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        assert!(server.start().is_ok());
    }

    #[tokio::test]
    async fn relay_and_dispatcher_metrics_render_when_handle_present() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        RelayMetrics::record_batch(Duration::from_millis(50));
        DispatcherMetrics::record_commit(Duration::from_millis(10));

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("relay_batches_total"));
            assert!(rendered.contains("dispatcher_commits_total"));
        }
    }
}
