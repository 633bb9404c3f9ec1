//! Status and metrics reporting.
//!
//! The server reports protocol events through a [`StatusSink`]. Every call is
//! fire-and-forget: implementations must return quickly and never block
//! protocol progress.

use std::time::Duration;

/// Receiver of protocol events.
///
/// All methods default to no-ops so implementations only override what they
/// care about.
pub trait StatusSink: Send + Sync + 'static {
    /// A connection reported (or was deemed to have) the given nonce or
    /// version for a type.
    fn register_event(&self, _connection_id: &str, _type_url: &str, _nonce: &str) {}

    /// A client rejected a response.
    fn record_reject(&self, _type_url: &str, _code: i32) {}

    /// A push was deferred, or forced after the flow control timeout.
    fn record_delayed_push(&self, _type_url: &str) {}

    /// A request echoed a nonce other than the last one sent.
    fn record_expired_nonce(&self, _type_url: &str) {}

    /// A request's nonce disagreed with whether its subscription changed.
    fn record_ack_mismatch(&self, _type_url: &str) {}

    /// A response was sent.
    fn record_push(&self, _type_url: &str, _duration: Duration, _size: usize) {}

    /// A push event was handled; `delay` is the time since it was triggered.
    fn record_convergence(&self, _delay: Duration) {}

    /// Writing a response failed.
    fn record_send_error(&self, _type_url: &str) {}

    /// A stream failed unexpectedly.
    fn record_internal_error(&self) {}
}

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {}

/// A sink that records events through the [`metrics`] facade.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsStatusSink;

#[cfg(feature = "metrics")]
impl StatusSink for MetricsStatusSink {
    fn record_reject(&self, type_url: &str, code: i32) {
        metrics::counter!(
            "xds_rejects_total",
            "type" => crate::type_url::short_name(type_url).to_string(),
            "code" => code.to_string()
        )
        .increment(1);
    }

    fn record_delayed_push(&self, type_url: &str) {
        metrics::counter!(
            "xds_delayed_pushes_total",
            "type" => crate::type_url::short_name(type_url).to_string()
        )
        .increment(1);
    }

    fn record_expired_nonce(&self, type_url: &str) {
        metrics::counter!(
            "xds_expired_nonce_total",
            "type" => crate::type_url::short_name(type_url).to_string()
        )
        .increment(1);
    }

    fn record_ack_mismatch(&self, type_url: &str) {
        metrics::counter!(
            "xds_ack_mismatch_total",
            "type" => crate::type_url::short_name(type_url).to_string()
        )
        .increment(1);
    }

    fn record_push(&self, type_url: &str, duration: Duration, size: usize) {
        let short = crate::type_url::short_name(type_url).to_string();
        metrics::histogram!("xds_push_time_seconds", "type" => short.clone())
            .record(duration.as_secs_f64());
        metrics::histogram!("xds_config_size_bytes", "type" => short).record(size as f64);
    }

    fn record_convergence(&self, delay: Duration) {
        metrics::histogram!("xds_proxy_convergence_delay_seconds").record(delay.as_secs_f64());
    }

    fn record_send_error(&self, type_url: &str) {
        metrics::counter!(
            "xds_write_timeouts_total",
            "type" => crate::type_url::short_name(type_url).to_string()
        )
        .increment(1);
    }

    fn record_internal_error(&self) {
        metrics::counter!("xds_internal_errors_total").increment(1);
    }
}
