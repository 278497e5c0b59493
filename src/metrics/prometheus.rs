//! Prometheus metrics registration and export.
//!
//! Recording helpers are no-ops until [`init_metrics`] has run, so library
//! code can record unconditionally.

use prometheus::{CounterVec, Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

use crate::connection::LinkState;

/// Global Prometheus registry for all dispatchq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Connection acquisitions, labeled by outcome (ok, error).
pub static CONNECTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Reconnect attempts made by the monitor.
pub static RECONNECT_ATTEMPTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Current link state (0 connected, 1 degraded, 2 retrying, 3 unrecoverable).
pub static LINK_STATE: OnceLock<IntGauge> = OnceLock::new();

/// Lock operations, labeled by operation and outcome.
pub static LOCK_OPERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; later calls keep the first
/// registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let connections_total = CounterVec::new(
        Opts::new(
            "dispatchq_store_connections_total",
            "Connection acquisitions from the store pool",
        ),
        &["outcome"],
    )?;

    let reconnect_attempts_total = IntCounter::new(
        "dispatchq_store_reconnect_attempts_total",
        "Reconnect attempts made by the connection monitor",
    )?;

    let link_state = IntGauge::new(
        "dispatchq_store_link_state",
        "Store link state (0 connected, 1 degraded, 2 retrying, 3 unrecoverable)",
    )?;

    let lock_operations_total = CounterVec::new(
        Opts::new(
            "dispatchq_lock_operations_total",
            "Distributed lock operations",
        ),
        &["operation", "outcome"],
    )?;

    registry.register(Box::new(connections_total.clone()))?;
    registry.register(Box::new(reconnect_attempts_total.clone()))?;
    registry.register(Box::new(link_state.clone()))?;
    registry.register(Box::new(lock_operations_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = CONNECTIONS_TOTAL.set(connections_total);
    let _ = RECONNECT_ATTEMPTS_TOTAL.set(reconnect_attempts_total);
    let _ = LINK_STATE.set(link_state);
    let _ = LOCK_OPERATIONS_TOTAL.set(lock_operations_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Records one pool acquisition.
pub fn record_connection(ok: bool) {
    if let Some(counter) = CONNECTIONS_TOTAL.get() {
        let outcome = if ok { "ok" } else { "error" };
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Records one reconnect attempt.
pub fn record_reconnect_attempt() {
    if let Some(counter) = RECONNECT_ATTEMPTS_TOTAL.get() {
        counter.inc();
    }
}

/// Publishes the current link state.
pub fn record_link_state(state: LinkState) {
    if let Some(gauge) = LINK_STATE.get() {
        let value = match state {
            LinkState::Connected => 0,
            LinkState::Degraded => 1,
            LinkState::Retrying => 2,
            LinkState::Unrecoverable => 3,
        };
        gauge.set(value);
    }
}

/// Records a lock acquire or release outcome.
pub fn record_lock(operation: &str, outcome: &str) {
    if let Some(counter) = LOCK_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        record_connection(true);
        record_connection(false);
        record_reconnect_attempt();
        record_link_state(LinkState::Degraded);
        record_lock("acquire", "held");

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("dispatchq_store_connections_total"));
            assert!(metrics.contains("dispatchq_store_reconnect_attempts_total"));
        }
    }
}
