//! Store metrics.
//!
//! One `StoreMetrics` per store instance, backed by its own prometheus
//! registry: error counters labeled by error kind, a latency histogram per
//! backend event type, and counters for observable watch recoveries and
//! transaction retries.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

use crate::error::StoreError;

/// Backend event types observed by the latency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Get,
    Create,
    SetData,
    Delete,
    Children,
    Exists,
    Multi,
    Watch,
}

impl BackendEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendEvent::Get => "get",
            BackendEvent::Create => "create",
            BackendEvent::SetData => "set_data",
            BackendEvent::Delete => "delete",
            BackendEvent::Children => "children",
            BackendEvent::Exists => "exists",
            BackendEvent::Multi => "multi",
            BackendEvent::Watch => "watch",
        }
    }
}

/// Metrics for one store instance.
pub struct StoreMetrics {
    registry: Registry,
    errors: IntCounterVec,
    backend_latency: HistogramVec,
    observable_recoveries: IntCounter,
    tx_retries: IntCounter,
}

impl StoreMetrics {
    /// Create and register the full metric set on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let errors = IntCounterVec::new(
            Opts::new("topograph_errors_total", "Errors surfaced to callers"),
            &["kind"],
        )?;
        let backend_latency = HistogramVec::new(
            HistogramOpts::new(
                "topograph_backend_seconds",
                "Latency of coordination backend calls",
            )
            .buckets(prometheus::exponential_buckets(0.0001, 2.0, 16)?),
            &["event"],
        )?;
        let observable_recoveries = IntCounter::new(
            "topograph_observable_recoveries_total",
            "Watcher re-establishments after transient closure",
        )?;
        let tx_retries = IntCounter::new(
            "topograph_tx_retries_total",
            "Transaction bodies re-run after concurrent modification",
        )?;

        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(backend_latency.clone()))?;
        registry.register(Box::new(observable_recoveries.clone()))?;
        registry.register(Box::new(tx_retries.clone()))?;

        Ok(StoreMetrics {
            registry,
            errors,
            backend_latency,
            observable_recoveries,
            tx_retries,
        })
    }

    /// The registry holding this store's metrics, for scraping/export.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_error(&self, err: &StoreError) {
        self.errors.with_label_values(&[err.kind()]).inc();
    }

    pub fn observe_backend(&self, event: BackendEvent, elapsed: Duration) {
        self.backend_latency
            .with_label_values(&[event.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_observable_recovery(&self) {
        self.observable_recoveries.inc();
    }

    pub fn observable_recoveries(&self) -> u64 {
        self.observable_recoveries.get()
    }

    pub fn record_tx_retry(&self) {
        self.tx_retries.inc();
    }

    pub fn tx_retries(&self) -> u64 {
        self.tx_retries.get()
    }
}
