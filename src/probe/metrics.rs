//! Probe Metrics
//!
//! Prometheus counters for add events and store mutations, kept in a
//! registry owned by the probe so several probes can coexist in tests.

use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported by the probe
#[derive(Clone)]
pub struct ProbeMetrics {
    registry: Registry,
    add_events: IntCounterVec,
    store_operations: IntCounterVec,
}

impl ProbeMetrics {
    /// Create the counters and register them in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let add_events = IntCounterVec::new(
            Opts::new("ndm_probe_add_events_total", "Add events processed by outcome"),
            &["outcome"],
        )?;
        let store_operations = IntCounterVec::new(
            Opts::new(
                "ndm_probe_store_operations_total",
                "Store and disk mutations issued by operation",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(add_events.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;

        Ok(Self {
            registry,
            add_events,
            store_operations,
        })
    }

    #[inline]
    pub fn record_event(&self, outcome: &str) {
        self.add_events.with_label_values(&[outcome]).inc();
    }

    #[inline]
    pub fn record_store_operation(&self, operation: &str) {
        self.store_operations.with_label_values(&[operation]).inc();
    }

    pub fn event_count(&self, outcome: &str) -> u64 {
        self.add_events.with_label_values(&[outcome]).get()
    }

    pub fn store_operation_count(&self, operation: &str) -> u64 {
        self.store_operations.with_label_values(&[operation]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for ProbeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeMetrics").finish_non_exhaustive()
    }
}
