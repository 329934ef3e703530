use crate::error::Result;
use crate::fatal::FailureEvent;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;

/// Crash metric registry for a single process instance.
///
/// The registry carries `service` and `instance` as constant labels so every
/// exposed series identifies its origin; the per-series label space is the
/// closed set of failure reasons, so cardinality is fixed and known.
pub struct CrashMetrics {
    registry: Registry,
    crashes: IntCounterVec,
    last_exit_timestamp: IntGaugeVec,
}

impl CrashMetrics {
    /// Construct the registry and register both crash collectors
    pub fn new(service: &str, instance: &str) -> Result<Self> {
        let mut const_labels = HashMap::new();
        const_labels.insert("service".to_string(), service.to_string());
        const_labels.insert("instance".to_string(), instance.to_string());

        let registry = Registry::new_custom(None, Some(const_labels))?;

        let crashes = IntCounterVec::new(
            Opts::new("process_crashes_total", "Fatal process events by reason"),
            &["reason"],
        )?;
        let last_exit_timestamp = IntGaugeVec::new(
            Opts::new(
                "process_last_exit_timestamp_seconds",
                "Unix timestamp of the most recent fatal event by reason",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(crashes.clone()))?;
        registry.register(Box::new(last_exit_timestamp.clone()))?;

        Ok(Self {
            registry,
            crashes,
            last_exit_timestamp,
        })
    }

    /// Record a fatal event: bump the crash counter for the event's reason by
    /// exactly one and move the last-exit gauge to the event's timestamp.
    /// Synchronous and infallible; no I/O happens here.
    pub fn record(&self, event: &FailureEvent) {
        let reason = event.kind.reason();
        self.crashes.with_label_values(&[reason]).inc();
        self.last_exit_timestamp
            .with_label_values(&[reason])
            .set(event.occurred_at.timestamp());
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::BlackboxError::system(format!("metrics not UTF-8: {}", e)))
    }

    /// Content type of the exposition format, for the scrape endpoint
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    /// Current crash counter value for a reason
    pub fn crash_count(&self, reason: &str) -> u64 {
        self.crashes.with_label_values(&[reason]).get()
    }

    /// Current last-exit gauge value for a reason
    pub fn last_exit(&self, reason: &str) -> i64 {
        self.last_exit_timestamp.with_label_values(&[reason]).get()
    }
}
