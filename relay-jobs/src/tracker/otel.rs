//! OpenTelemetry export for attempt metrics (feature `otel-metrics`).

use std::sync::Arc;

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// OpenTelemetry instruments fed by the execution tracker.
pub struct MetricsCollector {
    attempts_succeeded: Counter<u64>,
    attempts_failed: Counter<u64>,
    execution_duration: Histogram<u64>,
    queue_wait: Histogram<u64>,
}

impl MetricsCollector {
    /// Build the instrument set on a meter.
    #[must_use]
    pub fn new(meter: &Meter) -> Arc<Self> {
        Arc::new(Self {
            attempts_succeeded: meter
                .u64_counter("relay_jobs.attempts.succeeded")
                .with_description("Attempts that settled successfully")
                .build(),
            attempts_failed: meter
                .u64_counter("relay_jobs.attempts.failed")
                .with_description("Attempts that settled with a failure")
                .build(),
            execution_duration: meter
                .u64_histogram("relay_jobs.attempts.execution_duration_ms")
                .with_description("Attempt execution duration in milliseconds")
                .build(),
            queue_wait: meter
                .u64_histogram("relay_jobs.attempts.queue_wait_ms")
                .with_description("Time attempts spend queued before a worker picks them up")
                .build(),
        })
    }

    /// Record one settled attempt.
    pub fn record_attempt(
        &self,
        job_type: &str,
        queue_ms: u64,
        execution_ms: u64,
        success: bool,
    ) {
        let attributes = &[
            opentelemetry::KeyValue::new("job_type", job_type.to_string()),
            opentelemetry::KeyValue::new("success", success),
        ];
        if success {
            self.attempts_succeeded.add(1, attributes);
        } else {
            self.attempts_failed.add(1, attributes);
        }
        self.execution_duration.record(execution_ms, attributes);
        self.queue_wait.record(queue_ms, attributes);
    }
}
