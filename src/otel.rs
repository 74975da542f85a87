// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Metrics for Consumed Events
//!
//! [`EventMetrics`] is the sink the metrics middleware reports to. The
//! OpenTelemetry implementation builds its instruments from a [`Meter`]
//! handed in by the host, so the library never registers global state.

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use std::time::Duration;

/// Attribute carrying the queue name on every instrument.
pub const QUEUE_NAME_ATTRIBUTE: &str = "queue_name";

/// Per-queue event accounting.
#[cfg_attr(test, mockall::automock)]
pub trait EventMetrics: Send + Sync {
    fn event_received(&self, queue: &str);
    fn event_processed(&self, queue: &str);
    fn event_failed(&self, queue: &str);
    fn processing_time(&self, queue: &str, elapsed: Duration);
}

/// OpenTelemetry backed [`EventMetrics`].
pub struct OtelEventMetrics {
    events_total: Counter<u64>,
    events_processed_total: Counter<u64>,
    events_failed_total: Counter<u64>,
    events_processing_time: Histogram<f64>,
}

impl OtelEventMetrics {
    pub fn new(meter: &Meter) -> OtelEventMetrics {
        OtelEventMetrics {
            events_total: meter
                .u64_counter("events_total")
                .with_description("events received per queue")
                .build(),
            events_processed_total: meter
                .u64_counter("events_processed_total")
                .with_description("events handled successfully per queue")
                .build(),
            events_failed_total: meter
                .u64_counter("events_failed_total")
                .with_description("events whose handler failed per queue")
                .build(),
            events_processing_time: meter
                .f64_histogram("events_processing_time")
                .with_description("handler duration per queue")
                .with_unit("s")
                .build(),
        }
    }
}

fn labels(queue: &str) -> [KeyValue; 1] {
    [KeyValue::new(QUEUE_NAME_ATTRIBUTE, queue.to_owned())]
}

impl EventMetrics for OtelEventMetrics {
    fn event_received(&self, queue: &str) {
        self.events_total.add(1, &labels(queue));
    }

    fn event_processed(&self, queue: &str) {
        self.events_processed_total.add(1, &labels(queue));
    }

    fn event_failed(&self, queue: &str) {
        self.events_failed_total.add(1, &labels(queue));
    }

    fn processing_time(&self, queue: &str, elapsed: Duration) {
        self.events_processing_time
            .record(elapsed.as_secs_f64(), &labels(queue));
    }
}
