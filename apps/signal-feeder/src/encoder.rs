use crate::signal::Sample;
use crate::telemetry::{Metric, TagSet, MEASUREMENT, TEMPERATURE_FIELD};
use chrono::Utc;
use std::sync::Arc;

/// Turns samples into `weather` points tagged with a fixed, shared tag set.
#[derive(Debug, Clone)]
pub struct MetricEncoder {
    tags: Arc<TagSet>,
}

impl MetricEncoder {
    pub fn new(tags: TagSet) -> Self {
        Self {
            tags: Arc::new(tags),
        }
    }

    /// Stamps the point with the wall clock at the moment of encoding.
    pub fn encode(&self, sample: Sample) -> Metric {
        self.encode_at(sample, Utc::now().timestamp_millis())
    }

    pub fn encode_at(&self, sample: Sample, timestamp_ms: i64) -> Metric {
        Metric::with_field(
            MEASUREMENT,
            self.tags.clone(),
            TEMPERATURE_FIELD,
            format_reading(sample.value),
            timestamp_ms,
        )
    }
}

fn format_reading(value: f64) -> String {
    format!("{value:.4}")
}
