//! A single labeled value of a metric.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::labels::{Labels, canonicalize};

/// One concrete labeled value of a metric.
///
/// Instances are owned by their [`Metric`](crate::Metric). The owning metric
/// passes its timeout policy into [`MetricInstance::is_expired`] instead of the
/// instance holding a reference back to it.
#[derive(Debug, Clone)]
pub struct MetricInstance {
    labels: Labels,
    label_string: String,
    value: f64,
    updated: Instant,
}

impl MetricInstance {
    /// Create a new instance stamped with `now`.
    pub fn new(labels: Labels, value: f64, now: Instant) -> Self {
        let label_string = canonicalize(&labels);
        Self {
            labels,
            label_string,
            value,
            updated: now,
        }
    }

    /// Set a new value and refresh the timestamp.
    pub fn update(&mut self, value: f64, now: Instant) {
        self.value = value;
        self.updated = now;
        trace!(labels = %self.label_string, value, "Updated metric instance");
    }

    /// The current value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The labels this instance was created with.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// The canonical label string.
    pub fn label_string(&self) -> &str {
        &self.label_string
    }

    /// Time since the last update.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated)
    }

    /// Check whether the instance outlived `timeout`.
    ///
    /// Instances of metrics without a timeout never expire.
    pub fn is_expired(&self, timeout: Option<Duration>, now: Instant) -> bool {
        match timeout {
            Some(timeout) if !timeout.is_zero() => self.age(now) >= timeout,
            _ => false,
        }
    }

    /// Render the exposition line for this instance.
    pub fn render(&self, metric_name: &str) -> String {
        format!(
            "{}{{{}}} {}",
            metric_name,
            self.label_string,
            format_value(self.value)
        )
    }
}

/// Format a floating point value for Prometheus.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
