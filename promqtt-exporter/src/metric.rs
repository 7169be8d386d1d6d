//! Metric families: a name with type, help text, staleness policy and the set
//! of labeled instances.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instance::MetricInstance;
use crate::labels::{Labels, canonicalize};

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration parameters of a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Unique metric name.
    pub name: String,
    /// Metric type.
    pub datatype: MetricType,
    /// Help text.
    pub help: String,
    /// Instances not updated for this long are dropped. `None` never expires.
    pub timeout: Option<Duration>,
    /// Maintain a `{name}_updates` counter next to this metric.
    pub with_update_counter: bool,
}

impl MetricDescriptor {
    /// Create a descriptor without timeout or update counter.
    pub fn new(name: impl Into<String>, datatype: MetricType, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype,
            help: help.into(),
            timeout: None,
            with_update_counter: false,
        }
    }

    /// Create a gauge descriptor.
    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(name, MetricType::Gauge, help)
    }

    /// Create a counter descriptor.
    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(name, MetricType::Counter, help)
    }

    /// Set the staleness timeout. A zero duration disables expiry.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the staleness timeout in whole seconds. Zero disables expiry.
    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.with_timeout(Duration::from_secs(secs))
    }

    /// Enable or disable the paired update counter.
    pub fn with_update_counter(mut self, enabled: bool) -> Self {
        self.with_update_counter = enabled;
        self
    }

    /// The name of the paired update counter metric.
    pub fn update_counter_name(&self) -> String {
        update_counter_name(&self.name)
    }
}

/// Name of the update counter paired with `metric`.
pub fn update_counter_name(metric: &str) -> String {
    format!("{}_updates", metric)
}

/// A named group of metric instances sharing type, help and timeout.
///
/// Instances are kept ordered by their canonical label string, which is also
/// the render order.
#[derive(Debug, Clone)]
pub struct Metric {
    descriptor: MetricDescriptor,
    instances: BTreeMap<String, MetricInstance>,
}

impl Metric {
    /// Create an empty metric.
    pub fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor,
            instances: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn datatype(&self) -> MetricType {
        self.descriptor.datatype
    }

    pub fn help(&self) -> &str {
        &self.descriptor.help
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.descriptor.timeout
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub fn with_update_counter(&self) -> bool {
        self.descriptor.with_update_counter
    }

    /// True if instances of this metric expire.
    pub fn has_timeout(&self) -> bool {
        self.descriptor.timeout.is_some_and(|t| !t.is_zero())
    }

    /// Set the value of the instance identified by `labels`.
    ///
    /// `None` removes the instance; removing an unknown instance is a no-op.
    pub fn set(&mut self, labels: &Labels, value: Option<f64>, now: Instant) {
        let label_string = canonicalize(labels);

        match value {
            None => {
                if self.instances.remove(&label_string).is_some() {
                    debug!(
                        metric = %self.descriptor.name,
                        labels = %label_string,
                        "Removed metric instance"
                    );
                }
            }
            Some(value) => match self.instances.get_mut(&label_string) {
                Some(instance) => instance.update(value, now),
                None => {
                    debug!(
                        metric = %self.descriptor.name,
                        labels = %label_string,
                        value,
                        "Created metric instance"
                    );
                    self.instances
                        .insert(label_string, MetricInstance::new(labels.clone(), value, now));
                }
            },
        }
    }

    /// Current value of the instance identified by `labels`.
    pub fn get(&self, labels: &Labels) -> Option<f64> {
        self.instances
            .get(&canonicalize(labels))
            .map(MetricInstance::value)
    }

    /// Increase the instance value by one, starting from zero.
    pub fn increment(&mut self, labels: &Labels, now: Instant) {
        let value = self.get(labels).unwrap_or(0.0) + 1.0;
        self.set(labels, Some(value), now);
    }

    /// Remove all instances that outlived the timeout.
    ///
    /// Returns the number of removed instances.
    pub fn check_timeout(&mut self, now: Instant) -> usize {
        if !self.has_timeout() {
            return 0;
        }

        let timeout = self.descriptor.timeout;
        let expired: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.is_expired(timeout, now))
            .map(|(label_string, _)| label_string.clone())
            .collect();

        for label_string in &expired {
            self.instances.remove(label_string);
        }

        if !expired.is_empty() {
            debug!(
                metric = %self.descriptor.name,
                removed = expired.len(),
                remaining = self.instances.len(),
                "Removed timed out metric instances"
            );
        }

        expired.len()
    }

    /// Exposition lines: HELP, TYPE and one line per instance.
    pub fn render_lines(&self) -> impl Iterator<Item = String> + '_ {
        let header = [
            format!("# HELP {} {}", self.descriptor.name, self.descriptor.help),
            format!("# TYPE {} {}", self.descriptor.name, self.descriptor.datatype),
        ];

        header.into_iter().chain(
            self.instances
                .values()
                .map(|instance| instance.render(&self.descriptor.name)),
        )
    }

    /// Instances in render order.
    pub fn instances(&self) -> impl Iterator<Item = &MetricInstance> {
        self.instances.values()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor.name)
    }
}
