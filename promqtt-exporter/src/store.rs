//! The metric store: registry of all metrics, shared between the message
//! dispatch path and the scrape path.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::{SharedClock, SystemClock};
use crate::error::{ExporterError, Result};
use crate::labels::Labels;
use crate::metric::{Metric, MetricDescriptor, MetricType, update_counter_name};

/// Metrics in registration order plus a name index.
#[derive(Debug, Default)]
struct Registry {
    metrics: Vec<Metric>,
    index: HashMap<String, usize>,
    expired_total: u64,
}

impl Registry {
    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn insert(&mut self, metric: Metric) {
        self.index.insert(metric.name().to_string(), self.metrics.len());
        self.metrics.push(metric);
    }

    fn get(&self, name: &str) -> Option<&Metric> {
        self.index.get(name).map(|&i| &self.metrics[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Metric> {
        self.index.get(name).map(|&i| &mut self.metrics[i])
    }

    fn check_timeout(&mut self, now: std::time::Instant) -> usize {
        let removed: usize = self
            .metrics
            .iter_mut()
            .map(|metric| metric.check_timeout(now))
            .sum();
        self.expired_total += removed as u64;
        removed
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of registered metrics.
    pub metrics: usize,
    /// Number of live metric instances over all metrics.
    pub instances: usize,
    /// Instances removed by timeout since startup.
    pub expired_total: u64,
}

/// Serializable view of one metric instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub age_secs: f64,
}

/// Serializable view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub datatype: MetricType,
    pub help: String,
    pub timeout_secs: Option<u64>,
    pub with_update_counter: bool,
    pub instances: Vec<InstanceSnapshot>,
}

/// Thread-safe registry of all metrics.
///
/// A single mutex guards the whole registry, so registration, updates, the
/// timeout sweep and rendering are mutually exclusive. [`MetricStore::render`]
/// sweeps and serializes inside one critical section.
#[derive(Debug)]
pub struct MetricStore {
    registry: Mutex<Registry>,
    clock: SharedClock,
    hide_empty_metrics: bool,
}

/// Create a shareable store handle.
pub type SharedStore = Arc<MetricStore>;

impl MetricStore {
    /// Create a store using the system clock that renders empty metrics.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store using a custom clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            clock,
            hide_empty_metrics: false,
        }
    }

    /// Omit HELP/TYPE headers of metrics without instances when rendering.
    pub fn hide_empty_metrics(mut self, hide: bool) -> Self {
        self.hide_empty_metrics = hide;
        self
    }

    /// Register a metric. Must happen before any [`set`](Self::set) for it.
    ///
    /// With `with_update_counter`, a counter named `{name}_updates` is
    /// registered alongside. Either both are registered or neither.
    pub fn register(&self, descriptor: MetricDescriptor) -> Result<()> {
        let mut registry = self.registry.lock();

        if registry.contains(&descriptor.name) {
            return Err(ExporterError::AlreadyRegistered(descriptor.name));
        }

        let counter = descriptor.with_update_counter.then(|| {
            MetricDescriptor::counter(
                descriptor.update_counter_name(),
                format!("Number of updates to {}", descriptor.name),
            )
        });

        if let Some(counter) = &counter
            && registry.contains(&counter.name)
        {
            return Err(ExporterError::AlreadyRegistered(counter.name.clone()));
        }

        debug!(
            metric = %descriptor.name,
            datatype = %descriptor.datatype,
            timeout = ?descriptor.timeout,
            with_update_counter = descriptor.with_update_counter,
            "Registered metric"
        );
        registry.insert(Metric::new(descriptor));

        if let Some(counter) = counter {
            debug!(metric = %counter.name, "Registered update counter");
            registry.insert(Metric::new(counter));
        }

        Ok(())
    }

    /// Set a metric instance value. `None` removes the instance.
    ///
    /// Metrics registered with an update counter get their `{name}_updates`
    /// instance with the same labels incremented for every value set.
    pub fn set(&self, name: &str, labels: &Labels, value: Option<f64>) -> Result<()> {
        let now = self.clock.now();
        let mut registry = self.registry.lock();

        let metric = registry
            .get_mut(name)
            .ok_or_else(|| ExporterError::UnknownMetric(name.to_string()))?;

        metric.set(labels, value, now);
        trace!(metric = %name, value = ?value, "Set metric");

        if metric.with_update_counter() && value.is_some() {
            let counter_name = update_counter_name(name);
            if let Some(counter) = registry.get_mut(&counter_name) {
                counter.increment(labels, now);
            }
        }

        Ok(())
    }

    /// Current value of a metric instance.
    pub fn get(&self, name: &str, labels: &Labels) -> Result<Option<f64>> {
        let registry = self.registry.lock();
        registry
            .get(name)
            .map(|metric| metric.get(labels))
            .ok_or_else(|| ExporterError::UnknownMetric(name.to_string()))
    }

    /// Increase a metric instance by one, starting from zero.
    pub fn increment(&self, name: &str, labels: &Labels) -> Result<()> {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        registry
            .get_mut(name)
            .ok_or_else(|| ExporterError::UnknownMetric(name.to_string()))?
            .increment(labels, now);
        Ok(())
    }

    /// Remove timed out instances from all metrics.
    ///
    /// Returns the number of removed instances.
    pub fn check_timeout(&self) -> usize {
        let now = self.clock.now();
        self.registry.lock().check_timeout(now)
    }

    /// Check whether a metric is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.lock().contains(name)
    }

    /// Number of live instances of a metric.
    pub fn instance_count(&self, name: &str) -> Option<usize> {
        self.registry.lock().get(name).map(Metric::len)
    }

    /// Render all metrics in Prometheus exposition format.
    ///
    /// Timed out instances are removed first, under the same lock.
    pub fn render(&self) -> String {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        registry.check_timeout(now);

        let mut output = String::new();
        for metric in &registry.metrics {
            if self.hide_empty_metrics && metric.is_empty() {
                continue;
            }
            for line in metric.render_lines() {
                writeln!(output, "{}", line).ok();
            }
        }

        output
    }

    /// Serializable snapshot of all metrics.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        registry.check_timeout(now);

        registry
            .metrics
            .iter()
            .map(|metric| MetricSnapshot {
                name: metric.name().to_string(),
                datatype: metric.datatype(),
                help: metric.help().to_string(),
                timeout_secs: metric.timeout().map(|t| t.as_secs()),
                with_update_counter: metric.with_update_counter(),
                instances: metric
                    .instances()
                    .map(|instance| InstanceSnapshot {
                        labels: instance
                            .labels()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                        value: instance.value(),
                        age_secs: instance.age(now).as_secs_f64(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let registry = self.registry.lock();
        StoreStats {
            metrics: registry.metrics.len(),
            instances: registry.metrics.iter().map(Metric::len).sum(),
            expired_total: registry.expired_total,
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}
