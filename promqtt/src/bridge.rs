//! The bridge controller: builds handlers from configuration and dispatches
//! messages to them.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use promqtt_common::{TopicError, TopicPattern};
use promqtt_exporter::{ExporterError, Labels, MetricDescriptor, SharedStore};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::config::{BridgeConfig, MappingConfig};
use crate::expr::{Expr, ExprError, Template};
use crate::handler::{HandleReport, MessageHandler};
use crate::mapping::{Mapping, SharedMapping};
use crate::message::Message;

/// Gauge reporting whether the MQTT connection is up.
pub const CONN_STATE_METRIC: &str = "promqtt_mqtt_conn_state";

/// Gauge carrying the running version as a label.
pub const BUILD_INFO_METRIC: &str = "promqtt_build_info";

/// Errors building the bridge. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("metric registration failed: {0}")]
    Exporter(#[from] ExporterError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("invalid expression '{source_text}': {error}")]
    Expr { source_text: String, error: ExprError },

    #[error("type '{0}' not configured")]
    UnknownType(String),
}

/// Message processing statistics.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Messages passed to [`BridgeController::dispatch`].
    pub messages_received: u64,
    /// Messages matched by at least one handler.
    pub messages_matched: u64,
    /// Payloads that failed to parse.
    pub parse_failures: u64,
    /// Mapping evaluations that failed.
    pub eval_failures: u64,
    /// Store updates that failed.
    pub store_errors: u64,
    /// Handlers that panicked.
    pub handler_panics: u64,
}

/// Owns the message handlers built from configuration.
pub struct BridgeController {
    handlers: Vec<MessageHandler>,
    store: SharedStore,
    conn_labels: Labels,
    connected: AtomicBool,
    stats: RwLock<BridgeStats>,
}

/// Create a shareable controller handle.
pub type SharedController = Arc<BridgeController>;

impl BridgeController {
    /// Register all metrics and build the handlers.
    pub fn from_config(config: &BridgeConfig, store: SharedStore) -> Result<Self, BridgeError> {
        for (name, metric) in &config.metrics {
            debug!(metric = %name, "Registering metric");
            store.register(metric.descriptor(name))?;
        }

        let mut types: BTreeMap<&str, Vec<SharedMapping>> = BTreeMap::new();
        for (type_name, mappings) in &config.types {
            debug!(type_name = %type_name, "Loading type");
            let mappings = mappings
                .iter()
                .map(|(metric, cfg)| build_mapping(type_name, metric, cfg, &store).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            types.insert(type_name.as_str(), mappings);
        }

        let mut handlers = Vec::with_capacity(config.messages.len());
        for message in &config.messages {
            let mut mappings = Vec::new();
            for type_name in &message.types {
                let type_mappings = types
                    .get(type_name.as_str())
                    .ok_or_else(|| BridgeError::UnknownType(type_name.clone()))?;
                mappings.extend(type_mappings.iter().cloned());
            }

            let patterns = message
                .topics
                .iter()
                .map(|topic| TopicPattern::compile(topic))
                .collect::<Result<Vec<_>, _>>()?;

            debug!(
                topics = %message.topics.join(", "),
                types = %message.types.join(", "),
                "Created message handler"
            );
            handlers.push(MessageHandler::new(patterns, message.parser, mappings));
        }

        store.register(MetricDescriptor::gauge(
            CONN_STATE_METRIC,
            "Connection state of the connection to the MQTT broker",
        ))?;
        store.register(MetricDescriptor::gauge(
            BUILD_INFO_METRIC,
            "Build information",
        ))?;
        let version = Labels::from([("version".to_string(), env!("CARGO_PKG_VERSION").to_string())]);
        store.set(BUILD_INFO_METRIC, &version, Some(1.0))?;

        let conn_labels = Labels::from([
            ("broker".to_string(), config.mqtt.broker.clone()),
            ("port".to_string(), config.mqtt.port.to_string()),
        ]);

        info!(
            metrics = config.metrics.len(),
            types = config.types.len(),
            handlers = handlers.len(),
            "Bridge configured"
        );

        let controller = Self {
            handlers,
            store,
            conn_labels,
            connected: AtomicBool::new(false),
            stats: RwLock::new(BridgeStats::default()),
        };
        controller.set_connection_state(false);
        Ok(controller)
    }

    /// Pass a message to every handler in configured order.
    ///
    /// Nothing raised while handling a message escapes this call, not even a
    /// panic inside a handler.
    pub fn dispatch(&self, msg: &Message) {
        trace!(topic = %msg.topic(), payload_len = msg.payload().len(), "Dispatching message");

        let stats = run_isolated(
            msg.topic(),
            self.handlers.iter().map(|handler| move || handler.handle(msg)),
        );

        let mut total = self.stats.write();
        total.messages_received += stats.messages_received;
        total.messages_matched += stats.messages_matched;
        total.parse_failures += stats.parse_failures;
        total.eval_failures += stats.eval_failures;
        total.store_errors += stats.store_errors;
        total.handler_panics += stats.handler_panics;
    }

    /// Record the MQTT connection state in the connection gauge.
    pub fn set_connection_state(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        let value = if connected { 1.0 } else { 0.0 };
        if let Err(e) = self.store.set(CONN_STATE_METRIC, &self.conn_labels, Some(value)) {
            error!(error = %e, "Failed to update connection state");
        }
    }

    /// Whether the last reported connection state was connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Get processing statistics.
    pub fn stats(&self) -> BridgeStats {
        self.stats.read().clone()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn handlers(&self) -> &[MessageHandler] {
        &self.handlers
    }
}

/// Run each handler in turn, catching panics so the rest still run.
fn run_isolated<F>(topic: &str, handlers: impl IntoIterator<Item = F>) -> BridgeStats
where
    F: FnOnce() -> HandleReport,
{
    let mut stats = BridgeStats {
        messages_received: 1,
        ..Default::default()
    };

    for (index, handle) in handlers.into_iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(handle)) {
            Ok(report) => {
                stats.messages_matched |= report.matched as u64;
                stats.parse_failures += report.parse_failed as u64;
                stats.eval_failures += report.skipped as u64;
                stats.store_errors += report.store_errors as u64;
            }
            Err(_) => {
                error!(topic = %topic, handler = index, "Message handler panicked");
                stats.handler_panics += 1;
            }
        }
    }

    stats
}

fn build_mapping(
    type_name: &str,
    metric: &str,
    cfg: &MappingConfig,
    store: &SharedStore,
) -> Result<Mapping, BridgeError> {
    let value = parse_expr(&cfg.value)?;
    let labels = cfg
        .labels
        .iter()
        .map(|(name, expr)| {
            let name = Template::parse(name).map_err(|error| BridgeError::Expr {
                source_text: name.clone(),
                error,
            })?;
            Ok((name, parse_expr(expr)?))
        })
        .collect::<Result<Vec<_>, BridgeError>>()?;

    Ok(Mapping::new(type_name, metric, value, labels, store.clone()))
}

fn parse_expr(source: &str) -> Result<Expr, BridgeError> {
    Expr::parse(source).map_err(|error| BridgeError::Expr {
        source_text: source.to_string(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use promqtt_exporter::MetricStore;
    use promqtt_exporter::labels::labels;

    const CONFIG: &str = r#"{
        mqtt: { broker: "mqtt.local" },
        metrics: {
            temp: { type: "gauge", help: "Temp", timeout: 300 },
            power: { type: "gauge", help: "Power", with_update_counter: true },
        },
        types: {
            bme280: { temp: { value: "data.BME280.Temperature", labels: { node: "tlist[1]" } } },
            plug: { power: { value: "1 if data.POWER == 'ON' else 0", labels: { node: "tlist[1]" } } },
        },
        messages: [
            { topics: ["tele/+/SENSOR"], types: ["bme280"] },
            { topics: ["tele/+/STATE", "re:stat/.*/RESULT"], types: ["plug"] },
            { topics: ["tele/+/SENSOR", "tele/+/STATE"], types: ["bme280", "plug"] },
        ],
    }"#;

    fn controller() -> BridgeController {
        let config = BridgeConfig::parse(CONFIG).unwrap();
        BridgeController::from_config(&config, Arc::new(MetricStore::new())).unwrap()
    }

    #[test]
    fn test_from_config_registers_metrics() {
        let bridge = controller();
        let store = bridge.store();

        assert!(store.is_registered("temp"));
        assert!(store.is_registered("power"));
        assert!(store.is_registered("power_updates"));
        assert!(store.is_registered(CONN_STATE_METRIC));
        assert_eq!(bridge.handlers().len(), 3);
        assert_eq!(bridge.handlers()[2].mappings().len(), 2);

        let output = store.render();
        assert!(output.contains(&format!(
            "{}{{version=\"{}\"}} 1",
            BUILD_INFO_METRIC,
            env!("CARGO_PKG_VERSION")
        )));
        assert!(output.contains("promqtt_mqtt_conn_state{broker=\"mqtt.local\",port=\"1883\"} 0"));
    }

    #[test]
    fn test_duplicate_registration_is_fatal() {
        let config = BridgeConfig::parse(CONFIG).unwrap();
        let store = Arc::new(MetricStore::new());
        store
            .register(MetricDescriptor::gauge("temp", "already here"))
            .unwrap();

        let result = BridgeController::from_config(&config, store);
        assert!(matches!(
            result,
            Err(BridgeError::Exporter(ExporterError::AlreadyRegistered(name))) if name == "temp"
        ));
    }

    #[test]
    fn test_dispatch_to_every_handler() {
        let bridge = controller();

        bridge.dispatch(&Message::new(
            "tele/node1/SENSOR",
            r#"{"BME280": {"Temperature": 21.5}}"#,
        ));

        // The first and third handler match; the plug mapping of the third fails
        let stats = bridge.stats();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.messages_matched, 1);
        assert_eq!(stats.eval_failures, 1);
        assert_eq!(stats.handler_panics, 0);
        assert_eq!(
            bridge
                .store()
                .get("temp", &labels([("node", "node1")]))
                .unwrap(),
            Some(21.5)
        );
    }

    #[test]
    fn test_dispatch_counts_updates() {
        let bridge = controller();

        bridge.dispatch(&Message::new("stat/plug1/RESULT", r#"{"POWER": "ON"}"#));
        bridge.dispatch(&Message::new("stat/plug1/RESULT", r#"{"POWER": "OFF"}"#));

        let store = bridge.store();
        let l = labels([("node", "plug1")]);
        assert_eq!(store.get("power", &l).unwrap(), Some(0.0));
        assert_eq!(store.get("power_updates", &l).unwrap(), Some(2.0));
    }

    #[test]
    fn test_dispatch_bad_payload() {
        let bridge = controller();

        bridge.dispatch(&Message::new("tele/node1/SENSOR", "garbage"));
        bridge.dispatch(&Message::new("unrelated/topic", "garbage"));

        let stats = bridge.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_matched, 1);
        assert_eq!(stats.parse_failures, 2);
    }

    #[test]
    fn test_connection_state() {
        let bridge = controller();
        assert!(!bridge.is_connected());

        bridge.set_connection_state(true);
        assert!(bridge.is_connected());
        let l = labels([("broker", "mqtt.local"), ("port", "1883")]);
        assert_eq!(bridge.store().get(CONN_STATE_METRIC, &l).unwrap(), Some(1.0));

        bridge.set_connection_state(false);
        assert_eq!(bridge.store().get(CONN_STATE_METRIC, &l).unwrap(), Some(0.0));
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let mut ran_after = false;
        let mut handlers: Vec<Box<dyn FnOnce() -> HandleReport + '_>> = Vec::new();
        handlers.push(Box::new(|| -> HandleReport { panic!("handler bug") }));
        handlers.push(Box::new(|| -> HandleReport {
            ran_after = true;
            HandleReport {
                matched: true,
                applied: 1,
                ..Default::default()
            }
        }));

        let stats = run_isolated("tele/node1/SENSOR", handlers);

        assert!(ran_after);
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(stats.messages_matched, 1);
        assert_eq!(stats.messages_received, 1);
    }
}
