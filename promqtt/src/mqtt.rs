//! MQTT subscriber feeding received messages to the bridge.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::bridge::SharedController;
use crate::config::MqttConfig;
use crate::message::Message;

/// Delay before reconnecting after a connection error.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 10;

/// Build client options from configuration.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
    options.set_clean_session(true);
    options
}

/// Subscribes to the broker and dispatches every publish to the bridge.
///
/// Messages are dispatched one at a time in arrival order on the task running
/// [`MqttSubscriber::run`].
pub struct MqttSubscriber {
    controller: SharedController,
    config: MqttConfig,
}

impl MqttSubscriber {
    /// Create a new subscriber.
    pub fn new(controller: SharedController, config: MqttConfig) -> Self {
        Self { controller, config }
    }

    /// Run the subscriber until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            broker = %self.config.broker,
            port = self.config.port,
            "Connecting to MQTT broker"
        );

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&self.config), REQUEST_CAPACITY);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping subscriber");
                        break;
                    }
                }

                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(
                                broker = %self.config.broker,
                                port = self.config.port,
                                "Connected to MQTT broker"
                            );
                            self.controller.set_connection_state(true);

                            // Subscriptions do not survive a reconnect with a clean session
                            info!(topic = %self.config.topic, "Subscribing");
                            if let Err(e) = client.try_subscribe(&self.config.topic, QoS::AtMostOnce) {
                                warn!(topic = %self.config.topic, error = %e, "Failed to subscribe");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            trace!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received message"
                            );
                            let msg = Message::new(publish.topic, publish.payload.to_vec());
                            self.controller.dispatch(&msg);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            info!("Broker closed the connection");
                            self.controller.set_connection_state(false);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if self.controller.is_connected() {
                                info!(error = %e, "Disconnected from MQTT broker");
                            } else {
                                warn!(error = %e, "MQTT connection error");
                            }
                            self.controller.set_connection_state(false);

                            debug!(delay = ?RECONNECT_DELAY, "Waiting before reconnect");
                            tokio::select! {
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        info!("Shutdown signal received, stopping subscriber");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Best effort; the event loop is not polled any more
        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "Failed to queue disconnect");
        }
        self.controller.set_connection_state(false);

        info!("Subscriber stopped");
        Ok(())
    }
}
