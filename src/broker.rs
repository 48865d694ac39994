//! Broker sink seam and the MQTT implementation.
//!
//! The publisher only needs two operations from the broker: publish a binary
//! payload to a topic with delivery acknowledgment, and disconnect. The
//! [`BrokerSink`] trait keeps that boundary narrow so tests (and alternative
//! transports) can stand in for a live broker.

use crate::config::PublisherSettings;
use crate::error::{AppResult, SensorError};
use log::{error, trace, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long [`MqttSink::connect`] waits for the broker's acknowledgment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic for batched high-frequency data from one sensor.
pub fn data_topic(sensor_id: u8) -> String {
    format!("sensor/{sensor_id}/data")
}

/// Topic for environment records from one sensor.
pub fn env_topic(sensor_id: u8) -> String {
    format!("sensor/{sensor_id}/env")
}

/// Narrow publish/disconnect boundary to the message broker.
pub trait BrokerSink: Send {
    /// Publishes a payload with delivery-acknowledged quality (at least
    /// once).
    fn publish(&mut self, topic: &str, payload: &[u8]) -> AppResult<()>;

    /// Releases the broker connection.
    fn disconnect(&mut self) -> AppResult<()>;
}

/// MQTT broker sink.
///
/// Owns a background thread that drives the client event loop; connection
/// readiness is gated on the broker's ConnAck so a failed `connect` never
/// hands out a sink that silently queues.
pub struct MqttSink {
    client: Client,
    connected: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
}

impl MqttSink {
    /// Connects to the broker named in `settings`.
    ///
    /// Fails with [`SensorError::ConnectionSetup`] when the broker does not
    /// acknowledge within a bounded wait; the event thread is signalled to
    /// wind down before returning.
    pub fn connect(settings: &PublisherSettings) -> AppResult<Self> {
        let client_id = format!("strainlink-{}", settings.sensor_id);
        let mut options = MqttOptions::new(client_id, settings.broker.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut connection) = Client::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let thread_connected = connected.clone();
        let thread_shutdown = shutting_down.clone();
        let event_thread = std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            thread_connected.store(true, Ordering::SeqCst);
                        }
                        Ok(event) => trace!("MQTT event: {event:?}"),
                        Err(e) => {
                            thread_connected.store(false, Ordering::SeqCst);
                            if thread_shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            error!("MQTT connection error: {e}");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .map_err(|e| SensorError::ConnectionSetup(format!("event thread spawn: {e}")))?;

        // Gate on the ConnAck so setup failures surface here, not on the
        // first publish.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while !connected.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                shutting_down.store(true, Ordering::SeqCst);
                let _ = client.disconnect();
                return Err(SensorError::ConnectionSetup(format!(
                    "no acknowledgment from broker {}:{} within {:?}",
                    settings.broker, settings.port, CONNECT_TIMEOUT
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        log::info!(
            "Connected to MQTT broker {}:{}",
            settings.broker,
            settings.port
        );

        Ok(Self {
            client,
            connected,
            shutting_down,
            event_thread: Some(event_thread),
        })
    }

    /// Whether the broker connection is currently acknowledged.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl BrokerSink for MqttSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> AppResult<()> {
        if !self.is_connected() {
            return Err(SensorError::Publish("not connected to broker".to_string()));
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| SensorError::Publish(e.to_string()))
    }

    fn disconnect(&mut self) -> AppResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let result = self
            .client
            .disconnect()
            .map_err(|e| SensorError::Publish(format!("disconnect failed: {e}")));
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                warn!("MQTT event thread panicked during shutdown");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        result
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_embed_sensor_id() {
        assert_eq!(data_topic(1), "sensor/1/data");
        assert_eq!(env_topic(42), "sensor/42/env");
    }
}
