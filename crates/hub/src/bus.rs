//! MQTT transport: the `SensorBus` capability, its rumqttc implementation
//! and the event-loop driver feeding the aggregator.

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Packet, QoS};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::sensors::SensorAggregator;
use crate::state::SharedState;
use crate::wire::{processed_topic, DeviceCommand};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("mqtt request could not be queued")]
    Client(#[from] ClientError),
    #[error("failed to encode payload")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe capability over the transport.  Calls only enqueue;
/// delivery happens on the event loop.
pub trait SensorBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    /// Publish a command on the device's command topic.
    fn send_command(&self, command: &DeviceCommand) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// rumqttc implementation
// ---------------------------------------------------------------------------

pub struct MqttBus {
    client: AsyncClient,
    command_topic: String,
    /// Subscriptions to restore after every (re)connect.
    topics: Mutex<BTreeSet<String>>,
}

impl MqttBus {
    pub fn new(client: AsyncClient, command_topic: impl Into<String>) -> Self {
        Self {
            client,
            command_topic: command_topic.into(),
            topics: Mutex::new(BTreeSet::new()),
        }
    }

    fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Re-issue every tracked subscription; the broker forgets them when a
    /// clean session reconnects.
    pub fn resubscribe(&self) {
        for topic in self.topics() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!(topic = %topic, "resubscribe failed: {e}");
            }
        }
    }
}

impl SensorBus for MqttBus {
    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        info!(topic, "subscribed");
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        self.client.try_unsubscribe(topic)?;
        info!(topic, "unsubscribed");
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())?;
        Ok(())
    }

    fn send_command(&self, command: &DeviceCommand) -> Result<(), BusError> {
        info!(topic = %self.command_topic, command = %command, "device command");
        self.publish(&self.command_topic, command.to_string().as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Doubling delay between reconnect attempts, capped; reset once connected.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// Fold one inbound payload (one or more lines) into the aggregator and
/// republish each resulting snapshot as JSON on `processed_<topic>`.
/// Returns the number of channels updated.
pub fn handle_publish(
    bus: &dyn SensorBus,
    sensors: &SensorAggregator,
    topic: &str,
    payload: &[u8],
) -> usize {
    if topic.starts_with("processed_") {
        return 0;
    }
    let text = String::from_utf8_lossy(payload);
    let mut updated = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some(snapshot) = sensors.ingest(line) else {
            continue;
        };
        updated += 1;
        let out = processed_topic(topic);
        let result = serde_json::to_vec(&snapshot)
            .map_err(BusError::from)
            .and_then(|json| bus.publish(&out, &json));
        if let Err(e) = result {
            warn!(topic = %out, "processed republish failed: {e}");
        }
    }
    updated
}

/// Drive the MQTT event loop until shutdown.  Transport errors back off
/// exponentially; ingestion simply goes stale while disconnected.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    bus: Arc<MqttBus>,
    sensors: Arc<SensorAggregator>,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let n = handle_publish(bus.as_ref(), &sensors, &p.topic, &p.payload);
                debug!(topic = %p.topic, channels = n, "publish handled");
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                backoff.reset();
                bus.resubscribe();
                let mut st = state.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = state.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(?delay, "mqtt error: {e}. reconnecting...");
                {
                    let mut st = state.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
    info!("mqtt event loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sensors::SensorReader;

    /// In-memory bus recording everything sent through it.
    #[derive(Default)]
    pub(crate) struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        commands: Mutex<Vec<String>>,
        topics: Mutex<BTreeSet<String>>,
    }

    impl RecordingBus {
        pub(crate) fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }

        pub(crate) fn topics(&self) -> Vec<String> {
            self.topics.lock().unwrap().iter().cloned().collect()
        }

        pub(crate) fn clear(&self) {
            self.commands.lock().unwrap().clear();
            self.published.lock().unwrap().clear();
        }
    }

    impl SensorBus for RecordingBus {
        fn subscribe(&self, topic: &str) -> Result<(), BusError> {
            self.topics.lock().unwrap().insert(topic.to_string());
            Ok(())
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
            self.topics.lock().unwrap().remove(topic);
            Ok(())
        }

        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        fn send_command(&self, command: &DeviceCommand) -> Result<(), BusError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    // -- Backoff ------------------------------------------------------------

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    // -- handle_publish -----------------------------------------------------

    #[test]
    fn publish_is_ingested_and_republished() {
        let bus = RecordingBus::default();
        let sensors = SensorAggregator::new(10);
        let n = handle_publish(
            &bus,
            &sensors,
            "sensor/soil_moisture",
            b"soil_moisture,sensor_id=0 value=300 1\n",
        );

        assert_eq!(n, 1);
        assert_eq!(sensors.latest_raw("soil_moisture_0"), Some(300.0));
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "processed_sensor/soil_moisture");
        let json: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(json["label"], "soil_moisture_0");
        assert_eq!(json["raw_value"], 300.0);
    }

    #[test]
    fn multi_line_payload_survives_a_bad_line() {
        let bus = RecordingBus::default();
        let sensors = SensorAggregator::new(10);
        let payload = b"soil_moisture,sensor_id=0 value=300 1\n\
                        soil_moisture,sensor_id=1 2\n\
                        garbage\n\
                        soil_moisture,sensor_id=2 value=500 3\n";
        let n = handle_publish(&bus, &sensors, "sensor/soil_moisture", payload);

        assert_eq!(n, 3);
        assert!(sensors.latest("soil_moisture_1").unwrap().degraded);
        assert_eq!(sensors.latest_raw("soil_moisture_2"), Some(500.0));
    }

    #[test]
    fn processed_topics_are_not_reingested() {
        let bus = RecordingBus::default();
        let sensors = SensorAggregator::new(10);
        let n = handle_publish(
            &bus,
            &sensors,
            "processed_sensor/soil_moisture",
            b"soil_moisture,sensor_id=0 value=300 1",
        );
        assert_eq!(n, 0);
        assert!(bus.published().is_empty());
    }
}
