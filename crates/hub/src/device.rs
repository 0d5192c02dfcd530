//! Command surface of the remote measurement device: sampling rate, sensor
//! registration and the topic subscriptions that follow from it.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::{BusError, SensorBus};
use crate::config::{Config, SensorEntry};
use crate::sensors::SensorAggregator;
use crate::store::Settings;
use crate::wire::{channel_label, sensor_topic, DeviceCommand};

/// Control over the device's sampling period.
pub trait SamplingControl: Send + Sync {
    fn interval_ms(&self) -> u64;
    fn set_interval(&self, ms: u64) -> Result<(), BusError>;
}

/// Raises the sampling rate for as long as it lives and puts the previous
/// period back when dropped.
pub struct SamplingBoost {
    control: Arc<dyn SamplingControl>,
    restore_ms: u64,
}

impl SamplingBoost {
    pub fn begin(control: Arc<dyn SamplingControl>, fast_ms: u64) -> Self {
        let restore_ms = control.interval_ms();
        if let Err(e) = control.set_interval(fast_ms) {
            warn!(fast_ms, "failed to raise sampling rate: {e}");
        }
        Self {
            control,
            restore_ms,
        }
    }
}

impl Drop for SamplingBoost {
    fn drop(&mut self) {
        if let Err(e) = self.control.set_interval(self.restore_ms) {
            warn!(restore_ms = self.restore_ms, "failed to restore sampling rate: {e}");
        }
    }
}

pub struct MeasurementDevice {
    bus: Arc<dyn SensorBus>,
    settings: Arc<Settings>,
    sensors: Arc<SensorAggregator>,
    interval_ms: AtomicU64,
}

impl MeasurementDevice {
    pub fn new(
        bus: Arc<dyn SensorBus>,
        settings: Arc<Settings>,
        sensors: Arc<SensorAggregator>,
    ) -> Self {
        let interval_ms = settings.snapshot().device_interval_ms();
        Self {
            bus,
            settings,
            sensors,
            interval_ms: AtomicU64::new(interval_ms),
        }
    }

    fn send(&self, command: DeviceCommand) -> Result<(), BusError> {
        self.bus.send_command(&command)
    }

    /// Topics implied by the configuration: every explicitly tracked topic
    /// plus `sensor/<type>` for each configured sensor.
    pub fn topics(config: &Config) -> BTreeSet<String> {
        config
            .sensor_hub
            .subscribed_topics
            .iter()
            .cloned()
            .chain(
                config
                    .sensor_hub
                    .sensors
                    .values()
                    .map(|s| sensor_topic(&s.kind)),
            )
            .collect()
    }

    pub fn subscribe_all(&self) -> Result<(), BusError> {
        for topic in Self::topics(&self.settings.snapshot()) {
            self.bus.subscribe(&topic)?;
        }
        Ok(())
    }

    /// Push the configured sensor set to the device: clear it, register
    /// every sensor, then set the sampling period so one rolling window
    /// spans `interval_ms`.
    pub fn load_sensors(&self) -> Result<(), BusError> {
        let config = self.settings.snapshot();
        self.send(DeviceCommand::ClearAll)?;
        for sensor in config.sensor_hub.sensors.values() {
            self.send(DeviceCommand::AddSensor {
                pin: sensor.pin.clone(),
                kind: sensor.kind.clone(),
                id: sensor.id.clone(),
            })?;
        }
        self.subscribe_all()?;
        self.set_interval(config.device_interval_ms())?;
        info!(
            sensors = config.sensor_hub.sensors.len(),
            interval_ms = config.device_interval_ms(),
            "sensors loaded onto device"
        );
        Ok(())
    }

    /// Register a sensor on the device and persist it.  Returns the
    /// channel label its readings will carry.
    pub fn add_sensor(&self, pin: &str, kind: &str, id: &str) -> Result<String> {
        let label = channel_label(kind, id);
        let topic = sensor_topic(kind);
        self.settings.update(|cfg| {
            if cfg.sensor_hub.sensors.contains_key(&label) {
                bail!("sensor '{label}' already exists");
            }
            cfg.sensor_hub.sensors.insert(
                label.clone(),
                SensorEntry {
                    pin: pin.to_string(),
                    kind: kind.to_string(),
                    id: id.to_string(),
                    calibration: None,
                },
            );
            if !cfg.sensor_hub.subscribed_topics.contains(&topic) {
                cfg.sensor_hub.subscribed_topics.push(topic.clone());
            }
            Ok(())
        })?;

        self.send(DeviceCommand::AddSensor {
            pin: pin.to_string(),
            kind: kind.to_string(),
            id: id.to_string(),
        })
        .context("sensor persisted but the device command failed")?;
        self.bus.subscribe(&topic)?;
        info!(label = %label, pin, "sensor added");
        Ok(label)
    }

    /// Remove a sensor from the device and the configuration.  The topic of
    /// its type is dropped once no sensor of that type remains.
    pub fn remove_sensor(&self, label: &str) -> Result<()> {
        let (sensor, orphaned_topic) = self.settings.update(|cfg| {
            let Some(sensor) = cfg.sensor_hub.sensors.remove(label) else {
                bail!("no sensor '{label}' is configured");
            };
            let topic = sensor_topic(&sensor.kind);
            let still_used = cfg
                .sensor_hub
                .sensors
                .values()
                .any(|s| s.kind == sensor.kind);
            let orphaned = (!still_used).then(|| {
                cfg.sensor_hub.subscribed_topics.retain(|t| *t != topic);
                topic
            });
            Ok((sensor, orphaned))
        })?;

        self.send(DeviceCommand::RemoveSensor {
            pin: sensor.pin.clone(),
        })?;
        self.sensors.remove_channel(label);
        if let Some(topic) = orphaned_topic {
            self.bus.unsubscribe(&topic)?;
        }
        info!(label, pin = %sensor.pin, "sensor removed");
        Ok(())
    }

    pub fn clear_all(&self) -> Result<(), BusError> {
        self.send(DeviceCommand::ClearAll)
    }

    pub fn restart(&self) -> Result<(), BusError> {
        self.send(DeviceCommand::Restart)
    }

    /// Resize the rolling window, persist it and re-derive the device
    /// sampling period.  Returns the new period in milliseconds.
    pub fn set_max_readings(&self, max_readings: usize) -> Result<u64> {
        if max_readings == 0 {
            bail!("max_readings must be at least 1");
        }
        let interval_ms = self.settings.update(|cfg| {
            cfg.sensor_hub.max_readings = max_readings;
            Ok(cfg.device_interval_ms())
        })?;
        self.sensors.set_max_readings(max_readings);
        self.set_interval(interval_ms)?;
        info!(max_readings, interval_ms, "rolling window resized");
        Ok(interval_ms)
    }
}

impl SamplingControl for MeasurementDevice {
    fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    fn set_interval(&self, ms: u64) -> Result<(), BusError> {
        self.send(DeviceCommand::SetInterval(ms))?;
        self.interval_ms.store(ms, Ordering::SeqCst);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::RecordingBus;
    use crate::config::tests::valid_config;
    use crate::sensors::SensorReader;
    use crate::store::tests::MemoryStore;

    struct Fixture {
        device: MeasurementDevice,
        bus: Arc<RecordingBus>,
        settings: Arc<Settings>,
        sensors: Arc<SensorAggregator>,
    }

    fn fixture() -> Fixture {
        let settings =
            Arc::new(Settings::load(Box::new(MemoryStore::new(valid_config()))).unwrap());
        let sensors = Arc::new(SensorAggregator::new(10));
        let bus = Arc::new(RecordingBus::default());
        let device = MeasurementDevice::new(bus.clone(), Arc::clone(&settings), Arc::clone(&sensors));
        Fixture {
            device,
            bus,
            settings,
            sensors,
        }
    }

    #[test]
    fn load_sensors_clears_registers_then_sets_interval() {
        let f = fixture();
        f.device.load_sensors().unwrap();

        assert_eq!(
            f.bus.commands(),
            vec![
                "CLEAR_ALL".to_string(),
                "ADD_SENSOR A0 soil_moisture 0".to_string(),
                "SET_INTERVAL 500".to_string(),
            ]
        );
        assert_eq!(f.bus.topics(), vec!["sensor/soil_moisture".to_string()]);
        assert_eq!(f.device.interval_ms(), 500);
    }

    #[test]
    fn add_sensor_persists_and_tracks_topic() {
        let f = fixture();
        let label = f.device.add_sensor("D4", "dht", "1").unwrap();

        assert_eq!(label, "dht_1");
        let cfg = f.settings.snapshot();
        assert_eq!(cfg.sensor_hub.sensors["dht_1"].pin, "D4");
        assert!(cfg.sensor_hub.subscribed_topics.contains(&"sensor/dht".to_string()));
        assert_eq!(f.bus.commands(), vec!["ADD_SENSOR D4 dht 1".to_string()]);
        assert!(f.bus.topics().contains(&"sensor/dht".to_string()));
    }

    #[test]
    fn add_duplicate_sensor_is_rejected() {
        let f = fixture();
        let err = f.device.add_sensor("A1", "soil_moisture", "0").unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(f.bus.commands().is_empty());
    }

    #[test]
    fn remove_sensor_drops_orphaned_topic() {
        let f = fixture();
        f.device.add_sensor("D4", "dht", "1").unwrap();
        f.sensors.ingest("dht,humidity=0,temperature=0,sensor_id=1 value=50;20 1");
        f.bus.clear();

        f.device.remove_sensor("dht_1").unwrap();

        assert_eq!(f.bus.commands(), vec!["REMOVE_SENSOR D4".to_string()]);
        assert!(!f.bus.topics().contains(&"sensor/dht".to_string()));
        assert!(f.sensors.latest("dht_1").is_none());
        let cfg = f.settings.snapshot();
        assert!(!cfg.sensor_hub.sensors.contains_key("dht_1"));
        assert!(!cfg.sensor_hub.subscribed_topics.contains(&"sensor/dht".to_string()));
    }

    #[test]
    fn remove_sensor_used_by_a_plant_fails_validation() {
        let f = fixture();
        let err = f.device.remove_sensor("soil_moisture_0").unwrap_err();
        assert!(format!("{err:#}").contains("does not match any sensor"));
        assert!(f.settings.snapshot().sensor_hub.sensors.contains_key("soil_moisture_0"));
        assert!(f.bus.commands().is_empty());
    }

    #[test]
    fn set_max_readings_persists_and_rederives_interval() {
        let f = fixture();
        let interval = f.device.set_max_readings(4).unwrap();

        assert_eq!(interval, 1250);
        assert_eq!(f.settings.snapshot().sensor_hub.max_readings, 4);
        assert_eq!(f.sensors.max_readings(), 4);
        assert_eq!(f.bus.commands(), vec!["SET_INTERVAL 1250".to_string()]);
    }

    #[test]
    fn set_max_readings_zero_is_rejected() {
        let f = fixture();
        assert!(f.device.set_max_readings(0).is_err());
        assert!(f.bus.commands().is_empty());
    }

    #[test]
    fn boost_restores_previous_interval() {
        let f = fixture();
        let device: Arc<MeasurementDevice> = Arc::new(f.device);
        {
            let _boost = SamplingBoost::begin(device.clone(), 100);
            assert_eq!(device.interval_ms(), 100);
        }
        assert_eq!(device.interval_ms(), 500);
        assert_eq!(
            f.bus.commands(),
            vec!["SET_INTERVAL 100".to_string(), "SET_INTERVAL 500".to_string()]
        );
    }

    #[test]
    fn clear_and_restart_commands() {
        let f = fixture();
        f.device.clear_all().unwrap();
        f.device.restart().unwrap();
        assert_eq!(
            f.bus.commands(),
            vec!["CLEAR_ALL".to_string(), "RESTART".to_string()]
        );
    }
}
