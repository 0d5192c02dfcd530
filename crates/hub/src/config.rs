//! Typed TOML configuration: sensors, pumps, plants and schedule, plus the
//! validation that runs before any of it reaches the control loop.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::calibration::Calibration;
use crate::scheduler::TimeOfDay;
use crate::wire::channel_label;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sensor_hub: SensorHubConfig,
    #[serde(default)]
    pub water_nutrient: WaterNutrientConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default)]
    pub plants: BTreeMap<String, PlantEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorHubConfig {
    /// Target period of one full rolling window, in milliseconds.
    pub interval_ms: u64,
    pub max_readings: usize,
    /// Sampling period requested while a sensor-fed watering is running.
    pub fast_interval_ms: u64,
    pub stale_after_secs: u64,
    pub command_topic: String,
    pub subscribed_topics: Vec<String>,
    pub sensors: BTreeMap<String, SensorEntry>,
}

impl Default for SensorHubConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_readings: 10,
            fast_interval_ms: 100,
            stale_after_secs: 300,
            command_topic: "arduino/commands".to_string(),
            subscribed_topics: Vec::new(),
            sensors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    /// Pin name on the measurement device, e.g. `A0`.
    pub pin: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
}

impl SensorEntry {
    pub fn label(&self) -> String {
        channel_label(&self.kind, &self.id)
    }
}

/// A relay-driven pump.  `pin = None` means no relay is wired for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    /// Millilitres per second.
    pub flow_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterNutrientConfig {
    pub nutrient_pumps: BTreeMap<String, PumpEntry>,
    pub water_pump: PumpEntry,
    pub distribution_pumps: BTreeMap<String, PumpEntry>,
    pub fill_level_sensor: InputEntry,
    pub nutrient_amounts: BTreeMap<String, f64>,
    pub total_water_ml: f64,
    pub ml_per_plant: f64,
}

impl Default for WaterNutrientConfig {
    fn default() -> Self {
        let pump = |pin: Option<u8>, flow_rate: f64| PumpEntry { pin, flow_rate };
        Self {
            nutrient_pumps: BTreeMap::from([
                ("green".to_string(), pump(None, 0.5)),
                ("red".to_string(), pump(None, 0.5)),
                ("yellow".to_string(), pump(None, 0.5)),
            ]),
            water_pump: pump(Some(16), 20.0),
            distribution_pumps: BTreeMap::from([
                ("pump_1".to_string(), pump(Some(5), 30.0)),
                ("pump_2".to_string(), pump(Some(20), 30.0)),
                ("pump_3".to_string(), pump(Some(13), 30.0)),
                ("pump_4".to_string(), pump(Some(6), 30.0)),
                ("pump_5".to_string(), pump(Some(19), 30.0)),
            ]),
            fill_level_sensor: InputEntry { pin: Some(26) },
            nutrient_amounts: BTreeMap::from([
                ("green".to_string(), 50.0),
                ("red".to_string(), 30.0),
                ("yellow".to_string(), 20.0),
            ]),
            total_water_ml: 8000.0,
            ml_per_plant: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Threshold evaluation period; defaults to the sampling interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moisture_check_interval_secs: Option<u64>,
    pub max_watering_time_secs: u64,
    pub scheduled_events: Vec<ScheduledEvent>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            moisture_check_interval_secs: None,
            max_watering_time_secs: 60,
            scheduled_events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub time_of_day: TimeOfDay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantEntry {
    /// Channel label of the plant's moisture sensor.
    pub moisture_sensor_id: String,
    /// Key into `water_nutrient.distribution_pumps`.
    pub pump_id: String,
    pub start_threshold: f64,
    pub stop_threshold: f64,
}

/// A plant as the control loop sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plant {
    pub id: String,
    pub moisture_sensor_id: String,
    pub pump_id: String,
    pub start_threshold: f64,
    pub stop_threshold: f64,
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn plants(&self) -> Vec<Plant> {
        self.plants
            .iter()
            .map(|(id, p)| Plant {
                id: id.clone(),
                moisture_sensor_id: p.moisture_sensor_id.clone(),
                pump_id: p.pump_id.clone(),
                start_threshold: p.start_threshold,
                stop_threshold: p.stop_threshold,
            })
            .collect()
    }

    pub fn plant(&self, plant_id: &str) -> Option<Plant> {
        self.plants().into_iter().find(|p| p.id == plant_id)
    }

    /// Sampling interval sent to the device: one rolling window spans
    /// `interval_ms`.
    pub fn device_interval_ms(&self) -> u64 {
        self.sensor_hub
            .interval_ms
            .div_ceil(self.sensor_hub.max_readings.max(1) as u64)
    }

    pub fn threshold_interval(&self) -> Duration {
        match self.event.moisture_check_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.sensor_hub.interval_ms),
        }
    }

    pub fn max_watering_time(&self) -> Duration {
        Duration::from_secs(self.event.max_watering_time_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sensor_hub.stale_after_secs)
    }

    /// Every relay output the hub drives.
    pub fn output_pins(&self) -> Vec<u8> {
        let wn = &self.water_nutrient;
        wn.nutrient_pumps
            .values()
            .chain(std::iter::once(&wn.water_pump))
            .chain(wn.distribution_pumps.values())
            .filter_map(|p| p.pin)
            .collect()
    }

    pub fn input_pins(&self) -> Vec<u8> {
        self.water_nutrient.fill_level_sensor.pin.into_iter().collect()
    }

    pub fn calibrations(&self) -> impl Iterator<Item = (String, Calibration)> + '_ {
        self.sensor_hub
            .sensors
            .iter()
            .filter_map(|(label, s)| s.calibration.map(|c| (label.clone(), c)))
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_sensor_hub(&mut errors);
        self.validate_pumps(&mut errors);
        self.validate_event(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sensor_hub(&self, errors: &mut Vec<String>) {
        let hub = &self.sensor_hub;
        if hub.interval_ms == 0 {
            errors.push("sensor_hub: interval_ms must be positive".to_string());
        }
        if hub.fast_interval_ms == 0 {
            errors.push("sensor_hub: fast_interval_ms must be positive".to_string());
        } else if hub.interval_ms > 0 && hub.fast_interval_ms >= self.device_interval_ms() {
            errors.push(format!(
                "sensor_hub: fast_interval_ms {} must be below the device interval of {} ms",
                hub.fast_interval_ms,
                self.device_interval_ms()
            ));
        }
        if hub.max_readings == 0 {
            errors.push("sensor_hub: max_readings must be at least 1".to_string());
        }
        if hub.command_topic.trim().is_empty() {
            errors.push("sensor_hub: command_topic is empty".to_string());
        }

        for (label, s) in &hub.sensors {
            let ctx = format!("sensor '{label}'");

            if s.pin.trim().is_empty() {
                errors.push(format!("{ctx}: pin is empty"));
            }
            if s.kind.trim().is_empty() || s.id.trim().is_empty() {
                errors.push(format!("{ctx}: type and id must both be set"));
            } else if *label != s.label() {
                errors.push(format!(
                    "{ctx}: label must be '{}' to match the channel the device reports",
                    s.label()
                ));
            }
            if let Some(cal) = s.calibration {
                if let Err(e) = cal.validate() {
                    errors.push(format!("{ctx}: {e}"));
                }
            }
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let wn = &self.water_nutrient;
        let mut seen_pins: HashSet<u8> = HashSet::new();

        let pumps = wn
            .nutrient_pumps
            .iter()
            .map(|(name, p)| (format!("nutrient pump '{name}'"), p))
            .chain(std::iter::once(("water pump".to_string(), &wn.water_pump)))
            .chain(
                wn.distribution_pumps
                    .iter()
                    .map(|(id, p)| (format!("distribution pump '{id}'"), p)),
            );

        for (ctx, pump) in pumps {
            if !(pump.flow_rate.is_finite() && pump.flow_rate > 0.0) {
                errors.push(format!(
                    "{ctx}: flow_rate must be positive, got {}",
                    pump.flow_rate
                ));
            }
            if let Some(pin) = pump.pin {
                check_pin(&ctx, pin, &mut seen_pins, errors);
            }
        }

        if let Some(pin) = wn.fill_level_sensor.pin {
            check_pin("fill level sensor", pin, &mut seen_pins, errors);
        }

        for (name, ml) in &wn.nutrient_amounts {
            if !(ml.is_finite() && *ml >= 0.0) {
                errors.push(format!("nutrient amount '{name}': must be >= 0, got {ml}"));
            }
        }
        if !(wn.total_water_ml.is_finite() && wn.total_water_ml > 0.0) {
            errors.push(format!(
                "water_nutrient: total_water_ml must be positive, got {}",
                wn.total_water_ml
            ));
        }
        if !(wn.ml_per_plant.is_finite() && wn.ml_per_plant > 0.0) {
            errors.push(format!(
                "water_nutrient: ml_per_plant must be positive, got {}",
                wn.ml_per_plant
            ));
        }
    }

    fn validate_event(&self, errors: &mut Vec<String>) {
        if self.event.max_watering_time_secs == 0 {
            errors.push("event: max_watering_time_secs must be positive".to_string());
        }
        if self.event.moisture_check_interval_secs == Some(0) {
            errors.push("event: moisture_check_interval_secs must be positive".to_string());
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        for (id, p) in &self.plants {
            let ctx = format!("plant '{id}'");

            if !(0.0..=100.0).contains(&p.start_threshold) {
                errors.push(format!(
                    "{ctx}: start_threshold {} out of range [0, 100]",
                    p.start_threshold
                ));
            }
            if !(0.0..=100.0).contains(&p.stop_threshold) {
                errors.push(format!(
                    "{ctx}: stop_threshold {} out of range [0, 100]",
                    p.stop_threshold
                ));
            }
            if p.stop_threshold <= p.start_threshold {
                errors.push(format!(
                    "{ctx}: stop_threshold ({}) must be greater than start_threshold ({})",
                    p.stop_threshold, p.start_threshold
                ));
            }
            if !self.water_nutrient.distribution_pumps.contains_key(&p.pump_id) {
                errors.push(format!(
                    "{ctx}: pump_id '{}' does not match any distribution pump",
                    p.pump_id
                ));
            }
            if !self.sensor_hub.sensors.contains_key(&p.moisture_sensor_id) {
                errors.push(format!(
                    "{ctx}: moisture_sensor_id '{}' does not match any sensor",
                    p.moisture_sensor_id
                ));
            }
        }
    }
}

fn check_pin(ctx: &str, pin: u8, seen: &mut HashSet<u8>, errors: &mut Vec<String>) {
    if !VALID_GPIO_PINS.contains(&pin) {
        errors.push(format!(
            "{ctx}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
        ));
    } else if !seen.insert(pin) {
        errors.push(format!("{ctx}: pin {pin} is already in use"));
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Parse and validate a TOML document.
pub fn from_toml_str(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
