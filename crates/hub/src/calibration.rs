//! Raw-to-percentage calibration: the conversion itself, manual calibration
//! and automatic calibration by sampling a channel's extremes.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::device::{SamplingBoost, SamplingControl};
use crate::sensors::{SensorAggregator, SensorReader};
use crate::store::Settings;

/// Longest automatic calibration window, and longest sample delay.
pub const MAX_AUTO_WINDOW: Duration = Duration::from_secs(3600);

/// Raw readings at the two ends of the scale: `dry_value` maps to 0 %,
/// `wet_value` to 100 %.  Capacitive soil probes read higher when dry, but
/// either orientation works.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub dry_value: f64,
    pub wet_value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("dry_value and wet_value must be finite")]
    NotFinite,
    #[error("dry_value and wet_value are both {0}: calibration range is zero")]
    ZeroRange(f64),
    #[error("no sensor '{0}' is configured")]
    UnknownChannel(String),
    #[error("no readings observed on '{0}' while sampling")]
    NoSamples(String),
    #[error("sampling window {0:?} must be between 1 ms and 1 hour")]
    Window(Duration),
    #[error("failed to persist calibration: {0:#}")]
    Persist(anyhow::Error),
}

impl Calibration {
    pub fn new(dry_value: f64, wet_value: f64) -> Result<Self, CalibrationError> {
        let cal = Self {
            dry_value,
            wet_value,
        };
        cal.validate()?;
        Ok(cal)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !(self.dry_value.is_finite() && self.wet_value.is_finite()) {
            return Err(CalibrationError::NotFinite);
        }
        if self.dry_value == self.wet_value {
            return Err(CalibrationError::ZeroRange(self.dry_value));
        }
        Ok(())
    }

    /// Map a raw reading onto 0..=100.  Out-of-range input is clamped first.
    pub fn convert(&self, raw: f64) -> f64 {
        let lo = self.dry_value.min(self.wet_value);
        let hi = self.dry_value.max(self.wet_value);
        let raw = raw.clamp(lo, hi);
        let pct = (self.dry_value - raw) / (self.dry_value - self.wet_value) * 100.0;
        round2(pct)
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Bounds on an automatic calibration run.
pub fn check_window(duration: Duration, sample_delay: Duration) -> Result<(), CalibrationError> {
    for d in [duration, sample_delay] {
        if d.is_zero() || d > MAX_AUTO_WINDOW {
            return Err(CalibrationError::Window(d));
        }
    }
    Ok(())
}

pub struct CalibrationEngine {
    sensors: Arc<SensorAggregator>,
    sampling: Arc<dyn SamplingControl>,
    settings: Arc<Settings>,
}

impl CalibrationEngine {
    pub fn new(
        sensors: Arc<SensorAggregator>,
        sampling: Arc<dyn SamplingControl>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            sensors,
            sampling,
            settings,
        }
    }

    /// `None` while the channel is uncalibrated.
    pub fn convert(&self, label: &str, raw: f64) -> Option<f64> {
        self.sensors.calibration(label).map(|c| c.convert(raw))
    }

    /// Validate, install and persist a calibration for a configured sensor.
    pub fn calibrate(
        &self,
        label: &str,
        dry_value: f64,
        wet_value: f64,
    ) -> Result<Calibration, CalibrationError> {
        let cal = Calibration::new(dry_value, wet_value)?;
        if !self.settings.snapshot().sensor_hub.sensors.contains_key(label) {
            return Err(CalibrationError::UnknownChannel(label.to_string()));
        }

        self.settings
            .update(|cfg| {
                let sensor = cfg
                    .sensor_hub
                    .sensors
                    .get_mut(label)
                    .ok_or_else(|| anyhow!("sensor '{label}' disappeared"))?;
                sensor.calibration = Some(cal);
                Ok(())
            })
            .map_err(CalibrationError::Persist)?;
        self.sensors.set_calibration(label, Some(cal));

        info!(
            label,
            dry = cal.dry_value,
            wet = cal.wet_value,
            "calibration stored"
        );
        Ok(cal)
    }

    /// Learn the calibration by watching a channel for `duration` while the
    /// probe is moved between dry and wet.  The device samples faster for
    /// the duration and is put back to its previous rate on every exit.
    pub async fn calibrate_auto(
        &self,
        label: &str,
        duration: Duration,
        sample_delay: Duration,
    ) -> Result<Calibration, CalibrationError> {
        if !self.settings.snapshot().sensor_hub.sensors.contains_key(label) {
            return Err(CalibrationError::UnknownChannel(label.to_string()));
        }
        check_window(duration, sample_delay)?;

        let max_readings = self.sensors.max_readings() as u64;
        let fast_ms = (sample_delay.as_millis() as u64 / 2)
            .div_ceil(max_readings)
            .max(1);
        let boost = SamplingBoost::begin(Arc::clone(&self.sampling), fast_ms);

        let step = (sample_delay / 10).max(Duration::from_millis(1));
        let deadline = Instant::now() + duration;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        let mut samples = 0usize;

        info!(label, ?duration, ?step, "automatic calibration started");
        loop {
            if let Some(raw) = self.sensors.latest_raw(label) {
                lo = lo.min(raw);
                hi = hi.max(raw);
                samples += 1;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(step).await;
        }
        drop(boost);

        if samples == 0 {
            warn!(label, "automatic calibration observed no readings");
            return Err(CalibrationError::NoSamples(label.to_string()));
        }
        if lo == hi {
            warn!(label, value = lo, "automatic calibration saw a single value");
        }
        self.calibrate(label, hi, lo)
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
    use crate::device::MeasurementDevice;
    use crate::store::tests::MemoryStore;

    fn cal(dry: f64, wet: f64) -> Calibration {
        Calibration {
            dry_value: dry,
            wet_value: wet,
        }
    }

    // -- Conversion ---------------------------------------------------------

    #[test]
    fn convert_maps_dry_to_zero_and_wet_to_hundred() {
        let c = cal(600.0, 280.0);
        assert_eq!(c.convert(600.0), 0.0);
        assert_eq!(c.convert(280.0), 100.0);
        assert_eq!(c.convert(440.0), 50.0);
    }

    #[test]
    fn convert_clamps_out_of_range_input() {
        let c = cal(600.0, 280.0);
        assert_eq!(c.convert(1023.0), 0.0);
        assert_eq!(c.convert(0.0), 100.0);
    }

    #[test]
    fn convert_works_with_inverted_orientation() {
        let c = cal(100.0, 900.0);
        assert_eq!(c.convert(100.0), 0.0);
        assert_eq!(c.convert(900.0), 100.0);
        assert_eq!(c.convert(300.0), 25.0);
    }

    #[test]
    fn convert_rounds_to_two_decimals() {
        assert_eq!(cal(3.0, 0.0).convert(2.0), 33.33);
    }

    #[test]
    fn convert_always_within_bounds() {
        let c = cal(612.5, 287.25);
        let mut raw = -500.0;
        while raw < 1500.0 {
            let pct = c.convert(raw);
            assert!((0.0..=100.0).contains(&pct), "raw {raw} -> {pct}");
            raw += 7.3;
        }
    }

    #[test]
    fn validate_rejects_zero_range_and_non_finite() {
        assert!(matches!(
            cal(400.0, 400.0).validate(),
            Err(CalibrationError::ZeroRange(_))
        ));
        assert!(matches!(
            cal(f64::NAN, 1.0).validate(),
            Err(CalibrationError::NotFinite)
        ));
        assert!(cal(400.0, 200.0).validate().is_ok());
    }

    // -- Engine -------------------------------------------------------------

    struct Fixture {
        engine: CalibrationEngine,
        sensors: Arc<SensorAggregator>,
        settings: Arc<Settings>,
        bus: Arc<RecordingBus>,
    }

    fn fixture() -> Fixture {
        let cfg = valid_config();
        let settings = Arc::new(Settings::load(Box::new(MemoryStore::new(cfg.clone()))).unwrap());
        let sensors = Arc::new(SensorAggregator::new(cfg.sensor_hub.max_readings));
        let bus = Arc::new(RecordingBus::default());
        let device = Arc::new(MeasurementDevice::new(
            bus.clone(),
            Arc::clone(&settings),
            Arc::clone(&sensors),
        ));
        device.set_interval(1000).unwrap();
        bus.clear();
        let engine = CalibrationEngine::new(Arc::clone(&sensors), device, Arc::clone(&settings));
        Fixture {
            engine,
            sensors,
            settings,
            bus,
        }
    }

    #[test]
    fn calibrate_installs_and_persists() {
        let f = fixture();
        f.engine.calibrate("soil_moisture_0", 700.0, 300.0).unwrap();

        assert_eq!(f.sensors.calibration("soil_moisture_0"), Some(cal(700.0, 300.0)));
        let stored = f.settings.snapshot().sensor_hub.sensors["soil_moisture_0"].calibration;
        assert_eq!(stored, Some(cal(700.0, 300.0)));
        assert_eq!(f.engine.convert("soil_moisture_0", 500.0), Some(50.0));
    }

    #[test]
    fn calibrate_rejects_zero_range_and_unknown_sensor() {
        let f = fixture();
        assert!(matches!(
            f.engine.calibrate("soil_moisture_0", 500.0, 500.0),
            Err(CalibrationError::ZeroRange(_))
        ));
        assert!(matches!(
            f.engine.calibrate("soil_moisture_9", 700.0, 300.0),
            Err(CalibrationError::UnknownChannel(_))
        ));
        assert_eq!(f.sensors.calibration("soil_moisture_0"), None);
    }

    #[test]
    fn convert_is_none_while_uncalibrated() {
        let f = fixture();
        assert_eq!(f.engine.convert("soil_moisture_0", 500.0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_auto_uses_observed_extremes() {
        let f = fixture();
        let line = |raw: f64| format!("soil_moisture,sensor_id=0 value={raw} 1");
        f.sensors.ingest(&line(100.0));

        let feeder = async {
            sleep(Duration::from_millis(1500)).await;
            f.sensors.ingest(&line(150.0));
            sleep(Duration::from_millis(1000)).await;
            f.sensors.ingest(&line(200.0));
        };
        let (result, ()) = tokio::join!(
            f.engine.calibrate_auto(
                "soil_moisture_0",
                Duration::from_secs(5),
                Duration::from_secs(10)
            ),
            feeder
        );

        let c = result.unwrap();
        assert_eq!(c, cal(200.0, 100.0));
        assert_eq!(f.engine.convert("soil_moisture_0", 150.0), Some(50.0));
        // Boosted to ceil(5000 / 10) ms, then restored.
        assert_eq!(
            f.bus.commands(),
            vec!["SET_INTERVAL 500".to_string(), "SET_INTERVAL 1000".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_auto_fails_without_samples_and_restores_rate() {
        let f = fixture();
        let err = f
            .engine
            .calibrate_auto("soil_moisture_0", Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, CalibrationError::NoSamples(_)));
        assert_eq!(f.sensors.calibration("soil_moisture_0"), None);
        assert_eq!(f.bus.commands().last().unwrap(), "SET_INTERVAL 1000");
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_auto_rejects_out_of_range_window() {
        let f = fixture();
        let err = f
            .engine
            .calibrate_auto(
                "soil_moisture_0",
                Duration::from_secs(u64::MAX),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Window(_)));
        assert!(f.bus.commands().is_empty());

        assert!(check_window(Duration::from_secs(60), Duration::ZERO).is_err());
        assert!(check_window(MAX_AUTO_WINDOW, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_auto_fails_on_constant_signal() {
        let f = fixture();
        f.sensors
            .ingest("soil_moisture,sensor_id=0 value=321 1");
        let err = f
            .engine
            .calibrate_auto("soil_moisture_0", Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, CalibrationError::ZeroRange(_)));
        assert_eq!(f.sensors.calibration("soil_moisture_0"), None);
    }
}
