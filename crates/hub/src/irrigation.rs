//! Nutrient mixing, mixer filling and distribution to the plants.
//!
//! Every stage that keeps a pump running polls every 100 ms and re-checks
//! the abort flag on each iteration.  Pumps are held by [`PumpGuard`](crate::gpio::PumpGuard)s, so a
//! pump is switched off on every exit path including cancellation of the
//! task driving the sequence.  Sequences never overlap: each public entry
//! point takes the actuation lock for its whole duration.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Plant};
use crate::device::{SamplingBoost, SamplingControl};
use crate::gpio::{GpioError, Relays};
use crate::sensors::SensorReader;
use crate::store::Settings;

const POLL: Duration = Duration::from_millis(100);
/// Largest volume pumped into the mixer in one go.
const FILL_INCREMENT_ML: f64 = 1000.0;
/// Ceiling on a single fill increment.
const FILL_INCREMENT_CEILING: Duration = Duration::from_secs(60);
/// Longest run any volume may translate into.
const MAX_PUMP_RUN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Mixing,
    Filling,
    Distributing,
    Done,
    Aborted,
    Failed,
}

/// How a stage or sequence ended.  None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// Abort mode was active; nothing was switched on.
    Refused,
    /// Abort was raised while running.
    Aborted,
    /// The time ceiling elapsed first.
    TimedOut,
    /// Moisture reached the plant's stop threshold.
    ThresholdReached,
    /// The mixer's fill-level input reported full.
    Full,
    /// The requested volume was pumped into the mixer.
    TargetReached,
}

impl Outcome {
    /// Whether a multi-stage sequence must stop after this outcome.
    fn halts(self) -> bool {
        matches!(self, Outcome::Refused | Outcome::Aborted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrrigationError {
    #[error("relay fault")]
    Gpio(#[from] GpioError),
    #[error("unknown plant '{0}'")]
    UnknownPlant(String),
    #[error("no distribution pump '{0}'")]
    UnknownPump(String),
    #[error("{0} has no relay pin assigned")]
    Unassigned(String),
    #[error("{ml} ml at {flow_rate} ml/s is not a volume the pumps can deliver")]
    Volume { ml: f64, flow_rate: f64 },
}

/// Run time for `ml` at `flow_rate` ml/s, bounded by [`MAX_PUMP_RUN`].
fn pump_time(ml: f64, flow_rate: f64) -> Result<Duration, IrrigationError> {
    Duration::try_from_secs_f64(ml / flow_rate)
        .ok()
        .filter(|d| *d <= MAX_PUMP_RUN)
        .ok_or(IrrigationError::Volume { ml, flow_rate })
}

pub struct IrrigationActuator {
    relays: Relays,
    sensors: Arc<dyn SensorReader>,
    sampling: Arc<dyn SamplingControl>,
    settings: Arc<Settings>,
    sequence: tokio::sync::Mutex<()>,
    state: Mutex<CycleState>,
}

impl IrrigationActuator {
    pub fn new(
        relays: Relays,
        sensors: Arc<dyn SensorReader>,
        sampling: Arc<dyn SamplingControl>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            relays,
            sensors,
            sampling,
            settings,
            sequence: tokio::sync::Mutex::new(()),
            state: Mutex::new(CycleState::Idle),
        }
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether a sequence currently holds the actuation lock.
    pub fn is_busy(&self) -> bool {
        self.sequence.try_lock().is_err()
    }

    /// Fill-level input; HIGH means full.  Without a configured sensor the
    /// mixer never reports full.
    pub fn is_mixer_full(&self) -> Result<bool, GpioError> {
        match self.settings.snapshot().water_nutrient.fill_level_sensor.pin {
            Some(pin) => self.relays.read_input(pin),
            None => Ok(false),
        }
    }

    fn moisture(&self, plant: &Plant) -> Option<f64> {
        self.sensors
            .latest(&plant.moisture_sensor_id)
            .filter(|s| !s.degraded)
            .and_then(|s| s.percentage)
    }

    // -- Public entry points ------------------------------------------------

    pub async fn mix_nutrients(
        &self,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        self.mix(&self.settings.snapshot(), amounts).await
    }

    pub async fn fill_mixer(&self, target_ml: f64) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        self.fill(&self.settings.snapshot(), target_ml).await
    }

    pub async fn distribute_to_plants(&self, ml_per_plant: f64) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        self.distribute_all(&self.settings.snapshot(), ml_per_plant)
            .await
    }

    /// `target` is a plant id, or failing that a distribution pump id.
    pub async fn distribute_to_plant(
        &self,
        target: &str,
        ml: f64,
    ) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        self.distribute_one(&self.settings.snapshot(), target, ml)
            .await
    }

    /// Run the plant's pump until its moisture reaches the stop threshold,
    /// abort is raised or `max_watering_time` elapses.  A sensor that stops
    /// reporting simply runs the pump to the ceiling.
    pub async fn sensor_based_distribute(&self, plant: &Plant) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        self.distribute_by_sensor(&self.settings.snapshot(), plant)
            .await
    }

    /// Mix, fill, then water every plant by volume.
    pub async fn run_cycle(&self) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        let cfg = self.settings.snapshot();
        info!("watering cycle started");
        if let Some(outcome) = self.prepare_solution(&cfg).await? {
            return Ok(outcome);
        }
        self.set_state(CycleState::Distributing);
        let outcome = self.distribute_all(&cfg, cfg.water_nutrient.ml_per_plant).await;
        self.finish(outcome)
    }

    /// Mix, fill, then water one plant by volume.
    pub async fn run_cycle_for_plant(&self, plant_id: &str) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        let cfg = self.settings.snapshot();
        if cfg.plant(plant_id).is_none() {
            return Err(IrrigationError::UnknownPlant(plant_id.to_string()));
        }
        info!(plant = %plant_id, "watering cycle started");
        if let Some(outcome) = self.prepare_solution(&cfg).await? {
            return Ok(outcome);
        }
        self.set_state(CycleState::Distributing);
        let outcome = self
            .distribute_one(&cfg, plant_id, cfg.water_nutrient.ml_per_plant)
            .await;
        self.finish(outcome)
    }

    /// Mix, fill, then water one plant until its sensor says stop.
    pub async fn run_sensor_cycle(&self, plant_id: &str) -> Result<Outcome, IrrigationError> {
        let _seq = self.sequence.lock().await;
        let cfg = self.settings.snapshot();
        let plant = cfg
            .plant(plant_id)
            .ok_or_else(|| IrrigationError::UnknownPlant(plant_id.to_string()))?;
        info!(plant = %plant_id, "sensor-fed watering cycle started");
        if let Some(outcome) = self.prepare_solution(&cfg).await? {
            return Ok(outcome);
        }
        self.set_state(CycleState::Distributing);
        let outcome = self.distribute_by_sensor(&cfg, &plant).await;
        self.finish(outcome)
    }

    // -- Sequencing ---------------------------------------------------------

    /// Mixing and filling.  `Some` carries the outcome that ended the
    /// sequence early.  A fault in either stage forces every pump off before
    /// it is reported.
    async fn prepare_solution(&self, cfg: &Config) -> Result<Option<Outcome>, IrrigationError> {
        if self.relays.abort_state().is_set() {
            warn!("abort active: watering cycle refused");
            return Ok(Some(Outcome::Refused));
        }

        self.set_state(CycleState::Mixing);
        let mixed = self.mix(cfg, &cfg.water_nutrient.nutrient_amounts).await;
        if let Some(stop) = self.stage_result("mixing", mixed)? {
            return Ok(Some(stop));
        }

        self.set_state(CycleState::Filling);
        let filled = self.fill(cfg, cfg.water_nutrient.total_water_ml).await;
        if let Some(stop) = self.stage_result("filling", filled)? {
            return Ok(Some(stop));
        }
        Ok(None)
    }

    fn stage_result(
        &self,
        stage: &str,
        result: Result<Outcome, IrrigationError>,
    ) -> Result<Option<Outcome>, IrrigationError> {
        match result {
            Ok(outcome) if outcome.halts() => {
                self.record_halt(outcome);
                Ok(Some(outcome))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                error!(stage, "stage failed, switching all pumps off: {e}");
                let failed = self.relays.all_off();
                if !failed.is_empty() {
                    error!(?failed, "pumps could not be switched off");
                }
                self.set_state(CycleState::Failed);
                Err(e)
            }
        }
    }

    fn record_halt(&self, outcome: Outcome) {
        if outcome == Outcome::Aborted {
            self.set_state(CycleState::Aborted);
        } else {
            self.set_state(CycleState::Idle);
        }
    }

    fn finish(
        &self,
        outcome: Result<Outcome, IrrigationError>,
    ) -> Result<Outcome, IrrigationError> {
        match &outcome {
            Ok(o) if o.halts() => self.record_halt(*o),
            Ok(o) => {
                info!(outcome = ?o, "watering cycle finished");
                self.set_state(CycleState::Done);
            }
            Err(e) => {
                error!("watering cycle failed: {e}");
                self.set_state(CycleState::Failed);
            }
        }
        outcome
    }

    // -- Stages -------------------------------------------------------------

    /// Run `pin` for `duration`.
    async fn run_for(&self, pin: u8, duration: Duration) -> Result<Outcome, IrrigationError> {
        let Some(pump) = self.relays.engage(pin)? else {
            return Ok(Outcome::Refused);
        };
        let deadline = Instant::now() + duration;
        let outcome = loop {
            if self.relays.abort_state().is_set() {
                break Outcome::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                break Outcome::Completed;
            }
            sleep((deadline - now).min(POLL)).await;
        };
        pump.release()?;
        Ok(outcome)
    }

    async fn mix(
        &self,
        cfg: &Config,
        amounts: &BTreeMap<String, f64>,
    ) -> Result<Outcome, IrrigationError> {
        for (name, &ml) in amounts {
            let Some(pump) = cfg.water_nutrient.nutrient_pumps.get(name) else {
                warn!(nutrient = %name, "no pump for nutrient, skipping");
                continue;
            };
            let Some(pin) = pump.pin else {
                debug!(nutrient = %name, "nutrient pump unassigned, skipping");
                continue;
            };
            if ml == 0.0 {
                continue;
            }
            let duration = pump_time(ml, pump.flow_rate)?;
            info!(nutrient = %name, ml, ?duration, "dosing nutrient");
            let outcome = self.run_for(pin, duration).await?;
            if outcome.halts() {
                warn!(nutrient = %name, ?outcome, "mixing halted");
                return Ok(outcome);
            }
        }
        Ok(Outcome::Completed)
    }

    /// Pump water into the mixer in increments of at most 1000 ml until it
    /// reports full, `target_ml` has been pumped, or one increment exceeds
    /// its 60 s ceiling.
    async fn fill(&self, cfg: &Config, target_ml: f64) -> Result<Outcome, IrrigationError> {
        if self.is_mixer_full()? {
            info!("mixer already full");
            return Ok(Outcome::Full);
        }
        let pump = &cfg.water_nutrient.water_pump;
        let pin = pump
            .pin
            .ok_or_else(|| IrrigationError::Unassigned("water pump".to_string()))?;
        pump_time(target_ml, pump.flow_rate)?;

        let Some(guard) = self.relays.engage(pin)? else {
            return Ok(Outcome::Refused);
        };
        info!(target_ml, "filling mixer");

        let mut pumped = 0.0;
        let outcome = 'fill: loop {
            if pumped >= target_ml {
                break Outcome::TargetReached;
            }
            let increment = (target_ml - pumped).min(FILL_INCREMENT_ML);
            let needed = pump_time(increment, pump.flow_rate)?;
            let started = Instant::now();
            loop {
                if self.relays.abort_state().is_set() {
                    break 'fill Outcome::Aborted;
                }
                if self.is_mixer_full()? {
                    break 'fill Outcome::Full;
                }
                let elapsed = started.elapsed();
                if elapsed >= FILL_INCREMENT_CEILING {
                    break 'fill Outcome::TimedOut;
                }
                if elapsed >= needed {
                    pumped += increment;
                    break;
                }
                sleep((needed - elapsed).min(POLL)).await;
            }
        };
        guard.release()?;

        match outcome {
            Outcome::TimedOut => warn!(pumped, "fill increment hit its ceiling"),
            _ => info!(pumped, ?outcome, "mixer fill finished"),
        }
        Ok(outcome)
    }

    async fn distribute_all(&self, cfg: &Config, ml: f64) -> Result<Outcome, IrrigationError> {
        for (id, pump) in &cfg.water_nutrient.distribution_pumps {
            let Some(pin) = pump.pin else {
                warn!(pump = %id, "distribution pump unassigned, skipping");
                continue;
            };
            let duration = pump_time(ml, pump.flow_rate)?;
            let outcome = self.run_for(pin, duration).await?;
            if outcome.halts() {
                warn!(pump = %id, ?outcome, "distribution halted");
                return Ok(outcome);
            }
            info!(pump = %id, ml, "distribution complete");
        }
        Ok(Outcome::Completed)
    }

    async fn distribute_one(
        &self,
        cfg: &Config,
        target: &str,
        ml: f64,
    ) -> Result<Outcome, IrrigationError> {
        let pump_id = cfg
            .plant(target)
            .map(|p| p.pump_id)
            .unwrap_or_else(|| target.to_string());
        let pump = cfg
            .water_nutrient
            .distribution_pumps
            .get(&pump_id)
            .ok_or_else(|| IrrigationError::UnknownPump(pump_id.clone()))?;
        let pin = pump
            .pin
            .ok_or_else(|| IrrigationError::Unassigned(format!("distribution pump '{pump_id}'")))?;

        let duration = pump_time(ml, pump.flow_rate)?;
        let outcome = self.run_for(pin, duration).await?;
        info!(plant = %target, pump = %pump_id, ml, ?outcome, "distribution finished");
        Ok(outcome)
    }

    async fn distribute_by_sensor(
        &self,
        cfg: &Config,
        plant: &Plant,
    ) -> Result<Outcome, IrrigationError> {
        let pump = cfg
            .water_nutrient
            .distribution_pumps
            .get(&plant.pump_id)
            .ok_or_else(|| IrrigationError::UnknownPump(plant.pump_id.clone()))?;
        let pin = pump.pin.ok_or_else(|| {
            IrrigationError::Unassigned(format!("distribution pump '{}'", plant.pump_id))
        })?;

        if self.relays.abort_state().is_set() {
            warn!(plant = %plant.id, "abort active: watering refused");
            return Ok(Outcome::Refused);
        }
        if let Some(pct) = self.moisture(plant) {
            if pct >= plant.stop_threshold {
                info!(plant = %plant.id, pct, "already at stop threshold");
                return Ok(Outcome::ThresholdReached);
            }
        }

        let _boost = SamplingBoost::begin(
            Arc::clone(&self.sampling),
            cfg.sensor_hub.fast_interval_ms,
        );
        let Some(guard) = self.relays.engage(pin)? else {
            return Ok(Outcome::Refused);
        };
        let ceiling = cfg.max_watering_time();
        let deadline = Instant::now() + ceiling;
        info!(plant = %plant.id, stop = plant.stop_threshold, ?ceiling, "sensor-fed watering");

        let outcome = loop {
            if self.relays.abort_state().is_set() {
                break Outcome::Aborted;
            }
            if self
                .moisture(plant)
                .is_some_and(|pct| pct >= plant.stop_threshold)
            {
                break Outcome::ThresholdReached;
            }
            let now = Instant::now();
            if now >= deadline {
                break Outcome::TimedOut;
            }
            sleep((deadline - now).min(POLL)).await;
        };
        guard.release()?;

        match outcome {
            Outcome::TimedOut => {
                warn!(plant = %plant.id, ?ceiling, "max watering time reached")
            }
            _ => info!(plant = %plant.id, ?outcome, "sensor-fed watering finished"),
        }
        Ok(outcome)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
