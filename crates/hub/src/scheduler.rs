//! Schedule engine: daily time-of-day watering cycles plus a periodic
//! moisture check that starts sensor-fed watering for dry plants.
//!
//! Both triggers share one cooperative loop.  Each job and each plant
//! evaluation runs on its own task and is awaited there, so a panic is
//! contained to that unit and logged; the loop carries on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::abort::AbortState;
use crate::config::{Plant, ScheduledEvent};
use crate::irrigation::{IrrigationActuator, IrrigationError, Outcome};
use crate::sensors::SensorReader;
use crate::state::SharedState;
use crate::store::Settings;

/// How often the loop wakes to look for due work.
const TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Wall-clock minute of the day, written `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    fn as_time(self) -> Time {
        Time::from_hms(self.hour, self.minute, 0).unwrap_or(Time::MIDNIGHT)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid time of day '{0}', expected HH:MM")]
pub struct TimeOfDayError(String);

impl FromStr for TimeOfDay {
    type Err = TimeOfDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeOfDayError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        let hour = h.parse().map_err(|_| err())?;
        let minute = m.parse().map_err(|_| err())?;
        Self::new(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = TimeOfDayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// First occurrence of `at` strictly after `now`.
fn next_occurrence(at: TimeOfDay, now: PrimitiveDateTime) -> PrimitiveDateTime {
    let today = now.date().with_time(at.as_time());
    if today > now {
        today
    } else {
        today + time::Duration::days(1)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Local wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

/// The system clock shifted by a fixed offset.  The offset is determined
/// once at startup, before any threads exist, and does not follow DST.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

// ---------------------------------------------------------------------------
// Irrigator
// ---------------------------------------------------------------------------

/// The actuation sequences the scheduler triggers.
pub trait Irrigator: Send + Sync + 'static {
    /// Whether a sequence is running right now.
    fn is_busy(&self) -> bool;
    fn run_cycle(&self) -> impl Future<Output = Result<Outcome, IrrigationError>> + Send;
    fn sensor_based_distribute(
        &self,
        plant: &Plant,
    ) -> impl Future<Output = Result<Outcome, IrrigationError>> + Send;
}

impl Irrigator for IrrigationActuator {
    fn is_busy(&self) -> bool {
        IrrigationActuator::is_busy(self)
    }

    fn run_cycle(&self) -> impl Future<Output = Result<Outcome, IrrigationError>> + Send {
        IrrigationActuator::run_cycle(self)
    }

    fn sensor_based_distribute(
        &self,
        plant: &Plant,
    ) -> impl Future<Output = Result<Outcome, IrrigationError>> + Send {
        IrrigationActuator::sensor_based_distribute(self, plant)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    pub time_of_day: TimeOfDay,
    pub next_run: String,
}

pub struct ScheduleEngine<I> {
    irrigator: Arc<I>,
    sensors: Arc<dyn SensorReader>,
    settings: Arc<Settings>,
    abort: AbortState,
    clock: Arc<dyn Clock>,
    shared: SharedState,
    jobs: Mutex<BTreeMap<TimeOfDay, PrimitiveDateTime>>,
}

impl<I: Irrigator> ScheduleEngine<I> {
    pub fn new(
        irrigator: Arc<I>,
        sensors: Arc<dyn SensorReader>,
        settings: Arc<Settings>,
        abort: AbortState,
        clock: Arc<dyn Clock>,
        shared: SharedState,
    ) -> Self {
        let now = clock.now();
        let jobs = settings
            .snapshot()
            .event
            .scheduled_events
            .iter()
            .map(|e| (e.time_of_day, next_occurrence(e.time_of_day, now)))
            .collect();
        Self {
            irrigator,
            sensors,
            settings,
            abort,
            clock,
            shared,
            jobs: Mutex::new(jobs),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<TimeOfDay, PrimitiveDateTime>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a daily cycle.  Returns `false` if that time is already scheduled.
    pub fn add_schedule(&self, at: TimeOfDay) -> Result<bool> {
        if self.jobs().contains_key(&at) {
            debug!(time_of_day = %at, "already scheduled");
            return Ok(false);
        }
        self.settings.update(|cfg| {
            let event = ScheduledEvent { time_of_day: at };
            if !cfg.event.scheduled_events.contains(&event) {
                cfg.event.scheduled_events.push(event);
            }
            Ok(())
        })?;
        let next = next_occurrence(at, self.clock.now());
        self.jobs().insert(at, next);
        info!(time_of_day = %at, "daily watering scheduled");
        Ok(true)
    }

    pub fn remove_schedule(&self, at: TimeOfDay) -> Result<bool> {
        if !self.jobs().contains_key(&at) {
            return Ok(false);
        }
        self.settings.update(|cfg| {
            cfg.event.scheduled_events.retain(|e| e.time_of_day != at);
            Ok(())
        })?;
        self.jobs().remove(&at);
        info!(time_of_day = %at, "daily watering removed");
        Ok(true)
    }

    pub fn scheduled(&self) -> Vec<ScheduleEntry> {
        let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
        self.jobs()
            .iter()
            .map(|(at, next)| ScheduleEntry {
                time_of_day: *at,
                next_run: next.format(&fmt).unwrap_or_else(|_| next.to_string()),
            })
            .collect()
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_check = Instant::now() + self.settings.snapshot().threshold_interval();

        info!(jobs = self.jobs().len(), "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tick.tick() => {}
            }

            self.run_due_jobs().await;

            if Instant::now() >= next_check {
                self.check_thresholds().await;
                next_check = Instant::now() + self.settings.snapshot().threshold_interval();
            }
        }
        info!("scheduler stopped");
    }

    /// Run every job whose time has come and push it to its next day.
    /// Returns how many ran.
    pub async fn run_due_jobs(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<TimeOfDay> = self
            .jobs()
            .iter_mut()
            .filter(|(_, next)| **next <= now)
            .map(|(at, next)| {
                *next = next_occurrence(*at, now);
                *at
            })
            .collect();

        for at in &due {
            info!(time_of_day = %at, "scheduled watering cycle");
            let irrigator = Arc::clone(&self.irrigator);
            let result = tokio::spawn(async move { irrigator.run_cycle().await }).await;
            let detail = format!("scheduled cycle {at}");
            self.report(&detail, result).await;
        }
        due.len()
    }

    /// Evaluate every plant against its start threshold.  Returns the ids
    /// of the plants a watering was started for.
    pub async fn check_thresholds(&self) -> Vec<String> {
        if self.abort.is_set() {
            debug!("abort active: threshold check skipped");
            return Vec::new();
        }

        let cfg = self.settings.snapshot();
        let stale_after = cfg.stale_after();
        let mut watered = Vec::new();

        for plant in cfg.plants() {
            let sensor = &plant.moisture_sensor_id;
            let Some(snap) = self.sensors.latest(sensor) else {
                warn!(plant = %plant.id, sensor = %sensor, "no readings, skipping");
                continue;
            };
            if snap.degraded {
                warn!(plant = %plant.id, sensor = %sensor, "latest reading degraded, skipping");
                continue;
            }
            if !snap.calibrated {
                warn!(plant = %plant.id, sensor = %sensor, "sensor not calibrated, skipping");
                continue;
            }
            if snap.age() > stale_after {
                warn!(
                    plant = %plant.id,
                    sensor = %sensor,
                    age_sec = snap.age().as_secs(),
                    "stale sensor data, skipping"
                );
                continue;
            }
            let Some(pct) = snap.percentage else {
                warn!(plant = %plant.id, sensor = %sensor, "no moisture percentage, skipping");
                continue;
            };
            if pct >= plant.start_threshold {
                continue;
            }
            // The reading would be stale by the time a running sequence
            // finished; the next check re-evaluates it.
            if self.irrigator.is_busy() {
                info!(
                    plant = %plant.id,
                    moisture = pct,
                    "sequence in progress, deferring watering"
                );
                continue;
            }

            info!(
                plant = %plant.id,
                moisture = pct,
                start = plant.start_threshold,
                stop = plant.stop_threshold,
                "moisture below start threshold, watering"
            );
            let irrigator = Arc::clone(&self.irrigator);
            let job_plant = plant.clone();
            let result =
                tokio::spawn(async move { irrigator.sensor_based_distribute(&job_plant).await })
                    .await;
            let detail = format!("plant {}", plant.id);
            self.report(&detail, result).await;
            watered.push(plant.id);
        }
        watered
    }

    async fn report(
        &self,
        what: &str,
        result: Result<Result<Outcome, IrrigationError>, tokio::task::JoinError>,
    ) {
        let mut st = self.shared.write().await;
        match result {
            Ok(Ok(outcome)) => {
                info!(job = what, ?outcome, "job finished");
                st.record_irrigation(format!("{what}: {outcome:?}"));
            }
            Ok(Err(e)) => {
                error!(job = what, "job failed: {e}");
                st.record_error(format!("{what} failed: {e}"));
            }
            Err(e) => {
                error!(job = what, "job panicked: {e}");
                st.record_error(format!("{what} panicked"));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
