//! Per-channel rolling aggregation of the device's readings.
//!
//! Every channel keeps at most `max_readings` readings, evicted oldest
//! first, and a snapshot of their means.  History and snapshot of a channel
//! change together under one write lock, so readers never observe one
//! without the other.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::calibration::{round2, Calibration};
use crate::wire::{self, FieldValue};

/// Read access to aggregated channel state.
pub trait SensorReader: Send + Sync {
    fn latest(&self, label: &str) -> Option<ChannelSnapshot>;
    /// Newest raw sample of a channel, unaveraged.
    fn latest_raw(&self, label: &str) -> Option<f64>;
}

/// One stored reading.  Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub raw_value: Option<f64>,
    pub percentage: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub label: String,
    pub raw_value: Option<f64>,
    pub percentage: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
    pub samples: usize,
    pub calibrated: bool,
    /// The most recent line for this channel could not be decoded.
    pub degraded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip)]
    pub received_at: Instant,
}

impl ChannelSnapshot {
    pub fn age(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

#[derive(Default)]
struct Channel {
    calibration: Option<Calibration>,
    history: VecDeque<SensorReading>,
    latest: Option<ChannelSnapshot>,
}

impl Channel {
    fn push(&mut self, reading: SensorReading, max_readings: usize) {
        self.history.push_back(reading);
        self.truncate(max_readings);
    }

    fn truncate(&mut self, max_readings: usize) {
        while self.history.len() > max_readings {
            self.history.pop_front();
        }
    }

    fn aggregate(&self, label: &str) -> ChannelSnapshot {
        let raw = self.history.iter().filter_map(|r| r.raw_value);
        let pct = self.history.iter().filter_map(|r| r.percentage);

        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for reading in &self.history {
            for (name, v) in &reading.fields {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0));
                entry.0 += v;
                entry.1 += 1;
            }
        }

        ChannelSnapshot {
            label: label.to_string(),
            raw_value: mean(raw),
            percentage: mean(pct),
            fields: sums
                .into_iter()
                .map(|(name, (sum, n))| (name.to_string(), round2(sum / n as f64)))
                .collect(),
            samples: self.history.len(),
            calibrated: self.calibration.is_some(),
            degraded: false,
            updated_at: OffsetDateTime::now_utc(),
            received_at: Instant::now(),
        }
    }

    fn degraded(&self, label: &str) -> ChannelSnapshot {
        ChannelSnapshot {
            label: label.to_string(),
            raw_value: None,
            percentage: None,
            fields: BTreeMap::new(),
            samples: self.history.len(),
            calibrated: self.calibration.is_some(),
            degraded: true,
            updated_at: OffsetDateTime::now_utc(),
            received_at: Instant::now(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| round2(sum / n as f64))
}

struct Inner {
    max_readings: usize,
    channels: BTreeMap<String, Channel>,
}

pub struct SensorAggregator {
    inner: RwLock<Inner>,
}

impl SensorAggregator {
    pub fn new(max_readings: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                max_readings: max_readings.max(1),
                channels: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode one line and fold it into its channel.  A line that cannot be
    /// decoded leaves a degraded snapshot on the channel it names; one that
    /// names no channel at all is dropped.
    pub fn ingest(&self, line: &str) -> Option<ChannelSnapshot> {
        let line = line.trim();
        let m = match wire::parse_line(line) {
            Ok(m) => m,
            Err(e) => {
                let Some(label) = wire::recover_label(line) else {
                    warn!(line, "undecodable reading without channel label: {e}");
                    return None;
                };
                warn!(label = %label, line, "degraded reading: {e}");
                let mut inner = self.write();
                let channel = inner.channels.entry(label.clone()).or_default();
                let snapshot = channel.degraded(&label);
                channel.latest = Some(snapshot.clone());
                return Some(snapshot);
            }
        };

        let label = m.label();
        let mut inner = self.write();
        let max_readings = inner.max_readings;
        let channel = inner.channels.entry(label.clone()).or_default();

        let reading = match m.value {
            FieldValue::Single(raw) => SensorReading {
                raw_value: Some(raw),
                percentage: channel.calibration.map(|c| c.convert(raw)),
                fields: BTreeMap::new(),
                timestamp_ns: m.timestamp_ns,
            },
            FieldValue::Compound(fields) => SensorReading {
                raw_value: None,
                percentage: None,
                fields: fields.into_iter().collect(),
                timestamp_ns: m.timestamp_ns,
            },
        };
        channel.push(reading, max_readings);
        let snapshot = channel.aggregate(&label);
        channel.latest = Some(snapshot.clone());
        debug!(
            label = %label,
            raw = ?snapshot.raw_value,
            pct = ?snapshot.percentage,
            samples = snapshot.samples,
            "reading aggregated"
        );
        Some(snapshot)
    }

    /// Latest snapshot of every channel that has received data.
    pub fn snapshot(&self) -> BTreeMap<String, ChannelSnapshot> {
        self.read()
            .channels
            .iter()
            .filter_map(|(label, c)| c.latest.clone().map(|s| (label.clone(), s)))
            .collect()
    }

    pub fn history(&self, label: &str) -> Vec<SensorReading> {
        self.read()
            .channels
            .get(label)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn max_readings(&self) -> usize {
        self.read().max_readings
    }

    /// Resize every channel's window.  Shrinking drops the oldest readings;
    /// nothing else is cleared.
    pub fn set_max_readings(&self, max_readings: usize) {
        let max_readings = max_readings.max(1);
        let mut inner = self.write();
        inner.max_readings = max_readings;
        for (label, channel) in inner.channels.iter_mut() {
            if channel.history.len() > max_readings {
                channel.truncate(max_readings);
                if channel.latest.as_ref().is_some_and(|s| !s.degraded) {
                    channel.latest = Some(channel.aggregate(label));
                }
            }
        }
    }

    /// Install a calibration.  Applies to readings arriving from now on;
    /// stored readings keep the percentage they were taken with.
    pub fn set_calibration(&self, label: &str, calibration: Option<Calibration>) {
        let mut inner = self.write();
        let channel = inner.channels.entry(label.to_string()).or_default();
        channel.calibration = calibration;
        if let Some(latest) = channel.latest.as_mut() {
            latest.calibrated = calibration.is_some();
        }
    }

    pub fn calibration(&self, label: &str) -> Option<Calibration> {
        self.read().channels.get(label).and_then(|c| c.calibration)
    }

    pub fn remove_channel(&self, label: &str) -> bool {
        self.write().channels.remove(label).is_some()
    }
}

impl SensorReader for SensorAggregator {
    fn latest(&self, label: &str) -> Option<ChannelSnapshot> {
        self.read().channels.get(label).and_then(|c| c.latest.clone())
    }

    fn latest_raw(&self, label: &str) -> Option<f64> {
        self.read()
            .channels
            .get(label)
            .and_then(|c| c.history.back())
            .and_then(|r| r.raw_value)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
