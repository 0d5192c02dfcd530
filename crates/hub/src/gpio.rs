//! Relay outputs and digital inputs. The `gpio` feature gates the real rppal
//! driver; `MockBoard` logs state changes instead of touching hardware and
//! backs the tests.
//!
//! Relay boards on the enclosure are active-low: logical ON drives the pin
//! LOW, OFF drives it HIGH.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::abort::AbortState;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("pin {0} is not configured as an output")]
    NotAnOutput(u8),
    #[error("pin {0} is not configured as an input")]
    NotAnInput(u8),
    #[error("pin {0} did not accept the write")]
    WriteFailed(u8),
    #[cfg(feature = "gpio")]
    #[error("gpio driver error")]
    Driver(#[from] rppal::gpio::Error),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Capability over the physical digital channels.  Writes to one pin are
/// serialized by the implementation.
pub trait ActuatorPort: Send + Sync {
    /// Claim `pin` as a relay output and drive it OFF.
    fn init_output(&self, pin: u8) -> Result<(), GpioError>;
    fn init_input(&self, pin: u8) -> Result<(), GpioError>;
    /// Drive a relay to a logical state.
    fn set(&self, pin: u8, on: bool) -> Result<(), GpioError>;
    /// Logical state of a relay output.
    fn is_on(&self, pin: u8) -> Result<bool, GpioError>;
    /// Physical level of an input, `true` = HIGH.
    fn read_input(&self, pin: u8) -> Result<bool, GpioError>;
    /// Every claimed output.
    fn outputs(&self) -> Vec<u8>;
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    gpio: Gpio,
    outputs: Mutex<BTreeMap<u8, OutputPin>>,
    inputs: Mutex<BTreeMap<u8, InputPin>>,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new() -> Result<Self, GpioError> {
        Ok(Self {
            gpio: Gpio::new()?,
            outputs: Mutex::new(BTreeMap::new()),
            inputs: Mutex::new(BTreeMap::new()),
        })
    }
}

#[cfg(feature = "gpio")]
impl ActuatorPort for RelayBoard {
    fn init_output(&self, pin: u8) -> Result<(), GpioError> {
        let mut outputs = lock(&self.outputs);
        if outputs.contains_key(&pin) {
            return Ok(());
        }
        // Active-low: start HIGH so the relay never pulses ON while claimed.
        let out = self.gpio.get(pin)?.into_output_high();
        outputs.insert(pin, out);
        info!(pin, "relay output initialised");
        Ok(())
    }

    fn init_input(&self, pin: u8) -> Result<(), GpioError> {
        let mut inputs = lock(&self.inputs);
        if !inputs.contains_key(&pin) {
            inputs.insert(pin, self.gpio.get(pin)?.into_input());
            info!(pin, "digital input initialised");
        }
        Ok(())
    }

    fn set(&self, pin: u8, on: bool) -> Result<(), GpioError> {
        let mut outputs = lock(&self.outputs);
        let out = outputs.get_mut(&pin).ok_or(GpioError::NotAnOutput(pin))?;
        if on {
            out.set_low();
        } else {
            out.set_high();
        }
        info!(pin, state = if on { "ON" } else { "OFF" }, "relay set");
        Ok(())
    }

    fn is_on(&self, pin: u8) -> Result<bool, GpioError> {
        let outputs = lock(&self.outputs);
        let out = outputs.get(&pin).ok_or(GpioError::NotAnOutput(pin))?;
        Ok(out.is_set_low())
    }

    fn read_input(&self, pin: u8) -> Result<bool, GpioError> {
        let inputs = lock(&self.inputs);
        let input = inputs.get(&pin).ok_or(GpioError::NotAnInput(pin))?;
        Ok(input.is_high())
    }

    fn outputs(&self) -> Vec<u8> {
        lock(&self.outputs).keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockBoard {
    pins: Mutex<MockPins>,
}

#[derive(Default)]
struct MockPins {
    outputs: BTreeMap<u8, bool>,
    inputs: BTreeMap<u8, bool>,
    on_writes: BTreeMap<u8, usize>,
    off_writes: BTreeMap<u8, usize>,
    /// Most outputs ever ON at the same time.
    peak_on: usize,
    failing: HashSet<u8>,
}

impl MockBoard {
    pub fn new() -> Self {
        info!("[mock-gpio] relay board initialised (no hardware)");
        Self::default()
    }

    /// Drive a simulated input level.
    pub fn set_input(&self, pin: u8, high: bool) {
        lock(&self.pins).inputs.insert(pin, high);
    }

    /// Make every write to `pin` fail, as a dead relay channel would.
    #[cfg(test)]
    pub fn fail_pin(&self, pin: u8) {
        lock(&self.pins).failing.insert(pin);
    }

    #[cfg(test)]
    pub fn on_writes(&self, pin: u8) -> usize {
        lock(&self.pins).on_writes.get(&pin).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn off_writes(&self, pin: u8) -> usize {
        lock(&self.pins).off_writes.get(&pin).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn peak_on(&self) -> usize {
        lock(&self.pins).peak_on
    }
}

impl ActuatorPort for MockBoard {
    fn init_output(&self, pin: u8) -> Result<(), GpioError> {
        let mut pins = lock(&self.pins);
        pins.outputs.insert(pin, false);
        info!(pin, "[mock-gpio] registered relay output (not wired)");
        Ok(())
    }

    fn init_input(&self, pin: u8) -> Result<(), GpioError> {
        lock(&self.pins).inputs.entry(pin).or_insert(false);
        Ok(())
    }

    fn set(&self, pin: u8, on: bool) -> Result<(), GpioError> {
        let mut pins = lock(&self.pins);
        if pins.failing.contains(&pin) {
            return Err(GpioError::WriteFailed(pin));
        }
        let state = pins.outputs.get_mut(&pin).ok_or(GpioError::NotAnOutput(pin))?;
        *state = on;
        let on_now = pins.outputs.values().filter(|&&v| v).count();
        pins.peak_on = pins.peak_on.max(on_now);
        let counter = if on {
            &mut pins.on_writes
        } else {
            &mut pins.off_writes
        };
        *counter.entry(pin).or_insert(0) += 1;
        info!(pin, state = if on { "ON" } else { "OFF" }, "[mock-gpio] relay set");
        Ok(())
    }

    fn is_on(&self, pin: u8) -> Result<bool, GpioError> {
        lock(&self.pins)
            .outputs
            .get(&pin)
            .copied()
            .ok_or(GpioError::NotAnOutput(pin))
    }

    fn read_input(&self, pin: u8) -> Result<bool, GpioError> {
        lock(&self.pins)
            .inputs
            .get(&pin)
            .copied()
            .ok_or(GpioError::NotAnInput(pin))
    }

    fn outputs(&self) -> Vec<u8> {
        lock(&self.pins).outputs.keys().copied().collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Abort-gated relay front
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    Done,
    Refused,
}

/// Every actuation path goes through here so the abort flag is checked
/// before anything is energised.
#[derive(Clone)]
pub struct Relays {
    port: Arc<dyn ActuatorPort>,
    abort: AbortState,
}

impl Relays {
    pub fn new(port: Arc<dyn ActuatorPort>, abort: AbortState) -> Self {
        Self { port, abort }
    }

    pub fn init_outputs(&self, pins: &[u8]) -> Result<Switch, GpioError> {
        if self.abort.is_set() {
            warn!(?pins, "abort active: refusing output initialisation");
            return Ok(Switch::Refused);
        }
        for &pin in pins {
            self.port.init_output(pin)?;
        }
        Ok(Switch::Done)
    }

    pub fn init_inputs(&self, pins: &[u8]) -> Result<(), GpioError> {
        for &pin in pins {
            self.port.init_input(pin)?;
        }
        Ok(())
    }

    /// Energise `pin`.  The returned guard switches it back off when
    /// released or dropped; `None` means the abort flag refused the request.
    pub fn engage(&self, pin: u8) -> Result<Option<PumpGuard>, GpioError> {
        if self.abort.is_set() {
            warn!(pin, "abort active: refusing to switch on");
            return Ok(None);
        }
        let guard = PumpGuard {
            port: Arc::clone(&self.port),
            pin,
            armed: true,
        };
        self.port.set(pin, true)?;
        // An abort that landed between the check and the write already swept
        // this pin; dropping the guard turns it off again.
        if self.abort.is_set() {
            warn!(pin, "abort raced switch-on: relay released");
            return Ok(None);
        }
        Ok(Some(guard))
    }

    pub fn turn_on(&self, pin: u8) -> Result<Switch, GpioError> {
        match self.engage(pin)? {
            Some(guard) => {
                guard.disarm();
                Ok(Switch::Done)
            }
            None => Ok(Switch::Refused),
        }
    }

    pub fn turn_off(&self, pin: u8) -> Result<(), GpioError> {
        self.port.set(pin, false)
    }

    /// Switch every output off, continuing past individual failures.
    /// Returns the pins that could not be switched.
    pub fn all_off(&self) -> Vec<u8> {
        all_off(self.port.as_ref())
    }

    pub fn read_input(&self, pin: u8) -> Result<bool, GpioError> {
        self.port.read_input(pin)
    }

    pub fn is_on(&self, pin: u8) -> Result<bool, GpioError> {
        self.port.is_on(pin)
    }

    pub fn abort_state(&self) -> &AbortState {
        &self.abort
    }
}

pub(crate) fn all_off(port: &dyn ActuatorPort) -> Vec<u8> {
    let mut failed = Vec::new();
    for pin in port.outputs() {
        if let Err(e) = port.set(pin, false) {
            error!(pin, "failed to switch relay off: {e}");
            failed.push(pin);
        }
    }
    failed
}

/// Holds a relay ON.  The relay is switched OFF exactly once: by
/// [`PumpGuard::release`] or, failing that, on drop (early return, error,
/// task cancellation).
pub struct PumpGuard {
    port: Arc<dyn ActuatorPort>,
    pin: u8,
    armed: bool,
}

impl PumpGuard {
    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn release(mut self) -> Result<(), GpioError> {
        self.armed = false;
        self.port.set(self.pin, false)
    }

    /// Leave the relay ON and forget about it.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.port.set(self.pin, false) {
                error!(pin = self.pin, "failed to switch relay off on drop: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
