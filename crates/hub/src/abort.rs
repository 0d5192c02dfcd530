//! Safety abort: a shared flag every actuation path consults, and the sweep
//! that forces every relay off when it is raised.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::gpio::{self, ActuatorPort};

/// Abort mode.  Cheap to clone; all clones share one flag.  While set, no
/// relay may be switched on or initialised.
#[derive(Debug, Clone, Default)]
pub struct AbortState(Arc<AtomicBool>);

impl AbortState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortReport {
    pub switched_off: Vec<u8>,
    pub failed: Vec<u8>,
}

pub struct SafetyAbort {
    state: AbortState,
    port: Arc<dyn ActuatorPort>,
}

impl SafetyAbort {
    pub fn new(state: AbortState, port: Arc<dyn ActuatorPort>) -> Self {
        Self { state, port }
    }

    /// Enter abort mode and switch every known output off.  One dead channel
    /// does not stop the sweep.
    pub fn abort(&self) -> AbortReport {
        self.state.set();
        let outputs = self.port.outputs();
        let failed = gpio::all_off(self.port.as_ref());
        let switched_off = outputs
            .into_iter()
            .filter(|pin| !failed.contains(pin))
            .collect::<Vec<_>>();

        if failed.is_empty() {
            warn!(outputs = switched_off.len(), "ABORT: all outputs switched off");
        } else {
            error!(?failed, "ABORT: some outputs could not be switched off");
        }
        AbortReport {
            switched_off,
            failed,
        }
    }

    /// Leave abort mode.  Only ever called on explicit operator request.
    pub fn reset(&self) {
        self.state.clear();
        info!("abort cleared, actuation re-enabled");
    }

    pub fn is_aborted(&self) -> bool {
        self.state.is_set()
    }

    pub fn state(&self) -> &AbortState {
        &self.state
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{MockBoard, Relays, Switch};

    fn setup(pins: &[u8]) -> (Arc<MockBoard>, SafetyAbort) {
        let board = Arc::new(MockBoard::new());
        for &pin in pins {
            board.init_output(pin).unwrap();
        }
        let safety = SafetyAbort::new(AbortState::new(), board.clone());
        (board, safety)
    }

    #[test]
    fn clones_share_one_flag() {
        let a = AbortState::new();
        let b = a.clone();
        a.set();
        assert!(b.is_set());
        b.clear();
        assert!(!a.is_set());
    }

    #[test]
    fn abort_sets_flag_and_switches_everything_off() {
        let (board, safety) = setup(&[5, 16]);
        board.set(5, true).unwrap();
        board.set(16, true).unwrap();

        let report = safety.abort();

        assert!(safety.is_aborted());
        assert_eq!(report.switched_off, vec![5, 16]);
        assert!(report.failed.is_empty());
        assert!(!board.is_on(5).unwrap());
        assert!(!board.is_on(16).unwrap());
    }

    #[test]
    fn abort_sweep_survives_a_dead_channel() {
        let (board, safety) = setup(&[5, 6, 16]);
        board.set(16, true).unwrap();
        board.fail_pin(6);

        let report = safety.abort();

        assert_eq!(report.failed, vec![6]);
        assert_eq!(report.switched_off, vec![5, 16]);
        assert!(!board.is_on(16).unwrap());
    }

    #[test]
    fn pump_stays_off_after_abort_until_reset() {
        let (board, safety) = setup(&[5]);
        let relays = Relays::new(board.clone(), safety.state().clone());

        safety.abort();
        assert_eq!(relays.turn_on(5).unwrap(), Switch::Refused);
        assert!(!board.is_on(5).unwrap());

        safety.reset();
        assert!(!safety.is_aborted());
        assert_eq!(relays.turn_on(5).unwrap(), Switch::Done);
        assert!(board.is_on(5).unwrap());
    }
}
