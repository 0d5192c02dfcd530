use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<HubState>>;

/// Operator-facing view of what the hub has been doing: connection state
/// and a bounded log of notable events.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<HubEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Irrigation,
    Abort,
    Error,
    System,
}

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_irrigation(&mut self, detail: String) {
        self.push_event(EventKind::Irrigation, detail);
    }

    pub fn record_abort(&mut self, detail: String) {
        self.push_event(EventKind::Abort, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Newest first.
    pub fn recent_events(&self) -> Vec<HubEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_newest_first() {
        let mut st = HubState::new();
        st.record_system("hub started".into());
        st.record_abort("operator abort".into());

        let events = st.recent_events();
        assert_eq!(events[0].kind, EventKind::Abort);
        assert_eq!(events[1].detail, "hub started");
    }

    #[test]
    fn event_log_is_bounded() {
        let mut st = HubState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_irrigation(format!("cycle {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "cycle 5");
    }
}
