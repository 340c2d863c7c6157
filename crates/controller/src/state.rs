use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuator::ActuatorState;
use crate::bus::{Channel, Quantity};
use crate::sensors::{SensorSnapshot, StatusBits};
use crate::sequencer::SessionReport;
use crate::settings::Settings;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub ticks: u64,
    pub last_tick: Option<OffsetDateTime>,
    pub sensors: Option<SensorSnapshot>,
    pub sensor_faults: [u32; Quantity::COUNT],
    pub status: StatusBits,
    pub actuators: ActuatorState,
    pub watering: Option<Channel>,
    pub last_session: Option<SessionReport>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Watering,
    Actuator,
    Command,
    Fault,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct SensorView {
    pub name: &'static str,
    pub value: u8,
    pub faulted: bool,
    pub fault_count: u32,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub ticks: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_tick: Option<OffsetDateTime>,
    pub sensors: Vec<SensorView>,
    pub status_bits: StatusBits,
    pub actuators: ActuatorState,
    pub io_bits: u8,
    pub watering: Option<Channel>,
    pub last_session: Option<SessionReport>,
    pub settings: Settings,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ticks: 0,
            last_tick: None,
            sensors: None,
            sensor_faults: [0; Quantity::COUNT],
            status: StatusBits::default(),
            actuators: ActuatorState::default(),
            watering: None,
            last_session: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record the outcome of a sensor refresh.
    pub fn record_tick(
        &mut self,
        now: OffsetDateTime,
        snapshot: SensorSnapshot,
        faults: [u32; Quantity::COUNT],
        status: StatusBits,
        actuators: ActuatorState,
    ) {
        self.ticks += 1;
        self.last_tick = Some(now);
        self.sensors = Some(snapshot);
        self.sensor_faults = faults;
        self.status = status;
        self.actuators = actuators;
    }

    pub fn record_watering_start(&mut self, ch: Channel, target: u8) {
        self.watering = Some(ch);
        self.push_event(
            EventKind::Watering,
            format!("channel {ch} started, target {target}"),
        );
    }

    pub fn record_watering_end(&mut self, report: SessionReport) {
        let detail = match &report.aborted {
            None => format!(
                "channel {} done, delivered {} in {} units",
                report.channel, report.delivered, report.elapsed
            ),
            Some(reason) => format!(
                "channel {} aborted ({reason:?}), delivered {}/{} in {} units",
                report.channel, report.delivered, report.target, report.elapsed
            ),
        };
        self.watering = None;
        self.last_session = Some(report);
        self.push_event(EventKind::Watering, detail);
    }

    /// Record a manual actuation and the resulting output state.
    pub fn record_actuator(&mut self, detail: String, actuators: ActuatorState) {
        self.actuators = actuators;
        self.push_event(EventKind::Actuator, detail);
    }

    /// Output levels as the sequencer left them; no event.
    pub fn record_outputs(&mut self, actuators: ActuatorState) {
        self.actuators = actuators;
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_fault(&mut self, detail: String) {
        self.push_event(EventKind::Fault, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, settings: Settings) -> StatusResponse {
        let sensors = match &self.sensors {
            Some(snap) => Quantity::ALL
                .into_iter()
                .map(|q| SensorView {
                    name: q.name(),
                    value: snap.get(q),
                    faulted: snap.faulted[q.index()],
                    fault_count: self.sensor_faults[q.index()],
                })
                .collect(),
            None => Vec::new(),
        };
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            ticks: self.ticks,
            last_tick: self.last_tick,
            sensors,
            status_bits: self.status,
            actuators: self.actuators,
            io_bits: self.actuators.io_bits(),
            watering: self.watering,
            last_session: self.last_session.clone(),
            settings,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::AbortReason;

    #[test]
    fn ring_buffer_keeps_latest_events() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 5");

        let status = st.to_status(Settings::default());
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 4));
    }

    #[test]
    fn watering_lifecycle_sets_and_clears_active_channel() {
        let mut st = SystemState::new();
        let ch = Channel::new(2).unwrap();
        st.record_watering_start(ch, 80);
        assert_eq!(st.watering, Some(ch));

        st.record_watering_end(SessionReport {
            channel: ch,
            target: 80,
            delivered: 12,
            elapsed: 100,
            aborted: Some(AbortReason::Timeout),
        });
        assert_eq!(st.watering, None);
        assert!(st.events.back().unwrap().detail.contains("aborted"));
        assert_eq!(st.last_session.as_ref().unwrap().delivered, 12);
    }

    #[test]
    fn status_lists_sensors_after_first_tick() {
        let mut st = SystemState::new();
        assert!(st.to_status(Settings::default()).sensors.is_empty());

        let mut values = [0; Quantity::COUNT];
        values[Quantity::Rain.index()] = 205;
        let snap = SensorSnapshot {
            values,
            faulted: [false; Quantity::COUNT],
        };
        let mut faults = [0; Quantity::COUNT];
        faults[Quantity::Pressure.index()] = 3;
        st.record_tick(
            OffsetDateTime::now_utc(),
            snap,
            faults,
            StatusBits::default(),
            ActuatorState::default(),
        );

        let status = st.to_status(Settings::default());
        assert_eq!(status.ticks, 1);
        assert_eq!(status.sensors.len(), Quantity::COUNT);
        let rain = status.sensors.iter().find(|s| s.name == "rain").unwrap();
        assert_eq!(rain.value, 205);
        let pressure = status.sensors.iter().find(|s| s.name == "pressure").unwrap();
        assert_eq!(pressure.fault_count, 3);
    }
}
