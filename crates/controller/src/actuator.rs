//! Pump and valve control with the pump interlock.
//!
//! The gateway tracks what it last commanded. The pump may only run while
//! at least one valve is commanded open; a write that fails drives the line
//! back to its safe level (closed/off) and the line is recorded as such.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bus::{Bus, BusFault, Channel, Line};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorFault {
    #[error("{line} write failed: {source}")]
    Bus { line: Line, source: BusFault },
    #[error("pump start rejected: no valve open")]
    PumpWithoutValve,
}

/// Commanded output levels, as reported over telemetry and the status API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub pump: bool,
    pub valves: [bool; Channel::COUNT],
}

impl ActuatorState {
    /// Pump in bit 0, valve `n` in bit `n`.
    pub fn io_bits(&self) -> u8 {
        let valves = Channel::ALL
            .into_iter()
            .filter(|ch| self.valves[ch.index()])
            .fold(0u8, |m, ch| m | (ch.mask() << 1));
        valves | u8::from(self.pump)
    }

    pub fn open_valves(&self) -> usize {
        self.valves.iter().filter(|v| **v).count()
    }
}

#[derive(Debug, Default)]
pub struct ActuatorGateway {
    state: ActuatorState,
    faults: u32,
}

impl ActuatorGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn pump_on(&self) -> bool {
        self.state.pump
    }

    pub fn valve_open(&self, ch: Channel) -> bool {
        self.state.valves[ch.index()]
    }

    pub fn fault_count(&self) -> u32 {
        self.faults
    }

    pub fn set_valve(
        &mut self,
        bus: &mut dyn Bus,
        ch: Channel,
        open: bool,
    ) -> Result<(), ActuatorFault> {
        if !open && self.state.pump && self.valve_open(ch) && self.state.open_valves() == 1 {
            warn!(channel = %ch, "closing last open valve, stopping pump first");
            // Even if the pump write fails its state is recorded as off and
            // the line was driven low, so carry on closing the valve.
            let _ = self.set_pump(bus, false);
        }

        let line = Line::Valve(ch);
        match bus.write_line(line, open) {
            Ok(()) => {
                self.state.valves[ch.index()] = open;
                info!(channel = %ch, open, "valve set");
                Ok(())
            }
            Err(source) => {
                self.fail_safe_line(bus, line, &source);
                self.state.valves[ch.index()] = false;
                if self.state.pump && self.state.open_valves() == 0 {
                    let _ = self.set_pump(bus, false);
                }
                Err(ActuatorFault::Bus { line, source })
            }
        }
    }

    pub fn set_pump(&mut self, bus: &mut dyn Bus, on: bool) -> Result<(), ActuatorFault> {
        if on && self.state.open_valves() == 0 {
            self.faults += 1;
            warn!("pump start rejected: all valves closed");
            return Err(ActuatorFault::PumpWithoutValve);
        }

        match bus.write_line(Line::Pump, on) {
            Ok(()) => {
                self.state.pump = on;
                info!(on, "pump set");
                Ok(())
            }
            Err(source) => {
                self.fail_safe_line(bus, Line::Pump, &source);
                self.state.pump = false;
                Err(ActuatorFault::Bus {
                    line: Line::Pump,
                    source,
                })
            }
        }
    }

    /// Read back a line. A failed read reports closed/off.
    pub fn read(&mut self, bus: &mut dyn Bus, line: Line) -> bool {
        match bus.read_line(line) {
            Ok(v) => v,
            Err(e) => {
                self.faults += 1;
                error!(%line, error = %e, "line read failed, reporting off");
                false
            }
        }
    }

    /// Pump off, then every valve closed. Every line is attempted; the first
    /// failure is returned.
    pub fn all_off(&mut self, bus: &mut dyn Bus) -> Result<(), ActuatorFault> {
        let mut first = self.set_pump(bus, false).err();
        for ch in Channel::ALL {
            if let Err(e) = self.set_valve(bus, ch, false) {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail_safe_line(&mut self, bus: &mut dyn Bus, line: Line, source: &BusFault) {
        self.faults += 1;
        error!(%line, error = %source, "actuator write failed, driving line to safe level");
        if let Err(e) = bus.write_line(line, false) {
            error!(%line, error = %e, "safe-level write also failed");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::BusOp;
    use crate::bus::SimBus;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn pump_start_rejected_with_all_valves_closed() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        assert_eq!(gw.set_pump(&mut bus, true), Err(ActuatorFault::PumpWithoutValve));
        assert!(!gw.pump_on());
        assert!(!bus.pump());
        assert!(bus.history().is_empty());
        assert_eq!(gw.fault_count(), 1);
    }

    #[test]
    fn pump_runs_once_a_valve_is_open() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(2), true).unwrap();
        gw.set_pump(&mut bus, true).unwrap();
        assert!(bus.pump());
        assert_eq!(gw.state().io_bits(), 0b0000_0101);
    }

    #[test]
    fn closing_last_valve_stops_pump_first() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(1), true).unwrap();
        gw.set_pump(&mut bus, true).unwrap();
        gw.set_valve(&mut bus, ch(1), false).unwrap();

        assert!(!bus.pump());
        assert_eq!(bus.pump_without_valve(), 0);
        let tail = &bus.history()[2..];
        assert_eq!(
            tail,
            &[BusOp::Write(Line::Pump, false), BusOp::Write(Line::Valve(ch(1)), false)]
        );
    }

    #[test]
    fn closing_one_of_two_valves_keeps_pump() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(1), true).unwrap();
        gw.set_valve(&mut bus, ch(2), true).unwrap();
        gw.set_pump(&mut bus, true).unwrap();
        gw.set_valve(&mut bus, ch(1), false).unwrap();
        assert!(bus.pump());
    }

    #[test]
    fn failed_valve_write_records_closed_and_stops_pump() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(3), true).unwrap();
        gw.set_pump(&mut bus, true).unwrap();

        bus.fail_line(Line::Valve(ch(3)), true);
        let err = gw.set_valve(&mut bus, ch(3), true).unwrap_err();
        assert!(matches!(err, ActuatorFault::Bus { line: Line::Valve(_), .. }));
        assert!(!gw.valve_open(ch(3)));
        assert!(!gw.pump_on());
        assert!(!bus.pump());
    }

    #[test]
    fn failed_pump_write_records_off() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(1), true).unwrap();
        bus.fail_line(Line::Pump, true);
        assert!(gw.set_pump(&mut bus, true).is_err());
        assert!(!gw.pump_on());
    }

    #[test]
    fn failed_read_reports_off() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(1), true).unwrap();
        assert!(gw.read(&mut bus, Line::Valve(ch(1))));
        bus.fail_line(Line::Valve(ch(1)), true);
        assert!(!gw.read(&mut bus, Line::Valve(ch(1))));
    }

    #[test]
    fn all_off_stops_pump_before_valves() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        for c in Channel::ALL {
            gw.set_valve(&mut bus, c, true).unwrap();
        }
        gw.set_pump(&mut bus, true).unwrap();
        let before = bus.history().len();

        gw.all_off(&mut bus).unwrap();
        let tail = &bus.history()[before..];
        assert_eq!(tail[0], BusOp::Write(Line::Pump, false));
        assert_eq!(tail.len(), 1 + Channel::COUNT);
        assert_eq!(gw.state(), ActuatorState::default());
        assert_eq!(bus.pump_without_valve(), 0);
    }

    #[test]
    fn all_off_attempts_every_line_despite_failure() {
        let mut bus = SimBus::new();
        let mut gw = ActuatorGateway::new();
        gw.set_valve(&mut bus, ch(4), true).unwrap();
        gw.set_valve(&mut bus, ch(5), true).unwrap();
        bus.fail_line(Line::Valve(ch(4)), true);

        assert!(gw.all_off(&mut bus).is_err());
        assert!(!bus.valve(ch(5)));
        assert_eq!(gw.state().open_valves(), 0);
    }
}
