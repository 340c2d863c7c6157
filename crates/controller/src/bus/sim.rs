//! In-process stand-in for the sensor and output hardware. Used when the
//! `gpio` feature is off and by every test. Clones share one device state,
//! so a test can keep a handle while the controller owns another.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{Bus, BusFault, Channel, Line, Quantity};

/// What a [`SimBus`] saw happen, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Write(Line, bool),
    ResetFlowCounters,
}

struct Device {
    values: [u8; Quantity::COUNT],
    pump: bool,
    valves: [bool; Channel::COUNT],
    /// Power-good inputs are active low: `false` means the rail is up.
    rails: [bool; 3],
    /// Counter increment per flow read while the channel is pumping.
    flow_per_read: u8,
    noisy: bool,
    failing_reads: [bool; Quantity::COUNT],
    failing_lines: Vec<Line>,
    read_counts: [u32; Quantity::COUNT],
    history: Vec<BusOp>,
    /// Writes that left the pump running with every valve closed.
    pump_without_valve: u32,
}

impl Default for Device {
    fn default() -> Self {
        let mut values = [0; Quantity::COUNT];
        values[Quantity::Rain.index()] = 150;
        values[Quantity::Ground.index()] = 150;
        values[Quantity::TankLevel.index()] = 180;
        values[Quantity::Pressure.index()] = 10;
        values[Quantity::CpuTemp.index()] = 45;
        values[Quantity::AmbientTemp.index()] = 21;
        values[Quantity::ExposedTemp.index()] = 27;
        Self {
            values,
            pump: false,
            valves: [false; Channel::COUNT],
            rails: [false; 3],
            flow_per_read: 1,
            noisy: false,
            failing_reads: [false; Quantity::COUNT],
            failing_lines: Vec::new(),
            read_counts: [0; Quantity::COUNT],
            history: Vec::new(),
            pump_without_valve: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct SimBus {
    device: Arc<Mutex<Device>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A simulator whose analog readings wander a little on every read,
    /// for running the controller without hardware.
    pub fn noisy() -> Self {
        let bus = Self::new();
        bus.device().noisy = true;
        bus
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn jitter(value: u8) -> u8 {
    match fastrand::u8(0..3) {
        0 => value.saturating_sub(1),
        1 => value,
        _ => value.saturating_add(1),
    }
}

impl Bus for SimBus {
    fn read(&mut self, quantity: Quantity) -> Result<u8, BusFault> {
        let mut dev = self.device();
        let i = quantity.index();
        dev.read_counts[i] += 1;
        if dev.failing_reads[i] {
            return Err(BusFault::Nack);
        }

        match quantity {
            Quantity::Flow(ch) => {
                if dev.pump && dev.valves[ch.index()] {
                    let step = dev.flow_per_read;
                    dev.values[i] = dev.values[i].saturating_add(step);
                }
            }
            Quantity::Pressure => {
                dev.values[i] = if dev.pump { 120 } else { 10 };
            }
            Quantity::ExposedTemp => {}
            _ if dev.noisy => dev.values[i] = jitter(dev.values[i]),
            _ => {}
        }
        Ok(dev.values[i])
    }

    fn read_line(&mut self, line: Line) -> Result<bool, BusFault> {
        let dev = self.device();
        if dev.failing_lines.contains(&line) {
            return Err(BusFault::Timeout);
        }
        Ok(match line {
            Line::Pump => dev.pump,
            Line::Valve(ch) => dev.valves[ch.index()],
            Line::Rail(r) => dev.rails[r.index()],
        })
    }

    fn write_line(&mut self, line: Line, high: bool) -> Result<(), BusFault> {
        let mut dev = self.device();
        if !line.is_output() {
            return Err(BusFault::NotOutput(line));
        }
        if dev.failing_lines.contains(&line) {
            return Err(BusFault::Timeout);
        }
        match line {
            Line::Pump => dev.pump = high,
            Line::Valve(ch) => dev.valves[ch.index()] = high,
            Line::Rail(_) => {}
        }
        dev.history.push(BusOp::Write(line, high));
        if dev.pump && !dev.valves.iter().any(|v| *v) {
            dev.pump_without_valve += 1;
        }
        debug!(%line, high, "[sim-bus] write");
        Ok(())
    }

    fn reset_flow_counters(&mut self) -> Result<(), BusFault> {
        let mut dev = self.device();
        for ch in Channel::ALL {
            dev.values[Quantity::Flow(ch).index()] = 0;
        }
        dev.history.push(BusOp::ResetFlowCounters);
        Ok(())
    }
}

// -- Test controls -----------------------------------------------------------

#[cfg(test)]
impl SimBus {
    pub fn set_value(&self, quantity: Quantity, value: u8) {
        self.device().values[quantity.index()] = value;
    }

    pub fn value(&self, quantity: Quantity) -> u8 {
        self.device().values[quantity.index()]
    }

    pub fn fail_reads(&self, quantity: Quantity, failing: bool) {
        self.device().failing_reads[quantity.index()] = failing;
    }

    pub fn fail_line(&self, line: Line, failing: bool) {
        let mut dev = self.device();
        dev.failing_lines.retain(|l| *l != line);
        if failing {
            dev.failing_lines.push(line);
        }
    }

    pub fn set_flow_per_read(&self, step: u8) {
        self.device().flow_per_read = step;
    }

    /// Drive a power-good input. `up` pulls the active-low line low.
    pub fn set_rail(&self, rail: super::Rail, up: bool) {
        self.device().rails[rail.index()] = !up;
    }

    pub fn pump(&self) -> bool {
        self.device().pump
    }

    pub fn valve(&self, ch: Channel) -> bool {
        self.device().valves[ch.index()]
    }

    pub fn reads(&self, quantity: Quantity) -> u32 {
        self.device().read_counts[quantity.index()]
    }

    pub fn history(&self) -> Vec<BusOp> {
        self.device().history.clone()
    }

    pub fn pump_without_valve(&self) -> u32 {
        self.device().pump_without_valve
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Rail;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn flow_only_advances_while_channel_is_pumping() {
        let mut bus = SimBus::new();
        bus.set_flow_per_read(3);
        assert_eq!(bus.read(Quantity::Flow(ch(1))).unwrap(), 0);

        bus.write_line(Line::Valve(ch(1)), true).unwrap();
        assert_eq!(bus.read(Quantity::Flow(ch(1))).unwrap(), 0);

        bus.write_line(Line::Pump, true).unwrap();
        assert_eq!(bus.read(Quantity::Flow(ch(1))).unwrap(), 3);
        assert_eq!(bus.read(Quantity::Flow(ch(1))).unwrap(), 6);
        assert_eq!(bus.read(Quantity::Flow(ch(2))).unwrap(), 0);
    }

    #[test]
    fn reset_zeroes_all_flow_counters() {
        let mut bus = SimBus::new();
        bus.set_value(Quantity::Flow(ch(2)), 40);
        bus.set_value(Quantity::Flow(ch(5)), 7);
        bus.reset_flow_counters().unwrap();
        for c in Channel::ALL {
            assert_eq!(bus.value(Quantity::Flow(c)), 0);
        }
        assert_eq!(bus.history(), vec![BusOp::ResetFlowCounters]);
    }

    #[test]
    fn injected_failures_surface_as_faults() {
        let mut bus = SimBus::new();
        bus.fail_reads(Quantity::Rain, true);
        assert_eq!(bus.read(Quantity::Rain), Err(BusFault::Nack));
        bus.fail_reads(Quantity::Rain, false);
        assert_eq!(bus.read(Quantity::Rain), Ok(150));

        bus.fail_line(Line::Pump, true);
        assert_eq!(bus.write_line(Line::Pump, true), Err(BusFault::Timeout));
        assert!(!bus.pump());
    }

    #[test]
    fn rails_cannot_be_written() {
        let mut bus = SimBus::new();
        let line = Line::Rail(Rail::V12);
        assert_eq!(bus.write_line(line, true), Err(BusFault::NotOutput(line)));
    }

    #[test]
    fn counts_pump_running_without_open_valve() {
        let mut bus = SimBus::new();
        bus.write_line(Line::Pump, true).unwrap();
        assert_eq!(bus.pump_without_valve(), 1);
    }

    #[test]
    fn clones_share_device_state() {
        let handle = SimBus::new();
        let mut owned = handle.clone();
        owned.write_line(Line::Valve(ch(4)), true).unwrap();
        assert!(handle.valve(ch(4)));
    }
}
