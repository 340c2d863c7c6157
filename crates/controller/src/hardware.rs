//! The hardware lock group: bus, actuator gateway and sensor cache behind a
//! single mutex. Every method here is one atomic operation; callers must
//! not hold the lock across a settle or poll wait.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::actuator::{ActuatorFault, ActuatorGateway, ActuatorState};
use crate::bus::{Bus, BusFault, Channel, Line, Quantity, Rail};
use crate::config::{HardwareConfig, SensorConfig};
use crate::sensors::{SensorCache, SensorFault, SensorSnapshot, StatusBits};

pub type SharedHardware = Arc<Mutex<Hardware>>;

pub struct Hardware {
    bus: Box<dyn Bus>,
    actuators: ActuatorGateway,
    sensors: SensorCache,
    sensor_cfg: SensorConfig,
}

/// Result of one sensor refresh.
pub struct Reading {
    pub snapshot: SensorSnapshot,
    pub status: StatusBits,
    pub actuators: ActuatorState,
    pub faults: Vec<SensorFault>,
}

impl Hardware {
    pub fn new(bus: Box<dyn Bus>, sensor_cfg: SensorConfig) -> Self {
        Self {
            bus,
            actuators: ActuatorGateway::new(),
            sensors: SensorCache::new(&sensor_cfg),
            sensor_cfg,
        }
    }

    pub fn into_shared(self) -> SharedHardware {
        Arc::new(Mutex::new(self))
    }

    // ── Sensors ─────────────────────────────────────────────────────────

    pub fn refresh(&mut self) -> Reading {
        let (snapshot, faults) = self.sensors.refresh(self.bus.as_mut());
        let rails_ok = Rail::ALL.map(|r| self.rail_ok(r));
        Reading {
            snapshot,
            status: StatusBits::derive(&snapshot, rails_ok, &self.sensor_cfg),
            actuators: self.actuators.state(),
            faults,
        }
    }

    pub fn poll(&mut self, quantity: Quantity) -> Result<u8, SensorFault> {
        self.sensors.poll(self.bus.as_mut(), quantity)
    }

    pub fn sensor_fault_counts(&self) -> [u32; Quantity::COUNT] {
        self.sensors.fault_counts()
    }

    /// Power-good inputs are active low. A failed read counts as not OK.
    pub fn rail_ok(&mut self, rail: Rail) -> bool {
        match self.bus.read_line(Line::Rail(rail)) {
            Ok(level) => !level,
            Err(e) => {
                warn!(%rail, error = %e, "rail status read failed");
                false
            }
        }
    }

    pub fn reset_flow_counters(&mut self) -> Result<(), BusFault> {
        self.bus.reset_flow_counters()?;
        info!("flow counters reset");
        Ok(())
    }

    // ── Actuators ───────────────────────────────────────────────────────

    pub fn actuators(&self) -> ActuatorState {
        self.actuators.state()
    }

    pub fn pump_on(&self) -> bool {
        self.actuators.pump_on()
    }

    pub fn valve_open(&self, ch: Channel) -> bool {
        self.actuators.valve_open(ch)
    }

    pub fn set_valve(&mut self, ch: Channel, open: bool) -> Result<(), ActuatorFault> {
        self.actuators.set_valve(self.bus.as_mut(), ch, open)
    }

    pub fn set_pump(&mut self, on: bool) -> Result<(), ActuatorFault> {
        self.actuators.set_pump(self.bus.as_mut(), on)
    }

    pub fn read_line(&mut self, line: Line) -> bool {
        self.actuators.read(self.bus.as_mut(), line)
    }

    pub fn actuator_fault_count(&self) -> u32 {
        self.actuators.fault_count()
    }

    /// Pump off, every valve closed.
    pub fn fail_safe(&mut self) -> Result<(), ActuatorFault> {
        self.actuators.all_off(self.bus.as_mut())
    }
}

/// Build the bus for this process: rppal hardware with the `gpio` feature,
/// the simulator otherwise.
#[cfg(feature = "gpio")]
pub fn build_bus(cfg: &HardwareConfig) -> Result<Box<dyn Bus>> {
    Ok(Box::new(crate::bus::rpi::RpiBus::new(cfg)?))
}

#[cfg(not(feature = "gpio"))]
pub fn build_bus(cfg: &HardwareConfig) -> Result<Box<dyn Bus>> {
    info!(
        pump = cfg.pump_pin,
        valves = ?cfg.valve_pins,
        "[sim-bus] no hardware, using simulated bus"
    );
    Ok(Box::new(crate::bus::SimBus::noisy()))
}

// ===========================================================================
// Tests
// ===========================================================================
