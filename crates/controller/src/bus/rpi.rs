//! Raspberry Pi bus: rppal GPIO for pump, valves and power-good inputs, and
//! I²C for the flow controller and the two temperature sensors. Only built
//! with the `gpio` feature.

use std::io;

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use rppal::i2c::{self, I2c};
use tracing::info;

use super::{Bus, BusFault, Channel, Line, Quantity};
use crate::config::HardwareConfig;

/// Register map of the flow/rain/level microcontroller.
mod reg {
    pub const FLOW_BASE: u8 = 0x20;
    pub const RAIN: u8 = 0x25;
    pub const LEVEL: u8 = 0x26;
    pub const PRESSURE: u8 = 0x27;
    pub const GROUND: u8 = 0x28;
    pub const RESET_COUNTERS: u8 = 0x40;
}

/// Temperature register on both LM75-style sensors.
const TEMP_REG: u8 = 0x00;

pub struct RpiBus {
    i2c: I2c,
    pump: OutputPin,
    valves: Vec<OutputPin>,
    rails: Vec<InputPin>,
    flow_addr: u16,
    cpu_temp_addr: u16,
    ambient_temp_addr: u16,
    exposed_temp: u8,
}

impl RpiBus {
    pub fn new(cfg: &HardwareConfig) -> Result<Self> {
        let gpio = Gpio::new().context("opening GPIO")?;

        // Outputs come up driven low: pump off, valves closed.
        let pump = gpio
            .get(cfg.pump_pin)
            .with_context(|| format!("claiming pump pin {}", cfg.pump_pin))?
            .into_output_low();
        let mut valves = Vec::with_capacity(Channel::COUNT);
        for pin in cfg.valve_pins {
            valves.push(
                gpio.get(pin)
                    .with_context(|| format!("claiming valve pin {pin}"))?
                    .into_output_low(),
            );
        }
        let mut rails = Vec::with_capacity(cfg.rail_pins.len());
        for pin in cfg.rail_pins {
            rails.push(
                gpio.get(pin)
                    .with_context(|| format!("claiming rail pin {pin}"))?
                    .into_input(),
            );
        }

        let mut i2c = I2c::new().context("opening I2C bus")?;
        i2c.set_timeout(cfg.i2c_timeout_ms)
            .context("setting I2C timeout")?;

        info!(
            pump = cfg.pump_pin,
            valves = ?cfg.valve_pins,
            rails = ?cfg.rail_pins,
            "rpi bus initialised"
        );

        Ok(Self {
            i2c,
            pump,
            valves,
            rails,
            flow_addr: cfg.flow_controller_addr,
            cpu_temp_addr: cfg.cpu_temp_addr,
            ambient_temp_addr: cfg.ambient_temp_addr,
            exposed_temp: cfg.exposed_temp_value,
        })
    }

    /// Register-pointer write followed by a separate read, the way the
    /// microcontroller firmware expects it.
    fn transfer(&mut self, addr: u16, register: u8, buf: &mut [u8]) -> Result<(), BusFault> {
        self.i2c.set_slave_address(addr).map_err(map_i2c)?;
        self.i2c.write(&[register]).map_err(map_i2c)?;
        let n = self.i2c.read(buf).map_err(map_i2c)?;
        if n < buf.len() {
            return Err(BusFault::Nack);
        }
        Ok(())
    }

    fn read_register(&mut self, register: u8) -> Result<u8, BusFault> {
        let mut buf = [0u8; 1];
        self.transfer(self.flow_addr, register, &mut buf)?;
        Ok(buf[0])
    }
}

fn map_i2c(e: i2c::Error) -> BusFault {
    match e {
        i2c::Error::Io(io) if io.kind() == io::ErrorKind::TimedOut => BusFault::Timeout,
        // EREMOTEIO: the addressed device did not ACK.
        i2c::Error::Io(io) if io.raw_os_error() == Some(121) => BusFault::Nack,
        other => BusFault::Io(other.to_string()),
    }
}

impl Bus for RpiBus {
    fn read(&mut self, quantity: Quantity) -> Result<u8, BusFault> {
        match quantity {
            Quantity::Flow(ch) => self.read_register(reg::FLOW_BASE + ch.index() as u8),
            Quantity::Rain => self.read_register(reg::RAIN),
            Quantity::Ground => self.read_register(reg::GROUND),
            Quantity::TankLevel => self.read_register(reg::LEVEL),
            Quantity::Pressure => self.read_register(reg::PRESSURE),
            Quantity::CpuTemp => {
                // 9-bit two's complement in half degrees; keep whole degrees.
                let mut buf = [0u8; 2];
                self.transfer(self.cpu_temp_addr, TEMP_REG, &mut buf)?;
                let raw = (u16::from(buf[0]) << 8) | u16::from(buf[1]);
                Ok(((raw >> 7) & 0xFF) as u8)
            }
            Quantity::AmbientTemp => {
                let mut buf = [0u8; 2];
                self.transfer(self.ambient_temp_addr, TEMP_REG, &mut buf)?;
                Ok(buf[0] & 0x7F)
            }
            Quantity::ExposedTemp => Ok(self.exposed_temp),
        }
    }

    fn read_line(&mut self, line: Line) -> Result<bool, BusFault> {
        Ok(match line {
            Line::Pump => self.pump.is_set_high(),
            Line::Valve(ch) => self.valves[ch.index()].is_set_high(),
            Line::Rail(r) => self.rails[r.index()].is_high(),
        })
    }

    fn write_line(&mut self, line: Line, high: bool) -> Result<(), BusFault> {
        let pin = match line {
            Line::Pump => &mut self.pump,
            Line::Valve(ch) => &mut self.valves[ch.index()],
            Line::Rail(_) => return Err(BusFault::NotOutput(line)),
        };
        if high {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }

    fn reset_flow_counters(&mut self) -> Result<(), BusFault> {
        self.i2c.set_slave_address(self.flow_addr).map_err(map_i2c)?;
        self.i2c.write(&[reg::RESET_COUNTERS]).map_err(map_i2c)?;
        Ok(())
    }
}
