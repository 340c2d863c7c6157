//! TOML config file loading and validation. Every section and field has a
//! default, so an empty or missing file yields a runnable controller.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use crate::bus::{Channel, Quantity};
use crate::volume::VolumeRounding;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub sensors: SensorConfig,
    pub telemetry: TelemetryConfig,
    pub sink: SinkConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_ms: u64,
    /// Length of one sequencer time unit (settle and poll steps).
    pub time_unit_ms: u64,
    pub valve_settle_open_units: u32,
    pub valve_settle_close_units: u32,
    pub max_watering_units: u32,
    pub volume_rounding: VolumeRounding,
    /// Fire a slot on the first tick after its trigger second if the exact
    /// second was missed.
    pub catch_up_missed_slots: bool,
    /// Local time offset for the schedule. Unset: ask the OS, else UTC.
    pub utc_offset_minutes: Option<i16>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            time_unit_ms: 1000,
            valve_settle_open_units: 2,
            valve_settle_close_units: 5,
            max_watering_units: 100,
            volume_rounding: VolumeRounding::Exact,
            catch_up_missed_slots: false,
            utc_offset_minutes: None,
        }
    }
}

/// Refresh intervals count ticks served from cache between bus reads;
/// 0 reads on every tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub flow_refresh_ticks: u32,
    pub rain_refresh_ticks: u32,
    pub ground_refresh_ticks: u32,
    pub level_refresh_ticks: u32,
    pub pressure_refresh_ticks: u32,
    pub cpu_temp_refresh_ticks: u32,
    pub ambient_temp_refresh_ticks: u32,
    pub exposed_temp_refresh_ticks: u32,
    /// Rain/ground readings below this mean the sensor is faulty.
    pub fault_below: u8,
    /// Rain/ground readings above this mean raining/damp.
    pub active_above: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            flow_refresh_ticks: 0,
            rain_refresh_ticks: 0,
            ground_refresh_ticks: 0,
            level_refresh_ticks: 0,
            pressure_refresh_ticks: 0,
            cpu_temp_refresh_ticks: 10,
            ambient_temp_refresh_ticks: 60,
            exposed_temp_refresh_ticks: 60,
            fault_below: 100,
            active_above: 200,
        }
    }
}

impl SensorConfig {
    pub fn refresh_interval(&self, quantity: Quantity) -> u32 {
        match quantity {
            Quantity::Flow(_) => self.flow_refresh_ticks,
            Quantity::Rain => self.rain_refresh_ticks,
            Quantity::Ground => self.ground_refresh_ticks,
            Quantity::TankLevel => self.level_refresh_ticks,
            Quantity::Pressure => self.pressure_refresh_ticks,
            Quantity::CpuTemp => self.cpu_temp_refresh_ticks,
            Quantity::AmbientTemp => self.ambient_temp_refresh_ticks,
            Quantity::ExposedTemp => self.exposed_temp_refresh_ticks,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub send_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "255.255.255.255".to_string(),
            port: 12300,
            send_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
    /// Rows kept for retry while the store is failing.
    pub max_pending: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 60,
            flush_interval_ms: 10_000,
            queue_capacity: 1024,
            max_pending: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub pump_pin: u8,
    pub valve_pins: [u8; Channel::COUNT],
    /// Power-good inputs for the 5 V, 12 V and 24 V rails.
    pub rail_pins: [u8; 3],
    pub i2c_timeout_ms: u32,
    pub flow_controller_addr: u16,
    pub cpu_temp_addr: u16,
    pub ambient_temp_addr: u16,
    /// Reported for the exposed-temperature quantity; no probe is fitted.
    pub exposed_temp_value: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            pump_pin: 18,
            valve_pins: [23, 24, 25, 12, 16],
            rail_pins: [6, 5, 4],
            i2c_timeout_ms: 25,
            flow_controller_addr: 0x56,
            cpu_temp_addr: 0x48,
            ambient_temp_addr: 0x4F,
            exposed_temp_value: 27,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// 7-bit I²C addresses outside the reserved blocks.
const VALID_I2C_ADDRS: std::ops::RangeInclusive<u16> = 0x08..=0x77;

/// ±18 hours, the range `time::UtcOffset` accepts.
const MAX_OFFSET_MINUTES: i16 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_telemetry(&mut errors);
        self.validate_sink(&mut errors);
        self.validate_hardware(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        // ── Timing values (all must be positive) ────────────
        for (name, value) in [
            ("tick_ms", c.tick_ms),
            ("time_unit_ms", c.time_unit_ms),
            ("valve_settle_open_units", u64::from(c.valve_settle_open_units)),
            ("valve_settle_close_units", u64::from(c.valve_settle_close_units)),
            ("max_watering_units", u64::from(c.max_watering_units)),
        ] {
            if value == 0 {
                errors.push(format!("controller: {name} must be positive, got 0"));
            }
        }

        if let Some(m) = c.utc_offset_minutes {
            if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&m) {
                errors.push(format!(
                    "controller: utc_offset_minutes {m} out of range [-{MAX_OFFSET_MINUTES}, {MAX_OFFSET_MINUTES}]"
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        if s.fault_below >= s.active_above {
            errors.push(format!(
                "sensors: fault_below ({}) must be less than active_above ({})",
                s.fault_below, s.active_above
            ));
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        let t = &self.telemetry;
        if !t.enabled {
            return;
        }
        if t.address.parse::<IpAddr>().is_err() {
            errors.push(format!("telemetry: address '{}' is not an IP address", t.address));
        }
        if t.port == 0 {
            errors.push("telemetry: port must be non-zero".to_string());
        }
        if t.send_timeout_ms == 0 {
            errors.push("telemetry: send_timeout_ms must be positive, got 0".to_string());
        }
    }

    fn validate_sink(&self, errors: &mut Vec<String>) {
        let s = &self.sink;
        if s.batch_size == 0 {
            errors.push("sink: batch_size must be positive, got 0".to_string());
        }
        if s.flush_interval_ms == 0 {
            errors.push("sink: flush_interval_ms must be positive, got 0".to_string());
        }
        if s.queue_capacity == 0 {
            errors.push("sink: queue_capacity must be positive, got 0".to_string());
        }
        if s.max_pending < s.batch_size {
            errors.push(format!(
                "sink: max_pending ({}) must be at least batch_size ({})",
                s.max_pending, s.batch_size
            ));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let h = &self.hardware;

        // ── GPIO pin whitelist ──────────────────────────────
        let mut seen_pins: HashSet<u8> = HashSet::new();
        let pins = std::iter::once(("pump_pin".to_string(), h.pump_pin))
            .chain(
                h.valve_pins
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (format!("valve_pins[{i}]"), *p)),
            )
            .chain(
                h.rail_pins
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (format!("rail_pins[{i}]"), *p)),
            );
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("hardware: {name} {pin} is already in use"));
            }
        }

        // ── I2C addresses ───────────────────────────────────
        let mut seen_addrs: HashSet<u16> = HashSet::new();
        for (name, addr) in [
            ("flow_controller_addr", h.flow_controller_addr),
            ("cpu_temp_addr", h.cpu_temp_addr),
            ("ambient_temp_addr", h.ambient_temp_addr),
        ] {
            if !VALID_I2C_ADDRS.contains(&addr) {
                errors.push(format!(
                    "hardware: {name} {addr:#04x} is outside the 7-bit range 0x08-0x77"
                ));
            } else if !seen_addrs.insert(addr) {
                errors.push(format!("hardware: {name} {addr:#04x} is already in use"));
            }
        }

        if h.i2c_timeout_ms == 0 {
            errors.push("hardware: i2c_timeout_ms must be positive, got 0".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        load(path)
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Ok(Config::default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
