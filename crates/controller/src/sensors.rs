//! Last-known-good sensor cache and the status bits derived from it.
//!
//! The cache is the only writer of sensor values. A failed bus read never
//! overwrites a value: consumers keep seeing the last good reading while the
//! quantity is flagged as faulted until its next successful read.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::bus::{Bus, BusFault, Channel, Quantity, Rail};
use crate::config::SensorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{quantity} read failed: {source}")]
pub struct SensorFault {
    pub quantity: Quantity,
    #[source]
    pub source: BusFault,
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct SensorSample {
    last_good: u8,
    stale_ticks: u32,
    refresh_interval: u32,
    faulted: bool,
    fault_count: u32,
}

/// One consistent view of every quantity, taken at the end of a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorSnapshot {
    pub values: [u8; Quantity::COUNT],
    pub faulted: [bool; Quantity::COUNT],
}

impl SensorSnapshot {
    pub fn get(&self, quantity: Quantity) -> u8 {
        self.values[quantity.index()]
    }

    pub fn flow(&self, ch: Channel) -> u8 {
        self.get(Quantity::Flow(ch))
    }

    pub fn any_faulted(&self) -> bool {
        self.faulted.iter().any(|f| *f)
    }
}

pub struct SensorCache {
    samples: [SensorSample; Quantity::COUNT],
}

impl SensorCache {
    pub fn new(cfg: &SensorConfig) -> Self {
        let mut samples = [SensorSample::default(); Quantity::COUNT];
        for q in Quantity::ALL {
            let interval = cfg.refresh_interval(q);
            // Start stale so the first refresh goes to the bus.
            samples[q.index()].refresh_interval = interval;
            samples[q.index()].stale_ticks = interval;
        }
        Self { samples }
    }

    /// Bring every due quantity up to date. Quantities inside their refresh
    /// interval are served from the cache without touching the bus. Returns
    /// the snapshot plus the faults raised by this pass.
    pub fn refresh(&mut self, bus: &mut dyn Bus) -> (SensorSnapshot, Vec<SensorFault>) {
        let mut faults = Vec::new();
        for q in Quantity::ALL {
            let sample = &mut self.samples[q.index()];
            if sample.stale_ticks < sample.refresh_interval {
                sample.stale_ticks += 1;
                continue;
            }
            if let Err(fault) = self.read(bus, q) {
                faults.push(fault);
            }
        }
        (self.snapshot(), faults)
    }

    /// Read one quantity now, regardless of its interval. On failure the
    /// last good value stays in place and is still readable via [`get`].
    ///
    /// [`get`]: SensorCache::get
    pub fn poll(&mut self, bus: &mut dyn Bus, quantity: Quantity) -> Result<u8, SensorFault> {
        self.read(bus, quantity)
    }

    fn read(&mut self, bus: &mut dyn Bus, quantity: Quantity) -> Result<u8, SensorFault> {
        let sample = &mut self.samples[quantity.index()];
        sample.stale_ticks = 0;
        match bus.read(quantity) {
            Ok(v) => {
                sample.last_good = v;
                sample.faulted = false;
                Ok(v)
            }
            Err(source) => {
                sample.faulted = true;
                sample.fault_count += 1;
                warn!(
                    %quantity,
                    last_good = sample.last_good,
                    faults = sample.fault_count,
                    error = %source,
                    "sensor read failed, keeping last good value"
                );
                Err(SensorFault { quantity, source })
            }
        }
    }

    pub fn get(&self, quantity: Quantity) -> u8 {
        self.samples[quantity.index()].last_good
    }

    pub fn fault_counts(&self) -> [u32; Quantity::COUNT] {
        self.samples.map(|s| s.fault_count)
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            values: self.samples.map(|s| s.last_good),
            faulted: self.samples.map(|s| s.faulted),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived status bits
// ---------------------------------------------------------------------------

/// Sensor-status word carried in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct StatusBits(u8);

impl StatusBits {
    pub const RAIN_SENSOR_FAULT: u8 = 0x01;
    pub const RAINING: u8 = 0x02;
    pub const GROUND_SENSOR_FAULT: u8 = 0x04;
    pub const GROUND_DAMP: u8 = 0x08;
    pub const RAIL_5V_OK: u8 = 0x10;
    pub const RAIL_12V_OK: u8 = 0x20;
    pub const RAIL_24V_OK: u8 = 0x40;
    pub const SENSOR_FAULT: u8 = 0x80;

    /// `rails_ok` is indexed by [`Rail::index`].
    pub fn derive(snapshot: &SensorSnapshot, rails_ok: [bool; 3], cfg: &SensorConfig) -> Self {
        let rain = snapshot.get(Quantity::Rain);
        let ground = snapshot.get(Quantity::Ground);
        let mut bits = 0;

        if rain < cfg.fault_below {
            bits |= Self::RAIN_SENSOR_FAULT;
        }
        if rain > cfg.active_above {
            bits |= Self::RAINING;
        }
        if ground < cfg.fault_below {
            bits |= Self::GROUND_SENSOR_FAULT;
        }
        if ground > cfg.active_above {
            bits |= Self::GROUND_DAMP;
        }
        let rail_bits = [Self::RAIL_5V_OK, Self::RAIL_12V_OK, Self::RAIL_24V_OK];
        for rail in Rail::ALL {
            if rails_ok[rail.index()] {
                bits |= rail_bits[rail.index()];
            }
        }
        if snapshot.any_faulted() {
            bits |= Self::SENSOR_FAULT;
        }
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn raining(self) -> bool {
        self.contains(Self::RAINING)
    }

    pub fn ground_damp(self) -> bool {
        self.contains(Self::GROUND_DAMP)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimBus;

    fn cache() -> SensorCache {
        SensorCache::new(&SensorConfig::default())
    }

    fn snapshot_with(rain: u8, ground: u8) -> SensorSnapshot {
        let mut values = [0; Quantity::COUNT];
        values[Quantity::Rain.index()] = rain;
        values[Quantity::Ground.index()] = ground;
        SensorSnapshot {
            values,
            faulted: [false; Quantity::COUNT],
        }
    }

    // -- SensorCache -------------------------------------------------------

    #[test]
    fn first_refresh_reads_every_quantity() {
        let mut bus = SimBus::new();
        let mut cache = cache();
        let (snap, faults) = cache.refresh(&mut bus);
        assert!(faults.is_empty());
        for q in Quantity::ALL {
            assert_eq!(bus.reads(q), 1, "{q}");
        }
        assert_eq!(snap.get(Quantity::Rain), 150);
        assert_eq!(snap.get(Quantity::CpuTemp), 45);
    }

    #[test]
    fn temperatures_are_throttled() {
        let mut bus = SimBus::new();
        let mut cache = cache();
        // First pass reads; the next ten are served from cache.
        for _ in 0..11 {
            cache.refresh(&mut bus);
        }
        assert_eq!(bus.reads(Quantity::CpuTemp), 1);
        assert_eq!(bus.reads(Quantity::Rain), 11);

        cache.refresh(&mut bus);
        assert_eq!(bus.reads(Quantity::CpuTemp), 2);
        assert_eq!(bus.reads(Quantity::AmbientTemp), 1);
    }

    #[test]
    fn cached_temperature_survives_value_change_until_due() {
        let mut bus = SimBus::new();
        let mut cache = cache();
        cache.refresh(&mut bus);
        bus.set_value(Quantity::CpuTemp, 60);
        let (snap, _) = cache.refresh(&mut bus);
        assert_eq!(snap.get(Quantity::CpuTemp), 45);
    }

    #[test]
    fn consecutive_failures_report_last_good_value() {
        let mut bus = SimBus::new();
        let mut cache = cache();
        bus.set_value(Quantity::Rain, 210);
        cache.refresh(&mut bus);

        bus.fail_reads(Quantity::Rain, true);
        for n in 1..=5 {
            let (snap, faults) = cache.refresh(&mut bus);
            assert_eq!(snap.get(Quantity::Rain), 210);
            assert!(snap.faulted[Quantity::Rain.index()]);
            assert_eq!(faults.len(), 1);
            assert_eq!(faults[0].quantity, Quantity::Rain);
            assert_eq!(cache.fault_counts()[Quantity::Rain.index()], n);
        }

        bus.fail_reads(Quantity::Rain, false);
        bus.set_value(Quantity::Rain, 120);
        let (snap, faults) = cache.refresh(&mut bus);
        assert!(faults.is_empty());
        assert_eq!(snap.get(Quantity::Rain), 120);
        assert!(!snap.any_faulted());
    }

    #[test]
    fn poll_bypasses_interval_and_keeps_last_good_on_failure() {
        let mut bus = SimBus::new();
        let mut cache = cache();
        let flow = Quantity::Flow(Channel::ALL[0]);
        bus.set_value(flow, 12);
        assert_eq!(cache.poll(&mut bus, flow), Ok(12));

        bus.fail_reads(flow, true);
        let err = cache.poll(&mut bus, flow).unwrap_err();
        assert_eq!(err.source, BusFault::Nack);
        assert_eq!(cache.get(flow), 12);
    }

    // -- StatusBits --------------------------------------------------------

    #[test]
    fn status_bits_thresholds() {
        let cfg = SensorConfig::default();
        let bits = StatusBits::derive(&snapshot_with(50, 150), [false; 3], &cfg);
        assert_eq!(bits.bits(), StatusBits::RAIN_SENSOR_FAULT);

        let bits = StatusBits::derive(&snapshot_with(210, 201), [false; 3], &cfg);
        assert!(bits.raining());
        assert!(bits.ground_damp());

        let bits = StatusBits::derive(&snapshot_with(100, 200), [false; 3], &cfg);
        assert_eq!(bits.bits(), 0);

        let bits = StatusBits::derive(&snapshot_with(150, 99), [false; 3], &cfg);
        assert_eq!(bits.bits(), StatusBits::GROUND_SENSOR_FAULT);
    }

    #[test]
    fn status_bits_rails_and_sensor_fault() {
        let cfg = SensorConfig::default();
        let mut snap = snapshot_with(150, 150);
        let bits = StatusBits::derive(&snap, [true, false, true], &cfg);
        assert_eq!(bits.bits(), StatusBits::RAIL_5V_OK | StatusBits::RAIL_24V_OK);

        snap.faulted[Quantity::Pressure.index()] = true;
        let bits = StatusBits::derive(&snap, [false; 3], &cfg);
        assert_eq!(bits.bits(), StatusBits::SENSOR_FAULT);
    }
}
