//! Hardware bus abstraction. Every sensor read and output write in the
//! controller goes through a [`Bus`]; the `gpio` feature gates the real
//! rppal driver, and [`SimBus`] stands in for it everywhere else.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[cfg(feature = "gpio")]
pub mod rpi;
#[cfg(any(test, not(feature = "gpio")))]
pub mod sim;

#[cfg(any(test, not(feature = "gpio")))]
pub use sim::SimBus;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A watering channel, numbered 1 through 5. Each channel owns one valve
/// and one flow counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: usize = 5;
    pub const ALL: [Channel; Channel::COUNT] =
        [Channel(1), Channel(2), Channel(3), Channel(4), Channel(5)];

    pub fn new(number: u8) -> Option<Self> {
        (1..=Self::COUNT as u8).contains(&number).then_some(Self(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based position, for indexing per-channel arrays.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// Single-bit mask (`bit n-1` for channel `n`).
    pub fn mask(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Supply rails monitored through power-good inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Rail {
    V5,
    V12,
    V24,
}

impl Rail {
    pub const ALL: [Rail; 3] = [Rail::V5, Rail::V12, Rail::V24];

    pub fn index(self) -> usize {
        match self {
            Rail::V5 => 0,
            Rail::V12 => 1,
            Rail::V24 => 2,
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rail::V5 => "5V",
            Rail::V12 => "12V",
            Rail::V24 => "24V",
        };
        f.write_str(s)
    }
}

/// A digital line. Pump and valves are outputs; rails are inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Pump,
    Valve(Channel),
    Rail(Rail),
}

impl Line {
    pub fn is_output(self) -> bool {
        !matches!(self, Line::Rail(_))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Pump => f.write_str("pump"),
            Line::Valve(ch) => write!(f, "valve{ch}"),
            Line::Rail(r) => write!(f, "rail{r}"),
        }
    }
}

/// An 8-bit quantity readable from the sensor bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Flow(Channel),
    Rain,
    Ground,
    TankLevel,
    Pressure,
    CpuTemp,
    AmbientTemp,
    ExposedTemp,
}

impl Quantity {
    pub const COUNT: usize = 12;
    pub const ALL: [Quantity; Quantity::COUNT] = [
        Quantity::Flow(Channel(1)),
        Quantity::Flow(Channel(2)),
        Quantity::Flow(Channel(3)),
        Quantity::Flow(Channel(4)),
        Quantity::Flow(Channel(5)),
        Quantity::Rain,
        Quantity::Ground,
        Quantity::TankLevel,
        Quantity::Pressure,
        Quantity::CpuTemp,
        Quantity::AmbientTemp,
        Quantity::ExposedTemp,
    ];

    /// Position in [`Quantity::ALL`].
    pub fn index(self) -> usize {
        match self {
            Quantity::Flow(ch) => ch.index(),
            Quantity::Rain => 5,
            Quantity::Ground => 6,
            Quantity::TankLevel => 7,
            Quantity::Pressure => 8,
            Quantity::CpuTemp => 9,
            Quantity::AmbientTemp => 10,
            Quantity::ExposedTemp => 11,
        }
    }

    pub fn name(self) -> &'static str {
        const FLOW: [&str; Channel::COUNT] = ["flow1", "flow2", "flow3", "flow4", "flow5"];
        match self {
            Quantity::Flow(ch) => FLOW[ch.index()],
            Quantity::Rain => "rain",
            Quantity::Ground => "ground",
            Quantity::TankLevel => "tank_level",
            Quantity::Pressure => "pressure",
            Quantity::CpuTemp => "cpu_temp",
            Quantity::AmbientTemp => "ambient_temp",
            Quantity::ExposedTemp => "exposed_temp",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Bus trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("bus transaction timed out")]
    Timeout,
    #[error("device did not acknowledge")]
    Nack,
    #[error("{0} is not an output")]
    NotOutput(Line),
    #[error("bus i/o error: {0}")]
    Io(String),
}

/// Raw device access. Implementations perform exactly one transaction per
/// call and never retry; retry and fail-safe policy live above this trait.
pub trait Bus: Send {
    fn read(&mut self, quantity: Quantity) -> Result<u8, BusFault>;

    /// Read back a digital line. For outputs this is the driven level.
    fn read_line(&mut self, line: Line) -> Result<bool, BusFault>;

    fn write_line(&mut self, line: Line, high: bool) -> Result<(), BusFault>;

    /// Zero all five flow counters on the flow controller.
    fn reset_flow_counters(&mut self) -> Result<(), BusFault>;
}

// ===========================================================================
// Tests
// ===========================================================================
