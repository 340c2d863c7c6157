//! Controller fault taxonomy. No fault ends the process; each one is logged,
//! kept in the event buffer and mirrored into the log table.

use thiserror::Error;
use tracing::{error, warn};

use crate::actuator::ActuatorFault;
use crate::bus::Channel;
use crate::sensors::SensorFault;

#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// The cache keeps serving the last good value.
    #[error(transparent)]
    Sensor(#[from] SensorFault),
    /// The line was driven to its safe level.
    #[error(transparent)]
    Actuator(#[from] ActuatorFault),
    /// The channel was closed out; the cycle moves on.
    #[error("channel {channel} did not reach its target within {elapsed} units")]
    WateringTimeout { channel: Channel, elapsed: u32 },
    /// A default was substituted for a missing or bad stored setting.
    #[error("setting {key}: {reason}, using default")]
    ConfigLoad { key: String, reason: String },
    /// A telemetry datagram or sink batch was dropped.
    #[error("{0}")]
    TelemetrySink(String),
}

impl Fault {
    pub fn category(&self) -> &'static str {
        match self {
            Fault::Sensor(_) => "SensorFault",
            Fault::Actuator(_) => "ActuatorFault",
            Fault::WateringTimeout { .. } => "WateringTimeout",
            Fault::ConfigLoad { .. } => "ConfigLoadFault",
            Fault::TelemetrySink(_) => "TelemetrySinkFault",
        }
    }

    /// Faults that mean a line or session was forced into a safe state.
    pub fn is_error(&self) -> bool {
        matches!(self, Fault::Actuator(_))
    }

    pub fn emit(&self) {
        if self.is_error() {
            error!(category = self.category(), "{self}");
        } else {
            warn!(category = self.category(), "{self}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusFault, Line, Quantity};

    #[test]
    fn categories() {
        let sensor = Fault::from(SensorFault {
            quantity: Quantity::Rain,
            source: BusFault::Timeout,
        });
        assert_eq!(sensor.category(), "SensorFault");
        assert_eq!(sensor.to_string(), "rain read failed: bus transaction timed out");

        let act = Fault::from(ActuatorFault::Bus {
            line: Line::Pump,
            source: BusFault::Nack,
        });
        assert_eq!(act.category(), "ActuatorFault");
        assert!(act.is_error());

        let cfg = Fault::ConfigLoad {
            key: "VOL1".into(),
            reason: "missing".into(),
        };
        assert_eq!(cfg.to_string(), "setting VOL1: missing, using default");
        assert!(!cfg.is_error());
    }
}
