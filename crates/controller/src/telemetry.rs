//! Per-tick telemetry datagram: 37 little-endian u16 words broadcast over
//! UDP. Best effort; a send that fails or times out is dropped and the next
//! tick sends a fresh record.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use time::Weekday;
use tokio::net::UdpSocket;

use crate::actuator::ActuatorState;
use crate::bus::{Channel, Quantity};
use crate::config::TelemetryConfig;
use crate::schedule::Slot;
use crate::sensors::{SensorSnapshot, StatusBits};
use crate::settings::Settings;

pub const RECORD_WORDS: usize = 37;
pub const RECORD_LEN: usize = RECORD_WORDS * 2;

const WEEK: [Weekday; 7] = [
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
    Weekday::Sunday,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    words: [u16; RECORD_WORDS],
}

impl TelemetryRecord {
    /// Word layout:
    ///
    /// | words  | content                                   |
    /// |--------|-------------------------------------------|
    /// | 0–4    | flow counters 1–5                         |
    /// | 5      | sensor status bits                        |
    /// | 6      | IO bits (pump bit 0, valve n bit n)       |
    /// | 7–11   | level, pressure, CPU/ambient/exposed temp |
    /// | 12–16  | target volume 1–5                         |
    /// | 17–21  | rain attenuation 1–5                      |
    /// | 22–26  | ground attenuation 1–5                    |
    /// | 27–29  | morning/noon/evening channel masks        |
    /// | 30–36  | Monday..Sunday channel masks              |
    pub fn build(
        snapshot: &SensorSnapshot,
        status: StatusBits,
        actuators: &ActuatorState,
        settings: &Settings,
    ) -> Self {
        let mut words = Vec::with_capacity(RECORD_WORDS);
        words.extend(Channel::ALL.map(|ch| u16::from(snapshot.flow(ch))));
        words.push(u16::from(status.bits()));
        words.push(u16::from(actuators.io_bits()));
        words.extend(
            [
                Quantity::TankLevel,
                Quantity::Pressure,
                Quantity::CpuTemp,
                Quantity::AmbientTemp,
                Quantity::ExposedTemp,
            ]
            .map(|q| u16::from(snapshot.get(q))),
        );
        words.extend(Channel::ALL.map(|ch| u16::from(settings.channel(ch).target_volume)));
        words.extend(Channel::ALL.map(|ch| u16::from(settings.channel(ch).rain_attenuation)));
        words.extend(Channel::ALL.map(|ch| u16::from(settings.channel(ch).ground_attenuation)));
        let grid = settings.schedule();
        words.extend(Slot::ALL.map(|s| u16::from(grid.slot_mask(s))));
        words.extend(WEEK.map(|d| u16::from(grid.day_mask(d))));

        let mut record = Self {
            words: [0; RECORD_WORDS],
        };
        record.words.copy_from_slice(&words);
        record
    }

    #[cfg(test)]
    pub fn word(&self, i: usize) -> u16 {
        self.words[i]
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        for (chunk, w) in out.chunks_exact_mut(2).zip(self.words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("telemetry send timed out after {0:?}")]
    Timeout(Duration),
    #[error("telemetry send failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct UdpPublisher {
    socket: UdpSocket,
    target: SocketAddr,
    timeout: Duration,
}

impl UdpPublisher {
    pub async fn bind(cfg: &TelemetryConfig) -> Result<Self> {
        let target: SocketAddr = format!("{}:{}", cfg.address, cfg.port)
            .parse()
            .with_context(|| format!("invalid telemetry target {}:{}", cfg.address, cfg.port))?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding telemetry socket")?;
        socket
            .set_broadcast(true)
            .context("enabling broadcast on telemetry socket")?;
        Ok(Self {
            socket,
            target,
            timeout: Duration::from_millis(cfg.send_timeout_ms),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub async fn publish(&self, record: &TelemetryRecord) -> Result<(), PublishError> {
        let bytes = record.encode();
        match tokio::time::timeout(self.timeout, self.socket.send_to(&bytes, self.target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Io(e)),
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Param, ParamValue};

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    fn snapshot() -> SensorSnapshot {
        let mut values = [0u8; Quantity::COUNT];
        for (i, v) in values.iter_mut().enumerate() {
            *v = 10 + i as u8;
        }
        SensorSnapshot {
            values,
            faulted: [false; Quantity::COUNT],
        }
    }

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.set(ch(1), Param::Volume, ParamValue::Byte(200)).unwrap();
        s.set(ch(5), Param::RainAttenuation, ParamValue::Byte(40)).unwrap();
        s.set(ch(3), Param::GroundAttenuation, ParamValue::Byte(60)).unwrap();
        s.set(ch(2), Param::Slot(Slot::Noon), ParamValue::Flag(true)).unwrap();
        s.set(ch(4), Param::Slot(Slot::Noon), ParamValue::Flag(true)).unwrap();
        s.set(ch(1), Param::Day(Weekday::Saturday), ParamValue::Flag(true)).unwrap();
        s
    }

    #[test]
    fn record_layout() {
        let actuators = ActuatorState {
            pump: true,
            valves: [false, true, false, false, false],
        };
        let status = StatusBits::derive(&snapshot(), [true; 3], &Default::default());
        let r = TelemetryRecord::build(&snapshot(), status, &actuators, &settings());

        assert_eq!((0..5).map(|i| r.word(i)).collect::<Vec<_>>(), vec![10, 11, 12, 13, 14]);
        assert_eq!(r.word(5), u16::from(status.bits()));
        assert_eq!(r.word(6), 0b101);
        // level, pressure, cpu, ambient, exposed
        assert_eq!(
            (7..12).map(|i| r.word(i)).collect::<Vec<_>>(),
            vec![17, 18, 19, 20, 21]
        );
        assert_eq!(r.word(12), 200);
        assert_eq!(r.word(13), 0);
        assert_eq!(r.word(21), 40);
        assert_eq!(r.word(24), 60);
        assert_eq!(r.word(17), 100);
        // morning, noon, evening
        assert_eq!((r.word(27), r.word(28), r.word(29)), (0, 0b01010, 0));
        // Saturday is word 35
        assert_eq!(r.word(35), 0b00001);
        assert_eq!(r.word(36), 0);
    }

    #[test]
    fn encodes_little_endian() {
        let mut s = Settings::default();
        s.set(ch(1), Param::Volume, ParamValue::Byte(0xAB)).unwrap();
        let r = TelemetryRecord::build(&snapshot(), StatusBits::default(), &ActuatorState::default(), &s);
        let bytes = r.encode();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(&bytes[0..2], &[10, 0]);
        assert_eq!(&bytes[24..26], &[0xAB, 0x00]);
    }

    #[tokio::test]
    async fn publishes_one_datagram_per_record() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let cfg = TelemetryConfig {
            address: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let publisher = UdpPublisher::bind(&cfg).await.unwrap();
        let record = TelemetryRecord::build(
            &snapshot(),
            StatusBits::default(),
            &ActuatorState::default(),
            &settings(),
        );
        publisher.publish(&record).await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, RECORD_LEN);
        assert_eq!(&buf[..n], &record.encode()[..]);
    }

    #[tokio::test]
    async fn rejects_unparseable_target() {
        let cfg = TelemetryConfig {
            address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(UdpPublisher::bind(&cfg).await.is_err());
    }
}
