//! Operator settings: per-channel volume/attenuation and the weekly
//! schedule grid, plus the table that maps remote parameter ids and store
//! keys onto typed setters.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use time::Weekday;
use tokio::sync::RwLock;

use crate::bus::Channel;
use crate::schedule::Slot;

pub type SharedSettings = Arc<RwLock<Settings>>;

// ---------------------------------------------------------------------------
// Channel configuration & schedule grid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    pub target_volume: u8,
    /// Percent of the target applied while it is raining.
    pub rain_attenuation: u8,
    /// Percent of the target applied while the ground is damp.
    pub ground_attenuation: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            target_volume: 0,
            rain_attenuation: 100,
            ground_attenuation: 100,
        }
    }
}

/// Days and times of day are configured independently; a channel waters in
/// slot `s` on day `d` only when both flags are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSchedule {
    /// Monday first.
    pub days: [bool; 7],
    pub slots: [bool; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ScheduleGrid {
    channels: [ChannelSchedule; Channel::COUNT],
}

fn day_index(day: Weekday) -> usize {
    usize::from(day.number_days_from_monday())
}

impl ScheduleGrid {
    pub fn channel(&self, ch: Channel) -> &ChannelSchedule {
        &self.channels[ch.index()]
    }

    pub fn waters(&self, ch: Channel, day: Weekday, slot: Slot) -> bool {
        let s = self.channel(ch);
        s.days[day_index(day)] && s.slots[slot.index()]
    }

    /// Channels that water on `day` in `slot`, ascending.
    pub fn channels_for(&self, day: Weekday, slot: Slot) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|ch| self.waters(*ch, day, slot))
            .collect()
    }

    pub fn slot_mask(&self, slot: Slot) -> u8 {
        self.mask(|s| s.slots[slot.index()])
    }

    pub fn day_mask(&self, day: Weekday) -> u8 {
        self.mask(|s| s.days[day_index(day)])
    }

    fn mask(&self, flag: impl Fn(&ChannelSchedule) -> bool) -> u8 {
        Channel::ALL
            .into_iter()
            .filter(|ch| flag(self.channel(*ch)))
            .fold(0, |m, ch| m | ch.mask())
    }
}

// ---------------------------------------------------------------------------
// Parameter table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Volume,
    Slot(Slot),
    Day(Weekday),
    RainAttenuation,
    GroundAttenuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Byte { max: u8 },
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    Byte(u8),
    Flag(bool),
}

impl ParamValue {
    /// Integer form used by the settings store.
    pub fn as_i64(self) -> i64 {
        match self {
            ParamValue::Byte(b) => i64::from(b),
            ParamValue::Flag(f) => i64::from(f),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Byte(b) => write!(f, "{b}"),
            ParamValue::Flag(v) => write!(f, "{v}"),
        }
    }
}

/// Ordered by remote parameter id: entry `n - 1` answers id `n`.
const PARAMS: [Param; 13] = [
    Param::Volume,
    Param::Slot(Slot::Morning),
    Param::Slot(Slot::Noon),
    Param::Slot(Slot::Evening),
    Param::Day(Weekday::Monday),
    Param::Day(Weekday::Tuesday),
    Param::Day(Weekday::Wednesday),
    Param::Day(Weekday::Thursday),
    Param::Day(Weekday::Friday),
    Param::Day(Weekday::Saturday),
    Param::Day(Weekday::Sunday),
    Param::RainAttenuation,
    Param::GroundAttenuation,
];

impl Param {
    pub const ALL: [Param; 13] = PARAMS;

    pub fn from_id(id: u8) -> Option<Param> {
        let i = usize::from(id).checked_sub(1)?;
        PARAMS.get(i).copied()
    }

    pub fn id(self) -> u8 {
        let pos = PARAMS.iter().position(|p| *p == self).unwrap_or(0);
        pos as u8 + 1
    }

    pub fn kind(self) -> ParamKind {
        match self {
            Param::Volume => ParamKind::Byte { max: u8::MAX },
            Param::RainAttenuation | Param::GroundAttenuation => ParamKind::Byte { max: 100 },
            Param::Slot(_) | Param::Day(_) => ParamKind::Flag,
        }
    }

    #[cfg(test)]
    pub fn default_value(self) -> ParamValue {
        match self {
            Param::Volume => ParamValue::Byte(0),
            Param::RainAttenuation | Param::GroundAttenuation => ParamValue::Byte(100),
            Param::Slot(_) | Param::Day(_) => ParamValue::Flag(false),
        }
    }

    /// Three-letter store key prefix; the channel number is appended.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Param::Volume => "VOL",
            Param::Slot(Slot::Morning) => "MOR",
            Param::Slot(Slot::Noon) => "NOO",
            Param::Slot(Slot::Evening) => "EVE",
            Param::Day(Weekday::Monday) => "MON",
            Param::Day(Weekday::Tuesday) => "TUE",
            Param::Day(Weekday::Wednesday) => "WED",
            Param::Day(Weekday::Thursday) => "THU",
            Param::Day(Weekday::Friday) => "FRI",
            Param::Day(Weekday::Saturday) => "SAT",
            Param::Day(Weekday::Sunday) => "SUN",
            Param::RainAttenuation => "RAF",
            Param::GroundAttenuation => "GAF",
        }
    }

    pub fn store_key(self, ch: Channel) -> String {
        format!("{}{}", self.key_prefix(), ch)
    }

    /// Check a value against this parameter's kind and range.
    pub fn validate(self, value: ParamValue) -> Result<ParamValue, SettingError> {
        match (self.kind(), value) {
            (ParamKind::Byte { max }, ParamValue::Byte(v)) if v > max => {
                Err(SettingError::OutOfRange { param: self, value: v, max })
            }
            (ParamKind::Byte { .. }, ParamValue::Byte(_)) | (ParamKind::Flag, ParamValue::Flag(_)) => {
                Ok(value)
            }
            (ParamKind::Byte { .. }, ParamValue::Flag(_)) => Err(SettingError::WrongKind {
                param: self,
                expected: "byte",
            }),
            (ParamKind::Flag, ParamValue::Byte(_)) => Err(SettingError::WrongKind {
                param: self,
                expected: "flag",
            }),
        }
    }

    /// Decode a stored integer into a value of this parameter's kind.
    pub fn from_stored(self, raw: i64) -> Result<ParamValue, SettingError> {
        let value = match self.kind() {
            ParamKind::Byte { .. } => u8::try_from(raw)
                .map(ParamValue::Byte)
                .map_err(|_| SettingError::Unrepresentable { param: self, raw })?,
            ParamKind::Flag => match raw {
                0 => ParamValue::Flag(false),
                1 => ParamValue::Flag(true),
                _ => return Err(SettingError::Unrepresentable { param: self, raw }),
            },
        };
        self.validate(value)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingError {
    #[error("{param} expects a {expected}")]
    WrongKind { param: Param, expected: &'static str },
    #[error("{param} value {value} exceeds {max}")]
    OutOfRange { param: Param, value: u8, max: u8 },
    #[error("{param} cannot hold stored value {raw}")]
    Unrepresentable { param: Param, raw: i64 },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Settings {
    channels: [ChannelConfig; Channel::COUNT],
    schedule: ScheduleGrid,
}

impl Settings {
    pub fn channel(&self, ch: Channel) -> &ChannelConfig {
        &self.channels[ch.index()]
    }

    pub fn schedule(&self) -> &ScheduleGrid {
        &self.schedule
    }

    pub fn get(&self, ch: Channel, param: Param) -> ParamValue {
        let cfg = &self.channels[ch.index()];
        let sched = &self.schedule.channels[ch.index()];
        match param {
            Param::Volume => ParamValue::Byte(cfg.target_volume),
            Param::RainAttenuation => ParamValue::Byte(cfg.rain_attenuation),
            Param::GroundAttenuation => ParamValue::Byte(cfg.ground_attenuation),
            Param::Slot(slot) => ParamValue::Flag(sched.slots[slot.index()]),
            Param::Day(day) => ParamValue::Flag(sched.days[day_index(day)]),
        }
    }

    pub fn set(&mut self, ch: Channel, param: Param, value: ParamValue) -> Result<(), SettingError> {
        let value = param.validate(value)?;
        let cfg = &mut self.channels[ch.index()];
        let sched = &mut self.schedule.channels[ch.index()];
        match (param, value) {
            (Param::Volume, ParamValue::Byte(v)) => cfg.target_volume = v,
            (Param::RainAttenuation, ParamValue::Byte(v)) => cfg.rain_attenuation = v,
            (Param::GroundAttenuation, ParamValue::Byte(v)) => cfg.ground_attenuation = v,
            (Param::Slot(slot), ParamValue::Flag(f)) => sched.slots[slot.index()] = f,
            (Param::Day(day), ParamValue::Flag(f)) => sched.days[day_index(day)] = f,
            // validate() rejected every other pairing.
            _ => {}
        }
        Ok(())
    }

    /// Every (channel, parameter) pair, in store order.
    pub fn keys() -> impl Iterator<Item = (Channel, Param)> {
        Channel::ALL
            .into_iter()
            .flat_map(|ch| Param::ALL.into_iter().map(move |p| (ch, p)))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
