//! Weekly schedule evaluation.
//!
//! Three fixed trigger seconds per day. In the default mode a slot fires
//! only on a tick whose wall-clock second matches its trigger exactly, so a
//! tick that skips that second misses the slot for the day. The catch-up
//! mode keeps a per-slot latch instead and fires on the first tick at or
//! after the trigger, once per day.

use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use time::macros::time;
use time::{Date, OffsetDateTime, Time, UtcOffset};
use tracing::warn;

use crate::bus::Channel;
use crate::settings::ScheduleGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Morning,
    Noon,
    Evening,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Morning, Slot::Noon, Slot::Evening];

    pub fn index(self) -> usize {
        match self {
            Slot::Morning => 0,
            Slot::Noon => 1,
            Slot::Evening => 2,
        }
    }

    pub fn trigger(self) -> Time {
        match self {
            Slot::Morning => time!(07:00:01),
            Slot::Noon => time!(12:00:01),
            Slot::Evening => time!(18:40:01),
        }
    }

    /// The slot whose trigger falls in the same wall-clock second as `t`.
    pub fn at(t: Time) -> Option<Slot> {
        Slot::ALL.into_iter().find(|s| {
            let trig = s.trigger();
            trig.hour() == t.hour() && trig.minute() == t.minute() && trig.second() == t.second()
        })
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Slot::Morning => "morning",
            Slot::Noon => "noon",
            Slot::Evening => "evening",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

/// The wall clock slots are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// A configured offset, never adjusted.
    Fixed(UtcOffset),
    /// The OS local offset, looked up for every reading so daylight-saving
    /// changes apply without a restart. UTC when it cannot be determined.
    Local,
}

impl Clock {
    pub fn from_config(offset_minutes: Option<i16>) -> Result<Self> {
        match offset_minutes {
            Some(m) => {
                let offset = UtcOffset::from_whole_seconds(i32::from(m) * 60)
                    .with_context(|| format!("invalid utc offset {m} minutes"))?;
                Ok(Clock::Fixed(offset))
            }
            None => {
                if let Err(e) = UtcOffset::current_local_offset() {
                    warn!(error = %e, "local UTC offset unavailable, scheduling in UTC until it is");
                }
                Ok(Clock::Local)
            }
        }
    }

    pub fn now(self) -> OffsetDateTime {
        self.at(OffsetDateTime::now_utc())
    }

    /// Wall-clock time at instant `t`.
    pub fn at(self, t: OffsetDateTime) -> OffsetDateTime {
        match self {
            Clock::Fixed(offset) => t.to_offset(offset),
            Clock::Local => match UtcOffset::local_offset_at(t) {
                Ok(offset) => t.to_offset(offset),
                Err(_) => t.to_offset(UtcOffset::UTC),
            },
        }
    }
}

/// Channels due at `now`, ascending. Empty unless `now` is exactly on a
/// trigger second.
pub fn due_channels(now: OffsetDateTime, grid: &ScheduleGrid) -> Vec<Channel> {
    match Slot::at(now.time()) {
        Some(slot) => grid.channels_for(now.weekday(), slot),
        None => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Catch-up latch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SlotLatch {
    fired: [Option<Date>; 3],
}

impl SlotLatch {
    /// Slots already past at `now` count as fired, so a mid-day start does
    /// not replay the morning.
    pub fn new(now: OffsetDateTime) -> Self {
        let mut fired = [None; 3];
        for slot in Slot::ALL {
            if now.time() > slot.trigger() {
                fired[slot.index()] = Some(now.date());
            }
        }
        Self { fired }
    }

    /// The slot to run now, if any. When several slots are pending only the
    /// latest one runs; the earlier ones are marked fired and skipped.
    pub fn poll(&mut self, now: OffsetDateTime) -> Option<Slot> {
        let today = now.date();
        let mut due = None;
        for slot in Slot::ALL {
            let i = slot.index();
            if now.time() >= slot.trigger() && self.fired[i] != Some(today) {
                self.fired[i] = Some(today);
                due = Some(slot);
            }
        }
        due
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DueSlot {
    pub slot: Slot,
    pub channels: Vec<Channel>,
}

/// Picks between exact-second matching and the catch-up latch.
#[derive(Debug, Clone)]
pub enum ScheduleTracker {
    Exact,
    CatchUp(SlotLatch),
}

impl ScheduleTracker {
    pub fn new(catch_up: bool, now: OffsetDateTime) -> Self {
        if catch_up {
            ScheduleTracker::CatchUp(SlotLatch::new(now))
        } else {
            ScheduleTracker::Exact
        }
    }

    /// `None` when nothing is due, including when a slot fires but no
    /// channel is enabled for it today.
    pub fn due(&mut self, now: OffsetDateTime, grid: &ScheduleGrid) -> Option<DueSlot> {
        let (slot, channels) = match self {
            ScheduleTracker::Exact => (Slot::at(now.time())?, due_channels(now, grid)),
            ScheduleTracker::CatchUp(latch) => {
                let slot = latch.poll(now)?;
                (slot, grid.channels_for(now.weekday(), slot))
            }
        };
        (!channels.is_empty()).then_some(DueSlot { slot, channels })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Param, ParamValue, Settings};
    use time::macros::datetime;
    use time::Weekday;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    /// Channels 1 and 3 on Mondays, mornings; channel 2 on Mondays, evenings.
    fn grid() -> ScheduleGrid {
        let mut s = Settings::default();
        let on = ParamValue::Flag(true);
        for c in [ch(1), ch(2), ch(3)] {
            s.set(c, Param::Day(Weekday::Monday), on).unwrap();
        }
        s.set(ch(1), Param::Slot(Slot::Morning), on).unwrap();
        s.set(ch(3), Param::Slot(Slot::Morning), on).unwrap();
        s.set(ch(2), Param::Slot(Slot::Evening), on).unwrap();
        *s.schedule()
    }

    // 2024-01-01 is a Monday.

    #[test]
    fn due_on_exact_trigger_second() {
        let g = grid();
        assert_eq!(due_channels(datetime!(2024-01-01 07:00:01 UTC), &g), vec![ch(1), ch(3)]);
        assert_eq!(due_channels(datetime!(2024-01-01 18:40:01 UTC), &g), vec![ch(2)]);
    }

    #[test]
    fn sub_second_offset_still_matches() {
        let g = grid();
        assert_eq!(
            due_channels(datetime!(2024-01-01 07:00:01.750 UTC), &g),
            vec![ch(1), ch(3)]
        );
    }

    #[test]
    fn nothing_due_at_neighbouring_seconds() {
        let g = grid();
        for t in [
            datetime!(2024-01-01 07:00:00 UTC),
            datetime!(2024-01-01 07:00:02 UTC),
            datetime!(2024-01-01 07:01:01 UTC),
            datetime!(2024-01-01 12:00:01 UTC),
        ] {
            assert!(due_channels(t, &g).is_empty(), "{t}");
        }
    }

    #[test]
    fn nothing_due_on_other_weekdays() {
        let g = grid();
        assert!(due_channels(datetime!(2024-01-02 07:00:01 UTC), &g).is_empty());
        assert!(due_channels(datetime!(2024-01-07 07:00:01 UTC), &g).is_empty());
    }

    #[test]
    fn exhaustive_iff_over_one_day() {
        let g = grid();
        let start = datetime!(2024-01-01 00:00:00 UTC);
        let mut hits = 0;
        for s in 0..86_400 {
            let now = start + time::Duration::seconds(s);
            let due = due_channels(now, &g);
            let on_trigger = Slot::at(now.time()).is_some();
            if !due.is_empty() {
                assert!(on_trigger, "{now}");
                hits += 1;
            }
        }
        assert_eq!(hits, 2);
    }

    #[test]
    fn exact_tracker_skips_missed_second() {
        let g = grid();
        let mut tracker = ScheduleTracker::new(false, datetime!(2024-01-01 06:00:00 UTC));
        assert!(tracker.due(datetime!(2024-01-01 07:00:02 UTC), &g).is_none());
    }

    #[test]
    fn catch_up_fires_once_after_missed_second() {
        let g = grid();
        let mut tracker = ScheduleTracker::new(true, datetime!(2024-01-01 06:00:00 UTC));
        assert!(tracker.due(datetime!(2024-01-01 07:00:00 UTC), &g).is_none());

        let due = tracker.due(datetime!(2024-01-01 07:00:03 UTC), &g).unwrap();
        assert_eq!(due.slot, Slot::Morning);
        assert_eq!(due.channels, vec![ch(1), ch(3)]);

        assert!(tracker.due(datetime!(2024-01-01 07:00:04 UTC), &g).is_none());
        assert!(tracker.due(datetime!(2024-01-01 11:00:00 UTC), &g).is_none());
    }

    #[test]
    fn catch_up_latch_rearms_next_day() {
        let mut latch = SlotLatch::new(datetime!(2024-01-01 06:00:00 UTC));
        assert_eq!(latch.poll(datetime!(2024-01-01 07:00:01 UTC)), Some(Slot::Morning));
        assert_eq!(latch.poll(datetime!(2024-01-01 20:00:00 UTC)), Some(Slot::Evening));
        assert_eq!(latch.poll(datetime!(2024-01-01 23:00:00 UTC)), None);
        assert_eq!(latch.poll(datetime!(2024-01-02 07:00:05 UTC)), Some(Slot::Morning));
    }

    #[test]
    fn catch_up_does_not_replay_slots_before_start() {
        let mut latch = SlotLatch::new(datetime!(2024-01-01 13:00:00 UTC));
        assert_eq!(latch.poll(datetime!(2024-01-01 13:00:01 UTC)), None);
        assert_eq!(latch.poll(datetime!(2024-01-01 18:40:01 UTC)), Some(Slot::Evening));
    }

    // -- Clock ------------------------------------------------------------

    #[test]
    fn configured_offset_is_fixed() {
        let clock = Clock::from_config(Some(60)).unwrap();
        assert_eq!(clock, Clock::Fixed(UtcOffset::from_hms(1, 0, 0).unwrap()));

        // 06:00:01 UTC is the 07:00:01 morning trigger one hour east.
        let local = clock.at(datetime!(2024-01-01 06:00:01 UTC));
        assert_eq!(local.offset().whole_minutes(), 60);
        assert_eq!(Slot::at(local.time()), Some(Slot::Morning));
    }

    #[test]
    fn unset_offset_follows_the_os() {
        assert_eq!(Clock::from_config(None).unwrap(), Clock::Local);
        let west = Clock::from_config(Some(-300)).unwrap();
        assert_eq!(west.at(datetime!(2024-01-01 12:00 UTC)).hour(), 7);
    }

    #[test]
    fn local_clock_resolves_offset_per_instant() {
        // Winter and summer instants are resolved independently, so a DST
        // change is picked up by the next reading.
        for t in [
            datetime!(2024-01-15 06:00:01 UTC),
            datetime!(2024-07-15 06:00:01 UTC),
        ] {
            let expected = UtcOffset::local_offset_at(t).unwrap_or(UtcOffset::UTC);
            let local = Clock::Local.at(t);
            assert_eq!(local.offset(), expected);
            assert_eq!(local, t);
        }
    }
}
