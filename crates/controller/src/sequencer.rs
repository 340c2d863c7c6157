//! Flow-metered watering of one channel.
//!
//! ```text
//! Idle ──open valve──▶ ValveSettleOpen ──pump on──▶ Pumping ──┬─ flow ≥ target ─┐
//!                                                             └─ timeout/fault ─┤
//!                                          Finished ◀──close valve── ValveSettleClose
//! ```
//!
//! A [`WateringSession`] is stepped by a driver. Each step is one atomic
//! operation under the hardware lock and tells the driver how long to wait
//! before the next one; the driver sleeps with the lock released.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::bus::{Channel, Quantity};
use crate::config::ControllerConfig;
use crate::hardware::{Hardware, SharedHardware};
use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerTiming {
    /// Units to wait after opening the valve before starting the pump.
    pub settle_open: u32,
    /// Units to wait after stopping the pump before closing the valve.
    pub settle_close: u32,
    /// Pumping units after which the channel is given up.
    pub max_watering: u32,
    pub unit: Duration,
}

impl SequencerTiming {
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self {
            settle_open: cfg.valve_settle_open_units,
            settle_close: cfg.valve_settle_close_units,
            max_watering: cfg.max_watering_units,
            unit: Duration::from_millis(cfg.time_unit_ms),
        }
    }
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self {
            settle_open: 2,
            settle_close: 5,
            max_watering: 100,
            unit: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ValveSettleOpen,
    Pumping,
    ValveSettleClose,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    /// Flow never reached the target within the allowed time.
    Timeout,
    /// A bus fault during the sequence.
    Fault(String),
    /// The valve or pump was switched off from outside mid-sequence.
    Interrupted,
}

/// What the driver should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Wait(u32),
    Continue,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub channel: Channel,
    pub target: u8,
    pub delivered: u8,
    pub elapsed: u32,
    pub aborted: Option<AbortReason>,
}

#[derive(Debug)]
pub struct WateringSession {
    channel: Channel,
    target: u8,
    delivered: u8,
    elapsed: u32,
    aborted: Option<AbortReason>,
    phase: Phase,
    timing: SequencerTiming,
}

impl WateringSession {
    pub fn new(channel: Channel, target: u8, timing: SequencerTiming) -> Self {
        Self {
            channel,
            target,
            delivered: 0,
            elapsed: 0,
            aborted: None,
            phase: Phase::Idle,
            timing,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            channel: self.channel,
            target: self.target,
            delivered: self.delivered,
            elapsed: self.elapsed,
            aborted: self.aborted.clone(),
        }
    }

    /// Advance by one operation.
    pub fn step(&mut self, hw: &mut Hardware) -> Step {
        let ch = self.channel;
        match self.phase {
            Phase::Idle => {
                // Only this channel's valve may be open while it waters.
                for other in Channel::ALL.into_iter().filter(|c| *c != ch) {
                    if hw.valve_open(other) {
                        if let Err(e) = hw.set_valve(other, false) {
                            return self.abort_before_pumping(hw, e.to_string());
                        }
                    }
                }
                if let Err(e) = hw.set_valve(ch, true) {
                    return self.abort_before_pumping(hw, e.to_string());
                }
                info!(channel = %ch, target = self.target, "valve open, settling");
                self.phase = Phase::ValveSettleOpen;
                Step::Wait(self.timing.settle_open)
            }
            Phase::ValveSettleOpen => {
                if !hw.valve_open(ch) {
                    warn!(channel = %ch, "valve closed during settle, abandoning channel");
                    self.aborted = Some(AbortReason::Interrupted);
                    self.phase = Phase::Finished;
                    return Step::Done;
                }
                if let Err(e) = hw.set_pump(true) {
                    return self.abort_before_pumping(hw, e.to_string());
                }
                self.phase = Phase::Pumping;
                self.elapsed = 0;
                Step::Continue
            }
            Phase::Pumping => {
                if !hw.pump_on() || !hw.valve_open(ch) {
                    warn!(channel = %ch, elapsed = self.elapsed, "pump or valve switched off mid-sequence");
                    self.aborted = Some(AbortReason::Interrupted);
                    return self.stop_pump(hw);
                }
                match hw.poll(Quantity::Flow(ch)) {
                    Ok(flow) => {
                        self.delivered = flow;
                        if flow >= self.target {
                            info!(channel = %ch, flow, elapsed = self.elapsed, "target volume reached");
                            return self.stop_pump(hw);
                        }
                    }
                    Err(e) => {
                        error!(channel = %ch, error = %e, "flow read failed while pumping");
                        self.aborted = Some(AbortReason::Fault(e.to_string()));
                        return self.stop_pump(hw);
                    }
                }
                if self.elapsed >= self.timing.max_watering {
                    warn!(
                        channel = %ch,
                        elapsed = self.elapsed,
                        flow = self.delivered,
                        target = self.target,
                        "watering timed out before reaching target"
                    );
                    self.aborted = Some(AbortReason::Timeout);
                    return self.stop_pump(hw);
                }
                self.elapsed += 1;
                Step::Wait(1)
            }
            Phase::ValveSettleClose => {
                if let Err(e) = hw.set_valve(ch, false) {
                    error!(channel = %ch, error = %e, "valve close failed");
                    self.aborted.get_or_insert(AbortReason::Fault(e.to_string()));
                }
                self.phase = Phase::Finished;
                Step::Done
            }
            Phase::Finished => Step::Done,
        }
    }

    fn stop_pump(&mut self, hw: &mut Hardware) -> Step {
        if let Err(e) = hw.set_pump(false) {
            error!(channel = %self.channel, error = %e, "pump stop failed");
            self.aborted.get_or_insert(AbortReason::Fault(e.to_string()));
        }
        self.phase = Phase::ValveSettleClose;
        Step::Wait(self.timing.settle_close)
    }

    /// Nothing has pumped yet, so close out immediately.
    fn abort_before_pumping(&mut self, hw: &mut Hardware, detail: String) -> Step {
        error!(channel = %self.channel, error = %detail, "channel aborted, forcing outputs off");
        self.aborted = Some(AbortReason::Fault(detail));
        if let Err(e) = hw.fail_safe() {
            error!(error = %e, "fail-safe incomplete");
        }
        self.phase = Phase::Finished;
        Step::Done
    }
}

/// Drive a session to completion. The hardware lock is taken once per step
/// and released before every wait; the resulting outputs are published to
/// the status snapshot after each step, never with both locks held.
pub async fn run_session(
    hardware: &SharedHardware,
    state: &SharedState,
    mut session: WateringSession,
) -> SessionReport {
    let unit = session.timing.unit;
    loop {
        let (step, outputs) = {
            let mut hw = hardware.lock().await;
            let step = session.step(&mut hw);
            (step, hw.actuators())
        };
        state.write().await.record_outputs(outputs);
        match step {
            Step::Wait(n) => tokio::time::sleep(unit * n).await,
            Step::Continue => {}
            Step::Done => break,
        }
    }
    session.report()
}

// ===========================================================================
// Tests
// ===========================================================================
