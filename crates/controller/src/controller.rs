//! Control tick orchestrator. Once per tick:
//!
//! ```text
//! refresh sensors ─▶ status bits ─▶ telemetry + signal row ─▶ due slot?
//!                                                              │ yes
//!        counters reset ◀── sequencer per channel, ascending ◀─┘
//! ```
//!
//! The loop is single-task and non-reentrant: a tick that is still watering
//! when the next firing arrives causes that firing to be skipped, not queued.

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::bus::Channel;
use crate::config::ControllerConfig;
use crate::db::{LogKind, LogRow, SignalRow};
use crate::error::Fault;
use crate::hardware::SharedHardware;
use crate::schedule::{Clock, ScheduleTracker, Slot};
use crate::sequencer::{run_session, AbortReason, SequencerTiming, SessionReport, WateringSession};
use crate::settings::SharedSettings;
use crate::sink::MetricsSink;
use crate::state::SharedState;
use crate::telemetry::{TelemetryRecord, UdpPublisher};
use crate::volume::{effective_volume, VolumeRounding};

/// What one tick did, for callers that care (tests, mostly).
#[derive(Debug, Default)]
pub struct TickReport {
    pub slot: Option<Slot>,
    pub sessions: Vec<SessionReport>,
    /// Due channels whose effective volume came out as zero.
    pub skipped: Vec<Channel>,
}

pub struct Controller {
    settings: SharedSettings,
    hardware: SharedHardware,
    state: SharedState,
    telemetry: Option<UdpPublisher>,
    sink: MetricsSink,
    timing: SequencerTiming,
    tracker: ScheduleTracker,
    rounding: VolumeRounding,
    tick_period: Duration,
    clock: Clock,
}

impl Controller {
    pub fn new(
        settings: SharedSettings,
        hardware: SharedHardware,
        state: SharedState,
        sink: MetricsSink,
        telemetry: Option<UdpPublisher>,
        cfg: &ControllerConfig,
        clock: Clock,
    ) -> Self {
        let now = clock.now();
        Self {
            settings,
            hardware,
            state,
            telemetry,
            sink,
            timing: SequencerTiming::from_config(cfg),
            tracker: ScheduleTracker::new(cfg.catch_up_missed_slots, now),
            rounding: cfg.volume_rounding,
            tick_period: Duration::from_millis(cfg.tick_ms),
            clock,
        }
    }

    /// Tick until `shutdown` resolves, then force every output off.
    ///
    /// Shutdown also cancels an in-flight tick at its next wait; the hardware
    /// lock is never held across one, so the fail-safe below can always run.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            tick_ms = self.tick_period.as_millis() as u64,
            unit_ms = self.timing.unit.as_millis() as u64,
            rounding = ?self.rounding,
            clock = ?self.clock,
            "controller started"
        );
        self.state
            .write()
            .await
            .record_system("controller started".to_string());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    // Read per tick so a local offset change takes effect.
                    let now = self.clock.now();
                    tokio::select! {
                        _ = self.tick(now) => {}
                        _ = &mut shutdown => {
                            warn!("shutdown requested mid-tick, abandoning cycle");
                            break;
                        }
                    }
                }
            }
        }

        info!("controller stopping, forcing outputs off");
        let (result, actuators) = {
            let mut hw = self.hardware.lock().await;
            (hw.fail_safe(), hw.actuators())
        };
        let mut st = self.state.write().await;
        match result {
            Ok(()) => st.record_actuator("shutdown: all outputs off".to_string(), actuators),
            Err(e) => {
                error!(error = %e, "fail-safe on shutdown incomplete");
                st.record_actuator(format!("shutdown: fail-safe incomplete: {e}"), actuators);
            }
        }
        st.record_system("controller stopped".to_string());
    }

    pub async fn tick(&mut self, now: OffsetDateTime) -> TickReport {
        // ── Sensors ─────────────────────────────────────────
        let (reading, fault_counts) = {
            let mut hw = self.hardware.lock().await;
            let reading = hw.refresh();
            (reading, hw.sensor_fault_counts())
        };
        for fault in &reading.faults {
            self.report_fault("SEN", Fault::Sensor(fault.clone())).await;
        }

        // One consistent view of the settings for the whole tick; remote
        // writes land on the next one.
        let settings = self.settings.read().await.clone();

        // ── Telemetry ───────────────────────────────────────
        if let Some(publisher) = &self.telemetry {
            let record = TelemetryRecord::build(
                &reading.snapshot,
                reading.status,
                &reading.actuators,
                &settings,
            );
            if let Err(e) = publisher.publish(&record).await {
                self.report_fault("NET", Fault::TelemetrySink(e.to_string()))
                    .await;
            }
        }
        self.sink.signal(SignalRow {
            ts: now.unix_timestamp(),
            values: reading.snapshot.values,
            status: reading.status.bits(),
            actuators: reading.actuators,
        });
        self.state.write().await.record_tick(
            now,
            reading.snapshot,
            fault_counts,
            reading.status,
            reading.actuators,
        );

        // ── Schedule ────────────────────────────────────────
        let mut report = TickReport::default();
        let Some(due) = self.tracker.due(now, settings.schedule()) else {
            return report;
        };
        report.slot = Some(due.slot);

        let raining = reading.status.raining();
        let damp = reading.status.ground_damp();
        info!(slot = %due.slot, channels = ?due.channels, raining, damp, "watering cycle starting");
        self.sink.log(LogRow::new(
            "WAT",
            LogKind::Status,
            "Cycle",
            format!("{} slot, {} channel(s)", due.slot, due.channels.len()),
        ));

        for ch in due.channels {
            let volume = effective_volume(settings.channel(ch), raining, damp, self.rounding);
            if volume == 0 {
                info!(channel = %ch, "effective volume is zero, skipping channel");
                report.skipped.push(ch);
                continue;
            }

            self.state.write().await.record_watering_start(ch, volume);
            self.sink.log(LogRow::new(
                "WAT",
                LogKind::Status,
                "Watering",
                format!("channel {ch} started, target {volume}"),
            ));

            let session = WateringSession::new(ch, volume, self.timing);
            let outcome = run_session(&self.hardware, &self.state, session).await;
            self.record_outcome(&outcome).await;
            report.sessions.push(outcome);
        }

        // ── Wrap-up ─────────────────────────────────────────
        let reset = self.hardware.lock().await.reset_flow_counters();
        match reset {
            Ok(()) => {
                info!(slot = %due.slot, "watering cycle complete");
                self.sink
                    .log(LogRow::new("WAT", LogKind::Status, "Counters reset", ""));
            }
            Err(e) => {
                warn!(error = %e, "flow counter reset failed after cycle");
                self.sink.log(LogRow::new(
                    "WAT",
                    LogKind::Warning,
                    "Counters reset",
                    e.to_string(),
                ));
                self.state
                    .write()
                    .await
                    .record_fault(format!("flow counter reset failed: {e}"));
            }
        }
        report
    }

    async fn record_outcome(&self, outcome: &SessionReport) {
        let ch = outcome.channel;
        match &outcome.aborted {
            None => self.sink.log(LogRow::new(
                "WAT",
                LogKind::Status,
                "Watering",
                format!(
                    "channel {ch} done, delivered {} in {} units",
                    outcome.delivered, outcome.elapsed
                ),
            )),
            Some(AbortReason::Timeout) => {
                self.report_fault(
                    "WAT",
                    Fault::WateringTimeout {
                        channel: ch,
                        elapsed: outcome.elapsed,
                    },
                )
                .await;
            }
            Some(reason) => self.sink.log(LogRow::new(
                "WAT",
                LogKind::Warning,
                "Watering",
                format!("channel {ch} aborted: {reason:?}"),
            )),
        }
        self.state
            .write()
            .await
            .record_watering_end(outcome.clone());
    }

    async fn report_fault(&self, instance: &str, fault: Fault) {
        fault.emit();
        self.sink.log(LogRow::from_fault(instance, &fault));
        self.state.write().await.record_fault(fault.to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
