//! Remote commands: `CCC` or `CCC=PPP` where `CCC` is a three-digit code and
//! `PPP` an optional parameter of up to three characters.
//!
//! | code      | action                                    |
//! |-----------|-------------------------------------------|
//! | 120       | reset flow counters                       |
//! | 130 / 131 | open all valves / start pump              |
//! | 132–136   | open valve 1–5                            |
//! | 140 / 141 | all outputs off / stop pump               |
//! | 142–146   | close valve 1–5                           |
//! | 200       | diagnostic dump to the log                |
//! | (4+c)NN   | set parameter `NN` of channel `c`         |
//!
//! Responses are short text. Failures are generic `FAILURE_*` tokens; the
//! detail goes to the log only.

use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{Channel, Line, Quantity, Rail};
use crate::db::{Db, LogKind, LogRow};
use crate::error::Fault;
use crate::hardware::SharedHardware;
use crate::settings::{Param, ParamKind, ParamValue, SharedSettings};
use crate::sink::MetricsSink;
use crate::state::SharedState;

pub const FAILURE_UNKNOWN: &str = "FAILURE_UNKNOWN";
pub const FAILURE_PARAMETER: &str = "FAILURE_PARAMETER";
pub const FAILURE_REJECTED: &str = "FAILURE_REJECTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ResetFlowCounters,
    OpenAllValves,
    StartPump,
    OpenValve(Channel),
    AllOutputsOff,
    StopPump,
    CloseValve(Channel),
    DiagnosticDump,
    Configure {
        channel: Channel,
        param: Param,
        value: ParamValue,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("invalid parameter {value:?} for {param}")]
    InvalidParameter { param: Param, value: String },
}

impl CommandError {
    pub fn token(&self) -> &'static str {
        match self {
            CommandError::Unknown(_) => FAILURE_UNKNOWN,
            CommandError::InvalidParameter { .. } => FAILURE_PARAMETER,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse(query: &str) -> Result<Command, CommandError> {
    let query = query.trim().trim_start_matches('?');
    let (code, arg) = match query.split_once('=') {
        Some((c, a)) => (c.trim(), Some(a.trim())),
        None => (query, None),
    };
    let unknown = || CommandError::Unknown(query.to_string());

    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unknown());
    }
    let n: u16 = code.parse().map_err(|_| unknown())?;

    let cmd = match n {
        120 => Command::ResetFlowCounters,
        130 => Command::OpenAllValves,
        131 => Command::StartPump,
        132..=136 => Command::OpenValve(channel(n - 131).ok_or_else(unknown)?),
        140 => Command::AllOutputsOff,
        141 => Command::StopPump,
        142..=146 => Command::CloseValve(channel(n - 141).ok_or_else(unknown)?),
        200 => Command::DiagnosticDump,
        500..=999 => {
            let ch = channel(n / 100 - 4).ok_or_else(unknown)?;
            let param = Param::from_id((n % 100) as u8).ok_or_else(unknown)?;
            let value = parse_value(param, arg.unwrap_or(""))?;
            Command::Configure {
                channel: ch,
                param,
                value,
            }
        }
        _ => return Err(unknown()),
    };
    Ok(cmd)
}

fn channel(n: u16) -> Option<Channel> {
    u8::try_from(n).ok().and_then(Channel::new)
}

fn parse_value(param: Param, raw: &str) -> Result<ParamValue, CommandError> {
    let invalid = || CommandError::InvalidParameter {
        param,
        value: raw.to_string(),
    };
    if raw.is_empty() || raw.len() > 3 {
        return Err(invalid());
    }
    let value = match param.kind() {
        ParamKind::Byte { .. } => ParamValue::Byte(raw.parse().map_err(|_| invalid())?),
        ParamKind::Flag => match raw.to_ascii_uppercase().as_str() {
            "TRU" | "1" => ParamValue::Flag(true),
            "FAL" | "0" => ParamValue::Flag(false),
            _ => return Err(invalid()),
        },
    };
    param.validate(value).map_err(|_| invalid())
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Everything a command may touch. Cheap to clone.
#[derive(Clone)]
pub struct CommandContext {
    pub settings: SharedSettings,
    pub hardware: SharedHardware,
    pub state: SharedState,
    pub db: Db,
    pub sink: MetricsSink,
}

/// Parse and run a raw query, producing the response text.
pub async fn handle(ctx: &CommandContext, query: &str) -> String {
    match parse(query) {
        Ok(cmd) => execute(ctx, cmd).await,
        Err(e) => {
            warn!(query, error = %e, "remote command rejected");
            e.token().to_string()
        }
    }
}

pub async fn execute(ctx: &CommandContext, cmd: Command) -> String {
    info!(?cmd, "remote command");
    ctx.sink.log(LogRow::new(
        "NET",
        LogKind::Information,
        "Command",
        format!("{cmd:?}"),
    ));

    match cmd {
        Command::ResetFlowCounters => {
            let result = ctx.hardware.lock().await.reset_flow_counters();
            match result {
                Ok(()) => {
                    ctx.state
                        .write()
                        .await
                        .record_command("flow counters reset".to_string());
                    "Reset flow counters".to_string()
                }
                Err(e) => {
                    warn!(error = %e, "flow counter reset failed");
                    ctx.state
                        .write()
                        .await
                        .record_fault(format!("flow counter reset failed: {e}"));
                    FAILURE_REJECTED.to_string()
                }
            }
        }
        Command::OpenAllValves => {
            actuate(ctx, "all valves opened", |hw| {
                let mut first = None;
                for ch in Channel::ALL {
                    if let Err(e) = hw.set_valve(ch, true) {
                        first.get_or_insert(e);
                    }
                }
                first.map_or(Ok(()), Err)
            })
            .await
            .map_or_else(|t| t, |()| "All valves opened".to_string())
        }
        Command::StartPump => actuate(ctx, "pump started", |hw| hw.set_pump(true))
            .await
            .map_or_else(|t| t, |()| "Pump Started".to_string()),
        Command::OpenValve(ch) => {
            actuate(ctx, &format!("valve {ch} opened"), |hw| hw.set_valve(ch, true))
                .await
                .map_or_else(|t| t, |()| format!("Valve #{ch} opened"))
        }
        Command::AllOutputsOff => actuate(ctx, "all outputs off", |hw| hw.fail_safe())
            .await
            .map_or_else(|t| t, |()| "All Outputs Low".to_string()),
        Command::StopPump => actuate(ctx, "pump stopped", |hw| hw.set_pump(false))
            .await
            .map_or_else(|t| t, |()| "Pump stopped".to_string()),
        Command::CloseValve(ch) => {
            actuate(ctx, &format!("valve {ch} closed"), |hw| hw.set_valve(ch, false))
                .await
                .map_or_else(|t| t, |()| format!("Valve #{ch} closed"))
        }
        Command::DiagnosticDump => {
            diagnostic_dump(ctx).await;
            "Command 200 (Debug sensor data) successful".to_string()
        }
        Command::Configure {
            channel,
            param,
            value,
        } => configure(ctx, channel, param, value).await,
    }
}

/// Run one actuation under the hardware lock and record the outcome.
/// `Err` carries the failure token.
async fn actuate<F>(ctx: &CommandContext, what: &str, op: F) -> Result<(), String>
where
    F: FnOnce(&mut crate::hardware::Hardware) -> Result<(), crate::actuator::ActuatorFault>,
{
    let (result, actuators) = {
        let mut hw = ctx.hardware.lock().await;
        let result = op(&mut hw);
        (result, hw.actuators())
    };

    let mut st = ctx.state.write().await;
    match result {
        Ok(()) => {
            st.record_actuator(format!("manual: {what}"), actuators);
            Ok(())
        }
        Err(e) => {
            let fault = Fault::Actuator(e);
            fault.emit();
            st.record_actuator(format!("manual: {what} failed: {fault}"), actuators);
            ctx.sink.log(LogRow::from_fault("NET", &fault));
            Err(FAILURE_REJECTED.to_string())
        }
    }
}

async fn diagnostic_dump(ctx: &CommandContext) {
    let mut hw = ctx.hardware.lock().await;
    let pump = hw.read_line(Line::Pump);
    let valves = Channel::ALL.map(|ch| hw.read_line(Line::Valve(ch)));
    let rails = Rail::ALL.map(|r| hw.rail_ok(r));
    let flows = Channel::ALL.map(|ch| match hw.poll(Quantity::Flow(ch)) {
        Ok(v) => v.to_string(),
        Err(e) => format!("error ({})", e.source),
    });
    let actuator_faults = hw.actuator_fault_count();
    let sensor_faults = hw.sensor_fault_counts();
    drop(hw);

    info!(pump, ?valves, ?rails, ?flows, actuator_faults, ?sensor_faults, "diagnostic dump");
    let detail = format!(
        "pump={pump} valves={valves:?} rails_ok={rails:?} flows={flows:?} \
         actuator_faults={actuator_faults} sensor_faults={sensor_faults:?}"
    );
    ctx.sink.log(LogRow::new("NET", LogKind::Status, "Diagnostic", detail.clone()));
    ctx.state.write().await.record_command(detail);
}

async fn configure(ctx: &CommandContext, ch: Channel, param: Param, value: ParamValue) -> String {
    let key = param.store_key(ch);
    if let Err(e) = ctx.settings.write().await.set(ch, param, value) {
        warn!(key = %key, error = %e, "parameter rejected");
        return FAILURE_PARAMETER.to_string();
    }
    info!(key = %key, param_id = param.id(), %value, "parameter written");

    // The in-memory value is authoritative; a store failure only costs
    // persistence across restarts.
    if let Err(e) = ctx.db.put_setting(&key, value).await {
        warn!(key = %key, error = %format!("{e:#}"), "failed to persist parameter");
        ctx.sink.log(LogRow::new(
            "NET",
            LogKind::Warning,
            "Persist",
            format!("{key}={value}: {e}"),
        ));
    }
    ctx.state
        .write()
        .await
        .record_command(format!("{key} set to {value}"));
    "Parameter was written".to_string()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::SimBus;
    use crate::config::SensorConfig;
    use crate::hardware::Hardware;
    use crate::schedule::Slot;
    use crate::settings::Settings;
    use crate::state::SystemState;
    use std::sync::Arc;
    use time::Weekday;
    use tokio::sync::RwLock;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    pub(crate) async fn context() -> (CommandContext, SimBus) {
        let bus = SimBus::new();
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let (sink, _rx) = MetricsSink::channel(16);
        let ctx = CommandContext {
            settings: Arc::new(RwLock::new(Settings::default())),
            hardware: Hardware::new(Box::new(bus.clone()), SensorConfig::default()).into_shared(),
            state: SystemState::new().into_shared(),
            db,
            sink,
        };
        (ctx, bus)
    }

    // -- Parsing -----------------------------------------------------------

    #[test]
    fn parses_fixed_codes() {
        assert_eq!(parse("120"), Ok(Command::ResetFlowCounters));
        assert_eq!(parse("?130"), Ok(Command::OpenAllValves));
        assert_eq!(parse("131"), Ok(Command::StartPump));
        assert_eq!(parse("132"), Ok(Command::OpenValve(ch(1))));
        assert_eq!(parse("136"), Ok(Command::OpenValve(ch(5))));
        assert_eq!(parse("140"), Ok(Command::AllOutputsOff));
        assert_eq!(parse("141"), Ok(Command::StopPump));
        assert_eq!(parse("146"), Ok(Command::CloseValve(ch(5))));
        assert_eq!(parse("200"), Ok(Command::DiagnosticDump));
    }

    #[test]
    fn parameter_is_ignored_on_fixed_codes() {
        assert_eq!(parse("131=XYZ"), Ok(Command::StartPump));
    }

    #[test]
    fn parses_configuration_codes() {
        assert_eq!(
            parse("501=200"),
            Ok(Command::Configure {
                channel: ch(1),
                param: Param::Volume,
                value: ParamValue::Byte(200)
            })
        );
        assert_eq!(
            parse("?903=TRU"),
            Ok(Command::Configure {
                channel: ch(5),
                param: Param::Slot(Slot::Noon),
                value: ParamValue::Flag(true)
            })
        );
        assert_eq!(
            parse("711=fal"),
            Ok(Command::Configure {
                channel: ch(3),
                param: Param::Day(Weekday::Sunday),
                value: ParamValue::Flag(false)
            })
        );
        assert_eq!(
            parse("612=50"),
            Ok(Command::Configure {
                channel: ch(2),
                param: Param::RainAttenuation,
                value: ParamValue::Byte(50)
            })
        );
    }

    #[test]
    fn unknown_codes() {
        for q in ["", "?", "12", "1200", "abc", "137", "147", "300", "400=1", "500=1", "514=1", "199"] {
            let err = parse(q).unwrap_err();
            assert_eq!(err.token(), FAILURE_UNKNOWN, "{q:?}");
        }
    }

    #[test]
    fn invalid_parameters() {
        for q in ["501", "501=", "501=256", "501=abc", "512=101", "613=150", "502=yes", "505=TRUE"] {
            let err = parse(q).unwrap_err();
            assert_eq!(err.token(), FAILURE_PARAMETER, "{q:?}");
        }
    }

    // -- Execution ---------------------------------------------------------

    #[tokio::test]
    async fn start_pump_without_open_valve_is_rejected() {
        let (ctx, bus) = context().await;
        assert_eq!(handle(&ctx, "131").await, FAILURE_REJECTED);
        assert!(!bus.pump());
    }

    #[tokio::test]
    async fn manual_valve_and_pump_sequence() {
        let (ctx, bus) = context().await;
        assert_eq!(handle(&ctx, "133").await, "Valve #2 opened");
        assert_eq!(handle(&ctx, "131").await, "Pump Started");
        assert!(bus.pump());
        assert!(bus.valve(ch(2)));

        assert_eq!(handle(&ctx, "143").await, "Valve #2 closed");
        assert!(!bus.pump(), "closing the last valve stops the pump");
        assert_eq!(bus.pump_without_valve(), 0);
    }

    #[tokio::test]
    async fn open_all_then_all_off() {
        let (ctx, bus) = context().await;
        assert_eq!(handle(&ctx, "130").await, "All valves opened");
        assert!(Channel::ALL.iter().all(|c| bus.valve(*c)));
        assert_eq!(handle(&ctx, "131").await, "Pump Started");
        assert_eq!(handle(&ctx, "141").await, "Pump stopped");
        assert_eq!(handle(&ctx, "140").await, "All Outputs Low");
        assert!(!Channel::ALL.iter().any(|c| bus.valve(*c)));
        assert_eq!(ctx.state.read().await.actuators.io_bits(), 0);
    }

    #[tokio::test]
    async fn reset_flow_counters_command() {
        let (ctx, bus) = context().await;
        bus.set_value(Quantity::Flow(ch(3)), 77);
        assert_eq!(handle(&ctx, "120").await, "Reset flow counters");
        assert_eq!(bus.value(Quantity::Flow(ch(3))), 0);
    }

    #[tokio::test]
    async fn diagnostic_dump_responds_and_records() {
        let (ctx, _bus) = context().await;
        assert_eq!(
            handle(&ctx, "200").await,
            "Command 200 (Debug sensor data) successful"
        );
        let st = ctx.state.read().await;
        assert!(st.events.back().unwrap().detail.starts_with("pump=false"));
    }

    #[tokio::test]
    async fn configure_updates_settings_and_store() {
        let (ctx, _bus) = context().await;
        assert_eq!(handle(&ctx, "701=180").await, "Parameter was written");
        assert_eq!(handle(&ctx, "705=TRU").await, "Parameter was written");

        let settings = ctx.settings.read().await.clone();
        assert_eq!(settings.channel(ch(3)).target_volume, 180);
        assert!(settings.schedule().channel(ch(3)).days[0]);

        let stored = ctx.db.load_settings().await.unwrap().settings;
        assert_eq!(stored.channel(ch(3)).target_volume, 180);
        assert!(stored.schedule().channel(ch(3)).days[0]);
    }

    #[tokio::test]
    async fn rejected_queries_leave_settings_untouched() {
        let (ctx, _bus) = context().await;
        assert_eq!(handle(&ctx, "512=101").await, FAILURE_PARAMETER);
        assert_eq!(handle(&ctx, "999").await, FAILURE_UNKNOWN);
        assert_eq!(*ctx.settings.read().await, Settings::default());
    }
}
