mod actuator;
mod bus;
mod command;
mod config;
mod controller;
mod db;
mod error;
mod hardware;
mod schedule;
mod sensors;
mod sequencer;
mod settings;
mod sink;
mod state;
mod telemetry;
mod volume;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use command::CommandContext;
use controller::Controller;
use db::{Db, LogRow};
use hardware::Hardware;
use schedule::Clock;
use sink::MetricsSink;
use state::SystemState;
use telemetry::UdpPublisher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("watering_controller=info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:watering.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081);

    let cfg = config::load_or_default(&config_path)?;
    let clock = Clock::from_config(cfg.controller.utc_offset_minutes)?;

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let state = SystemState::new().into_shared();

    // ── Metrics sink ────────────────────────────────────────────────
    let (sink, sink_rx) = MetricsSink::channel(cfg.sink.queue_capacity);

    // ── Database & settings ─────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let loaded = db.load_settings().await?;
    if loaded.stored == 0 {
        info!("settings store is empty, seeding defaults");
        db.put_all_settings(&loaded.settings).await?;
    } else {
        let mut st = state.write().await;
        for fault in &loaded.faults {
            fault.emit();
            st.record_fault(fault.to_string());
            sink.log(LogRow::from_fault("CFG", fault));
        }
    }
    let settings = Arc::new(RwLock::new(loaded.settings));

    let sink_handle = sink::spawn_writer(db.clone(), sink_rx, cfg.sink.clone());

    // ── Hardware ────────────────────────────────────────────────────
    let bus = hardware::build_bus(&cfg.hardware)?;
    let mut hw = Hardware::new(bus, cfg.sensors.clone());
    if let Err(e) = hw.fail_safe() {
        error!(error = %e, "initial fail-safe incomplete");
    }
    let hardware = hw.into_shared();

    state
        .write()
        .await
        .record_system(format!("controller started ({config_path}, {db_url})"));

    // ── Web server ──────────────────────────────────────────────────
    let ctx = CommandContext {
        settings: Arc::clone(&settings),
        hardware: Arc::clone(&hardware),
        state: Arc::clone(&state),
        db: db.clone(),
        sink: sink.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(ctx, web_port).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── Telemetry ───────────────────────────────────────────────────
    let telemetry = if cfg.telemetry.enabled {
        match UdpPublisher::bind(&cfg.telemetry).await {
            Ok(p) => {
                info!(target = %p.target(), "telemetry broadcast enabled");
                Some(p)
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "telemetry disabled");
                None
            }
        }
    } else {
        None
    };

    // ── Control loop ────────────────────────────────────────────────
    let controller = Controller::new(
        settings,
        hardware,
        state,
        sink,
        telemetry,
        &cfg.controller,
        clock,
    );
    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received");
        })
        .await;

    sink_handle.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
