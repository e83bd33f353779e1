mod actuation;
mod config;
mod controller;
mod error;
mod sampler;
mod scheduler;
mod state;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use controller::IrrigationController;
use sampler::SensorSampler;
use scheduler::{Clock, MainLoop, MonotonicClock};
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").ok();
    let mut cfg = config::load_or_default(config_path.as_deref())?;
    cfg.apply_env_overrides(|key| env::var(key).ok());
    cfg.validate().context("invalid config after environment overrides")?;

    tracing::info!(
        zones = cfg.zones.len(),
        source = ?cfg.sensors.source,
        actuator = ?cfg.actuation.kind,
        auto_mode = cfg.irrigation.auto_mode,
        "config loaded"
    );

    // ── Outputs ─────────────────────────────────────────────────────
    // Fail-safe: every valve and the pump start closed.
    let port = actuation::build(&cfg.zones, &cfg.actuation)?;

    // ── Sensors ─────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let mut sampler = sampler::build(&cfg.sensors)?;
    let first = sampler.sample(clock.now_ms());

    // ── Shared state ────────────────────────────────────────────────
    let controller = IrrigationController::new(&cfg, port);
    let shared = Arc::new(RwLock::new(SystemState::new(
        controller,
        first,
        Arc::clone(&clock),
    )));
    {
        let mut st = shared.write().await;
        st.record_system("controller started".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state.clone(), web_port).await {
            tracing::error!("web server stopped: {e:#}");
            web_state.write().await.record_system(format!("web server stopped: {e}"));
        }
    });

    // ── Main loop ───────────────────────────────────────────────────
    MainLoop::new(sampler, clock, &cfg.timing).run(shared).await;
    Ok(())
}
