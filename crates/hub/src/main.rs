mod abort;
mod bus;
mod calibration;
mod config;
mod device;
mod gpio;
mod irrigation;
mod scheduler;
mod sensors;
mod state;
mod store;
mod web;
mod wire;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use time::UtcOffset;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use abort::{AbortState, SafetyAbort};
use bus::MqttBus;
use calibration::CalibrationEngine;
use device::MeasurementDevice;
use gpio::{ActuatorPort, Relays};
use irrigation::IrrigationActuator;
use scheduler::{ScheduleEngine, SystemClock};
use sensors::SensorAggregator;
use state::HubState;
use store::{Settings, TomlFileStore};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The local offset can only be read while the process is single-threaded.
    // It is fixed for the life of the process: across a DST change daily
    // schedules run an hour off until the hub restarts.
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!("local UTC offset unavailable ({e}), schedule runs on UTC");
        UtcOffset::UTC
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(offset))
}

async fn run(offset: UtcOffset) -> Result<()> {
    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "growbox.toml".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let settings = Arc::new(
        Settings::load(Box::new(TomlFileStore::new(&config_path)))
            .with_context(|| format!("failed to load config from {config_path}"))?,
    );
    let cfg = settings.snapshot();
    cfg.validate()
        .with_context(|| format!("invalid config in {config_path}"))?;
    info!(
        path = %config_path,
        sensors = cfg.sensor_hub.sensors.len(),
        plants = cfg.plants.len(),
        schedules = cfg.event.scheduled_events.len(),
        "config loaded"
    );

    // ── Relay board ─────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let port: Arc<dyn ActuatorPort> =
        Arc::new(gpio::RelayBoard::new().context("GPIO unavailable")?);
    #[cfg(not(feature = "gpio"))]
    let port: Arc<dyn ActuatorPort> = {
        warn!("built without the gpio feature, relays are simulated");
        Arc::new(gpio::MockBoard::new())
    };

    let abort = AbortState::new();
    let relays = Relays::new(Arc::clone(&port), abort.clone());
    relays
        .init_outputs(&cfg.output_pins())
        .context("failed to claim relay outputs")?;
    relays
        .init_inputs(&cfg.input_pins())
        .context("failed to claim fill-level input")?;
    let stuck = relays.all_off();
    if !stuck.is_empty() {
        bail!("relays {stuck:?} could not be switched off at startup");
    }
    let safety = Arc::new(SafetyAbort::new(abort.clone(), Arc::clone(&port)));

    // ── Sensor data ─────────────────────────────────────────────────
    let sensors = Arc::new(SensorAggregator::new(cfg.sensor_hub.max_readings));
    for (label, cal) in cfg.calibrations() {
        sensors.set_calibration(&label, Some(cal));
    }

    let shared = HubState::shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("growbox-hub", broker.clone(), mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 64);
    let bus = Arc::new(MqttBus::new(client, cfg.sensor_hub.command_topic.clone()));
    info!(%broker, port = mqtt_port, "mqtt configured");

    let device = Arc::new(MeasurementDevice::new(
        bus.clone(),
        Arc::clone(&settings),
        Arc::clone(&sensors),
    ));
    if let Err(e) = device.load_sensors() {
        warn!("could not queue sensor set for the device: {e}");
    }

    // ── Control ─────────────────────────────────────────────────────
    let actuator = Arc::new(IrrigationActuator::new(
        relays,
        sensors.clone(),
        device.clone(),
        Arc::clone(&settings),
    ));
    let scheduler = Arc::new(ScheduleEngine::new(
        Arc::clone(&actuator),
        sensors.clone(),
        Arc::clone(&settings),
        abort,
        Arc::new(SystemClock::new(offset)),
        shared.clone(),
    ));
    let calibration = Arc::new(CalibrationEngine::new(
        Arc::clone(&sensors),
        device.clone(),
        Arc::clone(&settings),
    ));

    // ── Tasks ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let events = tokio::spawn(bus::run_event_loop(
        eventloop,
        Arc::clone(&bus),
        Arc::clone(&sensors),
        shared.clone(),
        shutdown_rx.clone(),
    ));

    let sched = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let app = web::AppState {
        shared,
        settings,
        sensors,
        actuator,
        scheduler,
        calibration,
        device,
        safety: Arc::clone(&safety),
    };
    let mut web = tokio::spawn(web::serve(app, web_port, shutdown_rx));

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            None
        }
        served = &mut web => Some(served),
    };

    // Every exit path leaves the pumps off.
    let report = safety.abort();
    if !report.failed.is_empty() {
        error!(failed = ?report.failed, "relays left in unknown state at shutdown");
    }
    let _ = shutdown_tx.send(true);

    for (name, task) in [("mqtt", events), ("scheduler", sched)] {
        if let Err(e) = task.await {
            warn!(task = name, "task ended abnormally: {e}");
        }
    }

    match served {
        None => web.await.context("http task panicked")?,
        Some(served) => {
            served.context("http task panicked")??;
            bail!("http server exited unexpectedly")
        }
    }
}
