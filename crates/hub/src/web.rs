use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::abort::SafetyAbort;
use crate::bus::BusError;
use crate::calibration::{self, CalibrationEngine, CalibrationError};
use crate::device::MeasurementDevice;
use crate::irrigation::{CycleState, IrrigationActuator, IrrigationError, Outcome};
use crate::scheduler::{ScheduleEngine, TimeOfDay};
use crate::sensors::{ChannelSnapshot, SensorAggregator, SensorReader};
use crate::state::{HubEvent, SharedState};
use crate::store::Settings;

/// Everything the HTTP handlers reach into.
#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub settings: Arc<Settings>,
    pub sensors: Arc<SensorAggregator>,
    pub actuator: Arc<IrrigationActuator>,
    pub scheduler: Arc<ScheduleEngine<IrrigationActuator>>,
    pub calibration: Arc<CalibrationEngine>,
    pub device: Arc<MeasurementDevice>,
    pub safety: Arc<SafetyAbort>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

/// Rejected config edits and bad arguments.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("{err:#}"))
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        error!(error = %err, "device command failed");
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<CalibrationError> for ApiError {
    fn from(err: CalibrationError) -> Self {
        let status = match &err {
            CalibrationError::NotFinite
            | CalibrationError::ZeroRange(_)
            | CalibrationError::Window(_) => StatusCode::BAD_REQUEST,
            CalibrationError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            CalibrationError::NoSamples(_) => StatusCode::CONFLICT,
            CalibrationError::Persist(_) => {
                error!(error = %err, "calibration not persisted");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn accepted(job: &str) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "started": job }))).into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(api_sensors))
        .route("/api/sensors/{label}/history", get(api_sensor_history))
        .route("/api/abort", post(api_abort))
        .route("/api/reset", post(api_reset))
        .route("/api/cycle", post(api_cycle))
        .route("/api/mixer/mix", post(api_mix))
        .route("/api/mixer/fill", post(api_fill))
        .route("/api/distribute", post(api_distribute))
        .route("/api/plants/{id}/water", post(api_water_plant))
        .route("/api/schedule", get(api_schedule).post(api_add_schedule))
        .route("/api/schedule/{time}", delete(api_remove_schedule))
        .route("/api/sensors/{label}/calibration", post(api_calibrate))
        .route("/api/sensors/{label}/calibrate-auto", post(api_calibrate_auto))
        .route("/api/sensor-hub/max-readings", post(api_max_readings))
        .route("/api/sensor-hub/command", post(api_device_command))
        .route("/api/sensor-hub/sensors", post(api_add_sensor))
        .route("/api/sensor-hub/sensors/{label}", delete(api_remove_sensor))
        .route("/api/config", get(api_config).post(api_edit_config))
        .with_state(state)
}

// -- Status ----------------------------------------------------------------

#[derive(Serialize)]
struct StatusBody {
    uptime_secs: u64,
    mqtt_connected: bool,
    aborted: bool,
    cycle_state: CycleState,
    busy: bool,
    mixer_full: Option<bool>,
    events: Vec<HubEvent>,
}

async fn api_status(State(app): State<AppState>) -> Json<StatusBody> {
    let st = app.shared.read().await;
    Json(StatusBody {
        uptime_secs: st.uptime_secs(),
        mqtt_connected: st.mqtt_connected,
        aborted: app.safety.is_aborted(),
        cycle_state: app.actuator.state(),
        busy: app.actuator.is_busy(),
        mixer_full: app.actuator.is_mixer_full().ok(),
        events: st.recent_events(),
    })
}

async fn api_sensors(State(app): State<AppState>) -> Json<BTreeMap<String, ChannelSnapshot>> {
    Json(app.sensors.snapshot())
}

async fn api_sensor_history(
    State(app): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<Response> {
    let history = app.sensors.history(&label);
    if history.is_empty() && app.sensors.latest(&label).is_none() {
        return Err(ApiError::not_found(format!("no readings for '{label}'")));
    }
    Ok(Json(history).into_response())
}

// -- Abort -----------------------------------------------------------------

async fn api_abort(State(app): State<AppState>) -> Response {
    let report = app.safety.abort();
    app.shared
        .write()
        .await
        .record_abort(format!("operator abort, {} outputs off", report.switched_off.len()));
    Json(report).into_response()
}

async fn api_reset(State(app): State<AppState>) -> StatusCode {
    app.safety.reset();
    app.shared
        .write()
        .await
        .record_system("abort cleared".to_string());
    StatusCode::NO_CONTENT
}

// -- Watering --------------------------------------------------------------

fn ensure_can_start(app: &AppState) -> ApiResult<()> {
    if app.safety.is_aborted() {
        return Err(ApiError::conflict("abort is active"));
    }
    if app.actuator.is_busy() {
        return Err(ApiError::conflict("a watering sequence is already running"));
    }
    Ok(())
}

/// Run a sequence in the background and log how it ended.
fn spawn_sequence<F>(shared: SharedState, what: String, job: F)
where
    F: Future<Output = Result<Outcome, IrrigationError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = job.await;
        let mut st = shared.write().await;
        match result {
            Ok(outcome) => {
                info!(job = %what, ?outcome, "sequence finished");
                st.record_irrigation(format!("{what}: {outcome:?}"));
            }
            Err(e) => {
                error!(job = %what, "sequence failed: {e}");
                st.record_error(format!("{what} failed: {e}"));
            }
        }
    });
}

async fn api_cycle(State(app): State<AppState>) -> ApiResult<Response> {
    ensure_can_start(&app)?;
    let actuator = Arc::clone(&app.actuator);
    spawn_sequence(app.shared.clone(), "manual cycle".into(), async move {
        actuator.run_cycle().await
    });
    Ok(accepted("cycle"))
}

#[derive(Debug, Default, Deserialize)]
struct MixRequest {
    /// Nutrient name to millilitres; the configured amounts when absent.
    amounts: Option<BTreeMap<String, f64>>,
}

async fn api_mix(
    State(app): State<AppState>,
    Json(req): Json<MixRequest>,
) -> ApiResult<Response> {
    ensure_can_start(&app)?;
    let amounts = req
        .amounts
        .unwrap_or_else(|| app.settings.snapshot().water_nutrient.nutrient_amounts);
    if let Some((name, ml)) = amounts.iter().find(|(_, ml)| !(ml.is_finite() && **ml >= 0.0)) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("amount for '{name}' must be a non-negative volume, got {ml}"),
        ));
    }
    let actuator = Arc::clone(&app.actuator);
    spawn_sequence(app.shared.clone(), "mixing".into(), async move {
        actuator.mix_nutrients(&amounts).await
    });
    Ok(accepted("mixing"))
}

#[derive(Debug, Default, Deserialize)]
struct FillRequest {
    target_ml: Option<f64>,
}

async fn api_fill(
    State(app): State<AppState>,
    Json(req): Json<FillRequest>,
) -> ApiResult<Response> {
    ensure_can_start(&app)?;
    let target_ml = req
        .target_ml
        .unwrap_or_else(|| app.settings.snapshot().water_nutrient.total_water_ml);
    if !(target_ml.is_finite() && target_ml > 0.0) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "target_ml must be positive",
        ));
    }
    let actuator = Arc::clone(&app.actuator);
    spawn_sequence(app.shared.clone(), "mixer fill".into(), async move {
        actuator.fill_mixer(target_ml).await
    });
    Ok(accepted("filling"))
}

#[derive(Debug, Default, Deserialize)]
struct DistributeRequest {
    /// A plant id or distribution pump id; every pump when absent.
    target: Option<String>,
    ml: Option<f64>,
}

async fn api_distribute(
    State(app): State<AppState>,
    Json(req): Json<DistributeRequest>,
) -> ApiResult<Response> {
    ensure_can_start(&app)?;
    let ml = req
        .ml
        .unwrap_or_else(|| app.settings.snapshot().water_nutrient.ml_per_plant);
    if !(ml.is_finite() && ml > 0.0) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "ml must be positive"));
    }
    let actuator = Arc::clone(&app.actuator);
    match req.target {
        Some(target) => {
            let what = format!("distribution to {target}");
            spawn_sequence(app.shared.clone(), what, async move {
                actuator.distribute_to_plant(&target, ml).await
            })
        }
        None => spawn_sequence(app.shared.clone(), "distribution".into(), async move {
            actuator.distribute_to_plants(ml).await
        }),
    }
    Ok(accepted("distribution"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WaterMode {
    /// Mix, fill and pump the configured volume.
    #[default]
    Cycle,
    /// Mix, fill and pump until the stop threshold.
    Sensor,
    /// Pump from the mixer until the stop threshold.
    Direct,
}

#[derive(Debug, Deserialize)]
struct WaterQuery {
    #[serde(default)]
    mode: WaterMode,
}

async fn api_water_plant(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaterQuery>,
) -> ApiResult<Response> {
    let Some(plant) = app.settings.snapshot().plant(&id) else {
        return Err(ApiError::not_found(format!("unknown plant '{id}'")));
    };
    ensure_can_start(&app)?;

    let actuator = Arc::clone(&app.actuator);
    let what = format!("plant {id} ({:?})", query.mode);
    match query.mode {
        WaterMode::Cycle => spawn_sequence(app.shared.clone(), what, async move {
            actuator.run_cycle_for_plant(&plant.id).await
        }),
        WaterMode::Sensor => spawn_sequence(app.shared.clone(), what, async move {
            actuator.run_sensor_cycle(&plant.id).await
        }),
        WaterMode::Direct => spawn_sequence(app.shared.clone(), what, async move {
            actuator.sensor_based_distribute(&plant).await
        }),
    }
    Ok(accepted("watering"))
}

// -- Schedule --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    time_of_day: TimeOfDay,
}

async fn api_schedule(State(app): State<AppState>) -> Response {
    Json(app.scheduler.scheduled()).into_response()
}

async fn api_add_schedule(
    State(app): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<StatusCode> {
    if app.scheduler.add_schedule(req.time_of_day)? {
        Ok(StatusCode::CREATED)
    } else {
        Ok(StatusCode::OK)
    }
}

async fn api_remove_schedule(
    State(app): State<AppState>,
    Path(time): Path<String>,
) -> ApiResult<StatusCode> {
    let at = time
        .parse::<TimeOfDay>()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    if app.scheduler.remove_schedule(at)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("nothing scheduled at {at}")))
    }
}

// -- Calibration -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CalibrationRequest {
    dry_value: f64,
    wet_value: f64,
}

async fn api_calibrate(
    State(app): State<AppState>,
    Path(label): Path<String>,
    Json(req): Json<CalibrationRequest>,
) -> ApiResult<Response> {
    let cal = app
        .calibration
        .calibrate(&label, req.dry_value, req.wet_value)?;
    Ok(Json(cal).into_response())
}

#[derive(Debug, Deserialize)]
struct AutoCalibrationRequest {
    #[serde(default = "default_auto_duration")]
    duration_secs: u64,
    #[serde(default = "default_sample_delay")]
    sample_delay_ms: u64,
}

fn default_auto_duration() -> u64 {
    60
}

fn default_sample_delay() -> u64 {
    1000
}

async fn api_calibrate_auto(
    State(app): State<AppState>,
    Path(label): Path<String>,
    Json(req): Json<AutoCalibrationRequest>,
) -> ApiResult<Response> {
    if !app.settings.snapshot().sensor_hub.sensors.contains_key(&label) {
        return Err(CalibrationError::UnknownChannel(label).into());
    }
    let duration = Duration::from_secs(req.duration_secs);
    let sample_delay = Duration::from_millis(req.sample_delay_ms);
    calibration::check_window(duration, sample_delay)?;

    let engine = Arc::clone(&app.calibration);
    let shared = app.shared.clone();
    tokio::spawn(async move {
        let result = engine
            .calibrate_auto(&label, duration, sample_delay)
            .await;
        let mut st = shared.write().await;
        match result {
            Ok(cal) => st.record_system(format!(
                "{label} calibrated: dry {} wet {}",
                cal.dry_value, cal.wet_value
            )),
            Err(e) => {
                warn!(label = %label, "automatic calibration failed: {e}");
                st.record_error(format!("{label} calibration failed: {e}"));
            }
        }
    });
    Ok(accepted("calibration"))
}

// -- Measurement device ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct MaxReadingsRequest {
    max_readings: usize,
}

async fn api_max_readings(
    State(app): State<AppState>,
    Json(req): Json<MaxReadingsRequest>,
) -> ApiResult<Response> {
    let interval_ms = app.device.set_max_readings(req.max_readings)?;
    Ok(Json(json!({
        "max_readings": req.max_readings,
        "interval_ms": interval_ms,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum DeviceCommandKind {
    ClearAll,
    Restart,
    /// Push the configured sensor set to the device again.
    Reload,
}

#[derive(Debug, Deserialize)]
struct DeviceCommandRequest {
    command: DeviceCommandKind,
}

async fn api_device_command(
    State(app): State<AppState>,
    Json(req): Json<DeviceCommandRequest>,
) -> ApiResult<StatusCode> {
    match req.command {
        DeviceCommandKind::ClearAll => app.device.clear_all()?,
        DeviceCommandKind::Restart => app.device.restart()?,
        DeviceCommandKind::Reload => app.device.load_sensors()?,
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AddSensorRequest {
    pin: String,
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

async fn api_add_sensor(
    State(app): State<AppState>,
    Json(req): Json<AddSensorRequest>,
) -> ApiResult<Response> {
    let label = app.device.add_sensor(&req.pin, &req.kind, &req.id)?;
    Ok((StatusCode::CREATED, Json(json!({ "label": label }))).into_response())
}

async fn api_remove_sensor(
    State(app): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<StatusCode> {
    app.device.remove_sensor(&label)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Config ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    path: Option<String>,
}

async fn api_config(
    State(app): State<AppState>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Response> {
    let Some(path) = query.path else {
        return Ok(Json(app.settings.snapshot()).into_response());
    };
    let value = app
        .settings
        .get_path(&path)
        .ok_or_else(|| ApiError::not_found(format!("no config value at '{path}'")))?;
    Ok(Json(value).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConfigOp {
    #[default]
    Set,
    Append,
    Remove,
}

#[derive(Debug, Deserialize)]
struct ConfigEdit {
    path: String,
    #[serde(default)]
    op: ConfigOp,
    #[serde(default)]
    value: serde_json::Value,
}

async fn api_edit_config(
    State(app): State<AppState>,
    Json(req): Json<ConfigEdit>,
) -> ApiResult<StatusCode> {
    if let ConfigOp::Remove = req.op {
        app.settings.remove_path(&req.path)?;
        return Ok(StatusCode::NO_CONTENT);
    }
    let value = toml::Value::try_from(&req.value).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("value has no TOML form: {e}"),
        )
    })?;
    match req.op {
        ConfigOp::Append => app.settings.append_path(&req.path, value)?,
        _ => app.settings.set_path(&req.path, value)?,
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind web port {port}: {e}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
