//! HTTP RPC surface for the scope daemon: the oscilloscope streaming
//! pipeline, exposed as the `pico.*` methods.
//!
//! This process never touches the marker pipe — it owns the scope handle
//! and segments kernel windows purely by thresholding its own pulse
//! channel, synchronized to the rapl daemon only through the physical
//! pulse wire (see the Process topology note in the spec). No vendor
//! PicoScope SDK is linked; [`kernelmeter_core::scope::WaveformScopeDevice`]
//! stands in for the hardware with a generated waveform.

use axum::{Json, Router, extract::State, routing::post};
use kernelmeter_core::config::Config;
use kernelmeter_core::marker::ArmState;
use kernelmeter_core::model::TimeUnit;
use kernelmeter_core::scope::{ScopePipeline, WaveformScopeDevice};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// How many synthetic samples back each 1 Hz poll, and how many of them sit
/// in each pulse phase — tuned so the default config produces one kernel
/// window per second of streaming, a believable demo cadence.
const DEFAULT_SAMPLES_PER_POLL: usize = 1000;
const DEFAULT_HALF_PERIOD_SAMPLES: usize = 500;

pub struct AppState {
    pipeline: Arc<Mutex<ScopePipeline<WaveformScopeDevice>>>,
    streaming_flag: Arc<AtomicBool>,
    armed: AtomicBool,
    streaming_thread_running: AtomicBool,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let device = WaveformScopeDevice::new(DEFAULT_HALF_PERIOD_SAMPLES, DEFAULT_SAMPLES_PER_POLL);
        let pipeline = ScopePipeline::new(
            device,
            config.scope.channels.clone(),
            config.scope.pulse_threshold_mv,
        );
        let streaming_flag = pipeline.streaming_flag();
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
            streaming_flag,
            armed: AtomicBool::new(false),
            streaming_thread_running: AtomicBool::new(false),
        }
    }
}

#[derive(Serialize)]
struct BoolResponse {
    success: bool,
}

#[derive(Serialize)]
struct ScopeAccumulatorJson {
    energy: f64,
    #[serde(rename = "minPower")]
    min_power: f64,
    #[serde(rename = "maxPower")]
    max_power: f64,
    #[serde(rename = "elapsedTime")]
    elapsed_time: f64,
}

#[derive(Serialize)]
struct ScopeInfoJson {
    #[serde(rename = "driverVersion")]
    driver_version: String,
    #[serde(rename = "usbVersion")]
    usb_version: String,
    #[serde(rename = "hardwareVersion")]
    hardware_version: String,
    #[serde(rename = "variantNumber")]
    variant_number: String,
    #[serde(rename = "batchAndSerial")]
    batch_and_serial: String,
    #[serde(rename = "calibrationDate")]
    calibration_date: String,
    #[serde(rename = "kernelVersion")]
    kernel_version: String,
}

#[derive(Serialize)]
struct ChannelInfoJson {
    coupling: u8,
    range: u32,
    #[serde(rename = "isEnabled")]
    is_enabled: bool,
    #[serde(rename = "analogOffset")]
    analog_offset: f64,
    resistance: f64,
    #[serde(rename = "isParport")]
    is_parport: bool,
}

#[derive(Deserialize)]
struct SetSampleRequest {
    interval: u32,
    unit: String,
}

fn parse_time_unit(unit: &str) -> Option<TimeUnit> {
    match unit.to_ascii_lowercase().as_str() {
        "fs" => Some(TimeUnit::Fs),
        "ps" => Some(TimeUnit::Ps),
        "ns" => Some(TimeUnit::Ns),
        "us" | "µs" => Some(TimeUnit::Us),
        "ms" => Some(TimeUnit::Ms),
        "s" => Some(TimeUnit::S),
        _ => None,
    }
}

async fn pico_open(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    let success = state.pipeline.lock().unwrap().open().is_ok();
    if success {
        info!("scope device opened");
    } else {
        warn!("scope device open failed");
    }
    Json(BoolResponse { success })
}

async fn pico_close(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    let success = state.pipeline.lock().unwrap().close().is_ok();
    Json(BoolResponse { success })
}

async fn pico_get_scope_info(State(state): State<Arc<AppState>>) -> Json<ScopeInfoJson> {
    let pipeline = state.pipeline.lock().unwrap();
    let info = pipeline.device().device_info();
    Json(ScopeInfoJson {
        driver_version: info.driver_version.clone(),
        usb_version: info.usb_version.clone(),
        hardware_version: info.hardware_version.clone(),
        variant_number: info.variant.clone(),
        batch_and_serial: info.batch_and_serial.clone(),
        calibration_date: info.calibration_date.clone(),
        kernel_version: info.kernel_version.clone(),
    })
}

async fn pico_channel_info(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, ChannelInfoJson>> {
    let pipeline = state.pipeline.lock().unwrap();
    let data = pipeline
        .channels()
        .iter()
        .map(|c| {
            (
                c.component_id.clone(),
                ChannelInfoJson {
                    coupling: matches!(c.coupling, kernelmeter_core::model::Coupling::Ac) as u8,
                    range: c.voltage_range_mv,
                    is_enabled: c.enabled,
                    analog_offset: c.analog_offset_v,
                    resistance: c.shunt_resistance_ohms,
                    is_parport: c.is_pulse_channel,
                },
            )
        })
        .collect();
    Json(data)
}

async fn pico_start_streaming(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    if !state.pipeline.lock().unwrap().is_available() {
        warn!("scope arm rejected: device unavailable");
        return Json(BoolResponse { success: false });
    }
    let success = ArmState::arm(&state.armed);
    if success {
        {
            let mut pipeline = state.pipeline.lock().unwrap();
            pipeline.start_measurement();
            if let Err(e) = pipeline.start_streaming() {
                warn!("scope: failed to start streaming: {e}");
                ArmState::disarm(&state.armed);
                return Json(BoolResponse { success: false });
            }
        }
        if !state.streaming_thread_running.swap(true, Ordering::SeqCst) {
            let thread_state = state.clone();
            std::thread::spawn(move || {
                thread_state.pipeline.lock().unwrap().run_streaming_loop();
                thread_state
                    .streaming_thread_running
                    .store(false, Ordering::SeqCst);
            });
        }
        info!("scope streaming armed");
    }
    Json(BoolResponse { success })
}

async fn pico_stop_streaming(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    ArmState::disarm(&state.armed);
    state.streaming_flag.store(false, Ordering::SeqCst);
    Json(BoolResponse { success: true })
}

async fn pico_get_values(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<HashMap<String, ScopeAccumulatorJson>>> {
    let pipeline = state.pipeline.lock().unwrap();
    let data = pipeline
        .kernel_list()
        .results()
        .iter()
        .map(|result| {
            result
                .channels
                .iter()
                .map(|(id, acc)| {
                    (
                        id.clone(),
                        ScopeAccumulatorJson {
                            energy: acc.energy_joules,
                            min_power: acc.min_power_watts,
                            max_power: acc.max_power_watts,
                            elapsed_time: acc.elapsed_s,
                        },
                    )
                })
                .collect()
        })
        .collect();
    Json(data)
}

async fn pico_raw_data(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let pipeline = state.pipeline.lock().unwrap();
    let data = pipeline
        .kernel_list()
        .results()
        .iter()
        .map(|result| result.raw_trace())
        .collect();
    Json(data)
}

async fn pico_set_sample(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetSampleRequest>,
) -> Json<BoolResponse> {
    let Some(unit) = parse_time_unit(&req.unit) else {
        warn!("scope: unrecognized sample unit {:?}", req.unit);
        return Json(BoolResponse { success: false });
    };
    state.pipeline.lock().unwrap().set_sample(req.interval, unit);
    Json(BoolResponse { success: true })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc/pico.open", post(pico_open))
        .route("/rpc/pico.close", post(pico_close))
        .route("/rpc/pico.getScopeInfo", post(pico_get_scope_info))
        .route("/rpc/pico.channelInfo", post(pico_channel_info))
        .route("/rpc/pico.startStreaming", post(pico_start_streaming))
        .route("/rpc/pico.stopStreaming", post(pico_stop_streaming))
        .route("/rpc/pico.getValues", post(pico_get_values))
        .route("/rpc/pico.rawData", post(pico_raw_data))
        .route("/rpc/pico.setSample", post(pico_set_sample))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(15))),
        )
        .with_state(state)
}

/// Run the scope daemon's HTTP server until the process is terminated.
pub async fn run_server(config: Config) {
    let timeout = Duration::from_secs(config.server.request_timeout_s);
    let state = Arc::new(AppState::new(&config));
    let app = build_router(state).layer(tower::timeout::TimeoutLayer::new(timeout));
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    info!("scope daemon listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let toml = r#"
            [server]
            bind_address = "127.0.0.1"
            port = 0
            fifo_path = "/tmp/kernelmeter-scope-server-test.pipe"

            [rapl]
            [[rapl.sockets]]
            component_id = "socket0"
            lead_core_index = 0

            [timer]
            system_id = "wallclock0"

            [scope]
            parallel_port_address = 888
            pulse_threshold_mv = 3000.0

            [[scope.channels]]
            index = 0
            component_id = "pulse"
            coupling = "dc"
            voltage_range_mv = 5000
            enabled = true
            analog_offset_v = 0.0
            shunt_resistance_ohms = 1.0
            amplifier_gain = 1.0
            is_pulse_channel = true

            [[scope.channels]]
            index = 1
            component_id = "rail0"
            coupling = "dc"
            voltage_range_mv = 5000
            enabled = true
            analog_offset_v = 0.0
            shunt_resistance_ohms = 1.0
            amplifier_gain = 1.0
            is_pulse_channel = false
        "#;
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn pico_open_then_channel_info_reports_configured_channels() {
        let state = Arc::new(AppState::new(&test_config()));
        pico_open(State(state.clone())).await;
        let info = pico_channel_info(State(state)).await;
        assert_eq!(info.0.len(), 2);
        assert!(info.0.contains_key("rail0"));
    }

    #[tokio::test]
    async fn double_start_streaming_rejected() {
        let state = Arc::new(AppState::new(&test_config()));
        pico_open(State(state.clone())).await;
        let first = pico_start_streaming(State(state.clone())).await;
        let second = pico_start_streaming(State(state.clone())).await;
        assert!(first.0.success);
        assert!(!second.0.success);
        pico_stop_streaming(State(state)).await;
    }

    #[tokio::test]
    async fn stop_streaming_is_idempotent() {
        let state = Arc::new(AppState::new(&test_config()));
        let first = pico_stop_streaming(State(state.clone())).await;
        let second = pico_stop_streaming(State(state)).await;
        assert!(first.0.success);
        assert!(second.0.success);
    }

    #[tokio::test]
    async fn set_sample_rejects_unknown_unit() {
        let state = Arc::new(AppState::new(&test_config()));
        let result = pico_set_sample(
            State(state),
            Json(SetSampleRequest {
                interval: 1,
                unit: "fortnight".into(),
            }),
        )
        .await;
        assert!(!result.0.success);
    }

    #[tokio::test]
    async fn get_values_empty_before_any_streaming() {
        let state = Arc::new(AppState::new(&test_config()));
        let values = pico_get_values(State(state)).await;
        assert!(values.0.is_empty());
    }
}
