//! HTTP RPC surface for the rapl daemon: the socket-energy counter, the
//! wall-clock timer, and the marker demultiplexer that drives both (plus
//! the parallel-port pulse line the scope daemon detects independently).
//!
//! Each RPC method from the measurement contract is a `POST /rpc/<name>`
//! handler. [`AppState::new`] probes each source's hardware once at
//! startup (register files for rapl, the parallel port for the scope pulse
//! line), and [`build_router`] mounts a source's route group only when its
//! probe succeeded — there is no method that always 404s for an absent
//! source, it's simply never routed, matching the runtime-capability-set
//! redesign of the original compile-time feature gates. The arm handlers
//! also re-check the cached probe result before calling [`ArmState::arm`],
//! so a handler called directly (bypassing the router) still reports
//! `success: false` rather than a bogus arm.

use axum::{Json, Router, extract::State, routing::post};
use kernelmeter_core::config::Config;
use kernelmeter_core::marker::{ArmState, MarkerDemultiplexer};
use kernelmeter_core::pulse::{ParallelPortPulseEmitter, PulseEmitter};
use kernelmeter_core::register::RegisterSource;
use kernelmeter_core::socket::{Socket, SocketCounter};
use kernelmeter_core::timer::TimerCounter;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub struct AppState {
    socket: Arc<Mutex<SocketCounter>>,
    timer: Arc<Mutex<TimerCounter>>,
    pulse: Arc<Mutex<ParallelPortPulseEmitter>>,
    arm_state: Arc<ArmState>,
    fifo_path: String,
    demux_running: AtomicBool,
    /// Probed once at construction time; see the module doc.
    socket_available: bool,
    timer_available: bool,
    scope_available: bool,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let sockets = config
            .rapl
            .sockets
            .iter()
            .map(|s| Socket {
                component_id: s.component_id.clone(),
                lead_core_index: s.lead_core_index,
            })
            .collect();
        let registers: Box<dyn RegisterSource> =
            Box::new(kernelmeter_core::register::MsrRegisterSource::new());
        let socket = SocketCounter::new(sockets, registers);
        let socket_available = socket.is_available();

        let timer = TimerCounter::new(config.timer.system_id.clone());
        let timer_available = timer.is_available();

        let pulse = ParallelPortPulseEmitter::new(config.scope.parallel_port_address);
        let scope_available = pulse.probe();

        if !socket_available {
            warn!("rapl source: no configured socket register is readable, reporting unavailable");
        }
        if !scope_available {
            warn!("scope pulse line: parallel port is not writable, reporting unavailable");
        }

        Self {
            socket: Arc::new(Mutex::new(socket)),
            timer: Arc::new(Mutex::new(timer)),
            pulse: Arc::new(Mutex::new(pulse)),
            arm_state: Arc::new(ArmState::default()),
            fifo_path: config.server.fifo_path.clone(),
            demux_running: AtomicBool::new(false),
            socket_available,
            timer_available,
            scope_available,
        }
    }

    /// Arming the first source starts the demultiplexer on a background
    /// thread; it runs until every source is disarmed, then exits, so a
    /// later arm cycle spawns a fresh one.
    fn maybe_start_demux(self: &Arc<Self>) {
        if self.demux_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.clone();
        std::thread::spawn(move || {
            let demux = MarkerDemultiplexer::new(
                state.fifo_path.clone(),
                state.socket.clone(),
                state.timer.clone(),
                state.pulse.clone(),
                state.arm_state.clone(),
            );
            demux.run();
            state.demux_running.store(false, Ordering::SeqCst);
        });
    }

    /// Overrides the startup-probed availability flags. The real probes
    /// depend on hardware that's never present in a test sandbox (a
    /// readable MSR file, a writable parallel port), so tests that want to
    /// exercise the "hardware present" path inject the result directly,
    /// the same way [`SocketCounter::kernel_list_mut_for_test`] injects
    /// state that would otherwise require a live register source.
    #[doc(hidden)]
    pub fn override_availability_for_test(&mut self, socket: bool, timer: bool, scope: bool) {
        self.socket_available = socket;
        self.timer_available = timer;
        self.scope_available = scope;
    }
}

#[derive(Serialize)]
struct BoolResponse {
    success: bool,
}

#[derive(Serialize)]
struct RaplAccumulatorJson {
    energy: f64,
    #[serde(rename = "elapsedTime")]
    elapsed_time: f64,
}

#[derive(Serialize)]
struct TimerAccumulatorJson {
    #[serde(rename = "elapsedTime")]
    elapsed_time: f64,
}

async fn rapl_start_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    if !state.socket_available {
        warn!("rapl arm rejected: socket energy registers unavailable");
        return Json(BoolResponse { success: false });
    }
    let success = ArmState::arm(&state.arm_state.socket_armed);
    if success {
        state.socket.lock().unwrap().start_measurement();
        state.maybe_start_demux();
        info!("rapl source armed");
    }
    Json(BoolResponse { success })
}

async fn rapl_stop_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    let success = ArmState::disarm(&state.arm_state.socket_armed);
    Json(BoolResponse { success })
}

async fn rapl_get_measured_data(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<HashMap<String, RaplAccumulatorJson>>> {
    let counter = state.socket.lock().unwrap();
    let data = counter
        .kernel_list()
        .results()
        .iter()
        .map(|result| {
            result
                .iter()
                .map(|(socket_id, acc)| {
                    (
                        socket_id.clone(),
                        RaplAccumulatorJson {
                            energy: acc.energy_joules,
                            elapsed_time: acc.elapsed_ns as f64 / 1e9,
                        },
                    )
                })
                .collect()
        })
        .collect();
    Json(data)
}

async fn rapl_get_measured_processors(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.socket.lock().unwrap().component_ids())
}

async fn timer_start_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    if !state.timer_available {
        warn!("timer arm rejected: timer source unavailable");
        return Json(BoolResponse { success: false });
    }
    let success = ArmState::arm(&state.arm_state.timer_armed);
    if success {
        state.timer.lock().unwrap().start_measurement();
        state.maybe_start_demux();
        info!("timer source armed");
    }
    Json(BoolResponse { success })
}

async fn timer_stop_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    let success = ArmState::disarm(&state.arm_state.timer_armed);
    Json(BoolResponse { success })
}

async fn timer_get_measured_data(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<HashMap<String, TimerAccumulatorJson>>> {
    let timer = state.timer.lock().unwrap();
    let data = timer
        .kernel_list()
        .results()
        .iter()
        .map(|result| {
            result
                .iter()
                .map(|(id, elapsed)| (id.clone(), TimerAccumulatorJson { elapsed_time: *elapsed }))
                .collect()
        })
        .collect();
    Json(data)
}

async fn timer_get_measured_system_id(State(state): State<Arc<AppState>>) -> Json<String> {
    Json(state.timer.lock().unwrap().system_id().to_string())
}

async fn scope_start_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    if !state.scope_available {
        warn!("scope pulse line arm rejected: parallel port unavailable");
        return Json(BoolResponse { success: false });
    }
    let success = ArmState::arm(&state.arm_state.scope_armed);
    if success {
        state.maybe_start_demux();
        info!("scope pulse line armed");
    }
    Json(BoolResponse { success })
}

async fn scope_stop_listening(State(state): State<Arc<AppState>>) -> Json<BoolResponse> {
    let success = ArmState::disarm(&state.arm_state.scope_armed);
    Json(BoolResponse { success })
}

async fn rmeasure_get_measured_kernels(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let names = if state.arm_state.socket_armed.load(Ordering::SeqCst) {
        state.socket.lock().unwrap().kernel_list().names().to_vec()
    } else {
        state.timer.lock().unwrap().kernel_list().names().to_vec()
    };
    Json(names)
}

/// Mounts each source's route group only if [`AppState::new`]'s startup
/// probe found it available. `rmeasure.getMeasuredKernels` answers from
/// whichever source is armed and has no single hardware dependency of its
/// own, so it's always mounted.
fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route(
        "/rpc/rmeasure.getMeasuredKernels",
        post(rmeasure_get_measured_kernels),
    );

    if state.socket_available {
        router = router
            .route("/rpc/rapl.startListening", post(rapl_start_listening))
            .route("/rpc/rapl.stopListening", post(rapl_stop_listening))
            .route("/rpc/rapl.getMeasuredData", post(rapl_get_measured_data))
            .route(
                "/rpc/rapl.getMeasuredProcessors",
                post(rapl_get_measured_processors),
            );
    }

    if state.timer_available {
        router = router
            .route("/rpc/timer.startListening", post(timer_start_listening))
            .route("/rpc/timer.stopListening", post(timer_stop_listening))
            .route("/rpc/timer.getMeasuredData", post(timer_get_measured_data))
            .route(
                "/rpc/timer.getMeasuredSystemId",
                post(timer_get_measured_system_id),
            );
    }

    if state.scope_available {
        router = router
            .route("/rpc/scope.startListening", post(scope_start_listening))
            .route("/rpc/scope.stopListening", post(scope_stop_listening));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(15))),
        )
        .with_state(state)
}

/// Run the rapl daemon's HTTP server until the process is terminated.
pub async fn run_server(config: Config) {
    let timeout = Duration::from_secs(config.server.request_timeout_s);
    let state = Arc::new(AppState::new(&config));
    let app = build_router(state).layer(tower::timeout::TimeoutLayer::new(timeout));
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    info!("rapl daemon listening on {addr}");
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
            fifo_path = "/tmp/kernelmeter-rapl-server-test.pipe"

            [rapl]
            [[rapl.sockets]]
            component_id = "socket0"
            lead_core_index = 0

            [timer]
            system_id = "wallclock0"

            [scope]
            parallel_port_address = 888

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
        "#;
        toml::from_str(toml).unwrap()
    }

    /// Hardware is never present in a test sandbox; this is the shared
    /// fixture for tests exercising the "hardware present" arm path.
    fn state_with_hardware_available() -> Arc<AppState> {
        let mut state = AppState::new(&test_config());
        state.override_availability_for_test(true, true, true);
        Arc::new(state)
    }

    #[tokio::test]
    async fn double_arm_rejected() {
        let state = state_with_hardware_available();
        let first = rapl_start_listening(State(state.clone())).await;
        let second = rapl_start_listening(State(state)).await;
        assert!(first.0.success);
        assert!(!second.0.success);
    }

    #[tokio::test]
    async fn disarm_is_idempotent() {
        let state = state_with_hardware_available();
        let first = rapl_stop_listening(State(state.clone())).await;
        let second = rapl_stop_listening(State(state)).await;
        assert!(first.0.success);
        assert!(second.0.success);
    }

    #[tokio::test]
    async fn arming_rapl_clears_prior_kernel_list() {
        let state = state_with_hardware_available();
        state
            .socket
            .lock()
            .unwrap()
            .kernel_list_mut_for_test()
            .push("stale".into(), Default::default());
        rapl_start_listening(State(state.clone())).await;
        assert!(state.socket.lock().unwrap().kernel_list().is_empty());
    }

    #[tokio::test]
    async fn rapl_arm_rejected_when_hardware_unavailable() {
        // Real `AppState::new` in this sandbox probes a real MSR file that
        // doesn't exist, so the default-constructed state is already
        // hardware-unavailable without any override.
        let state = Arc::new(AppState::new(&test_config()));
        let result = rapl_start_listening(State(state.clone())).await;
        assert!(!result.0.success);
        assert!(!state.arm_state.socket_armed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timer_arm_rejected_when_unavailable_flag_overridden() {
        let mut state = AppState::new(&test_config());
        state.override_availability_for_test(true, false, true);
        let state = Arc::new(state);
        let result = timer_start_listening(State(state)).await;
        assert!(!result.0.success);
    }

    #[tokio::test]
    async fn scope_arm_rejected_when_parallel_port_unavailable() {
        // No test sandbox has /dev/port writable, so the real probe
        // already reports unavailable without an override.
        let state = Arc::new(AppState::new(&test_config()));
        let result = scope_start_listening(State(state.clone())).await;
        assert!(!result.0.success);
        assert!(!state.arm_state.scope_armed.load(Ordering::SeqCst));
    }
}
