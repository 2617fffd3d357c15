//! Blocking RPC client for the rapl and scope measurement daemons.
//!
//! This is the measurement counterpart of a launcher: it arms sources,
//! waits for the instrumented application to run, disarms, and fetches
//! results. The two daemons never talk to each other, so this client is
//! the only component that ever looks at both result sets together — it
//! zips the scope and socket kernel lists against the shared name list
//! positionally, and folds duplicate kernel-name occurrences at query
//! time rather than at capture time.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} is not set")]
    MissingEnvVar(&'static str),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaplAccumulator {
    pub energy: f64,
    #[serde(rename = "elapsedTime")]
    pub elapsed_time: f64,
}

impl RaplAccumulator {
    pub fn average_power_watts(&self) -> f64 {
        if self.elapsed_time == 0.0 {
            0.0
        } else {
            self.energy / self.elapsed_time
        }
    }

    fn zero() -> Self {
        Self {
            energy: 0.0,
            elapsed_time: 0.0,
        }
    }

    fn add(&self, other: &Self) -> Self {
        Self {
            energy: self.energy + other.energy,
            elapsed_time: self.elapsed_time + other.elapsed_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerAccumulator {
    #[serde(rename = "elapsedTime")]
    pub elapsed_time: f64,
}

impl TimerAccumulator {
    fn zero() -> Self {
        Self { elapsed_time: 0.0 }
    }

    fn add(&self, other: &Self) -> Self {
        Self {
            elapsed_time: self.elapsed_time + other.elapsed_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeAccumulator {
    pub energy: f64,
    #[serde(rename = "minPower")]
    pub min_power: f64,
    #[serde(rename = "maxPower")]
    pub max_power: f64,
    #[serde(rename = "elapsedTime")]
    pub elapsed_time: f64,
}

impl ScopeAccumulator {
    fn zero() -> Self {
        Self {
            energy: 0.0,
            min_power: -1.0,
            max_power: -1.0,
            elapsed_time: 0.0,
        }
    }

    /// Element-wise sum: energy and elapsed add, min/max widen the
    /// envelope, honoring the `-1.0` "unset" sentinel on either side.
    fn add(&self, other: &Self) -> Self {
        let (min_power, max_power) = match (self.min_power < 0.0, other.min_power < 0.0) {
            (true, true) => (-1.0, -1.0),
            (true, false) => (other.min_power, other.max_power),
            (false, true) => (self.min_power, self.max_power),
            (false, false) => (
                self.min_power.min(other.min_power),
                self.max_power.max(other.max_power),
            ),
        };
        Self {
            energy: self.energy + other.energy,
            min_power,
            max_power,
            elapsed_time: self.elapsed_time + other.elapsed_time,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeInfo {
    #[serde(rename = "driverVersion")]
    pub driver_version: String,
    #[serde(rename = "usbVersion")]
    pub usb_version: String,
    #[serde(rename = "hardwareVersion")]
    pub hardware_version: String,
    #[serde(rename = "variantNumber")]
    pub variant_number: String,
    #[serde(rename = "batchAndSerial")]
    pub batch_and_serial: String,
    #[serde(rename = "calibrationDate")]
    pub calibration_date: String,
    #[serde(rename = "kernelVersion")]
    pub kernel_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub coupling: u8,
    pub range: u32,
    #[serde(rename = "isEnabled")]
    pub is_enabled: bool,
    #[serde(rename = "analogOffset")]
    pub analog_offset: f64,
    pub resistance: f64,
    #[serde(rename = "isParport")]
    pub is_parport: bool,
}

#[derive(Debug, Serialize)]
struct SetSampleRequest<'a> {
    interval: u32,
    unit: &'a str,
}

#[derive(Debug, Deserialize)]
struct BoolResponse {
    success: bool,
}

/// One occurrence of a kernel, joined positionally from both daemons'
/// result arrays against the shared name list.
#[derive(Debug, Clone)]
pub struct KernelOccurrence {
    pub name: String,
    pub sockets: HashMap<String, RaplAccumulator>,
    pub scope_channels: HashMap<String, ScopeAccumulator>,
}

/// The full measurement snapshot for one arm/disarm cycle: the in-order
/// kernel names, and every source's data joined against them.
#[derive(Debug, Clone, Default)]
pub struct MeasurementResults {
    pub occurrences: Vec<KernelOccurrence>,
}

impl MeasurementResults {
    /// Element-wise sum of every occurrence whose name matches `name` —
    /// the query-time fold that replaces merging duplicate kernel names
    /// at capture time.
    pub fn aggregated_sources(&self, name: &str) -> AggregatedKernel {
        let mut sockets: HashMap<String, RaplAccumulator> = HashMap::new();
        let mut scope_channels: HashMap<String, ScopeAccumulator> = HashMap::new();
        let mut occurrence_count = 0usize;

        for occurrence in self.occurrences.iter().filter(|o| o.name == name) {
            occurrence_count += 1;
            for (id, acc) in &occurrence.sockets {
                let entry = sockets.entry(id.clone()).or_insert_with(RaplAccumulator::zero);
                *entry = entry.add(acc);
            }
            for (id, acc) in &occurrence.scope_channels {
                let entry = scope_channels
                    .entry(id.clone())
                    .or_insert_with(ScopeAccumulator::zero);
                *entry = entry.add(acc);
            }
        }

        AggregatedKernel {
            name: name.to_string(),
            occurrence_count,
            sockets,
            scope_channels,
        }
    }
}

/// The element-wise sum of all occurrences of one kernel name.
#[derive(Debug, Clone)]
pub struct AggregatedKernel {
    pub name: String,
    pub occurrence_count: usize,
    pub sockets: HashMap<String, RaplAccumulator>,
    pub scope_channels: HashMap<String, ScopeAccumulator>,
}

/// Blocking client for both daemons' RPC surfaces.
pub struct MeasurementClient {
    rapl_base: String,
    scope_base: String,
    http: reqwest::blocking::Client,
}

impl MeasurementClient {
    pub fn new(rapl_base: impl Into<String>, scope_base: impl Into<String>) -> Self {
        Self {
            rapl_base: rapl_base.into(),
            scope_base: scope_base.into(),
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Read `RMEASURE_SERVICE_URL` and `SCOPE_CONTROL_SERVICE_URL`.
    pub fn from_env() -> Result<Self> {
        let rapl_base = std::env::var("RMEASURE_SERVICE_URL")
            .map_err(|_| ClientError::MissingEnvVar("RMEASURE_SERVICE_URL"))?;
        let scope_base = std::env::var("SCOPE_CONTROL_SERVICE_URL")
            .map_err(|_| ClientError::MissingEnvVar("SCOPE_CONTROL_SERVICE_URL"))?;
        Ok(Self::new(rapl_base, scope_base))
    }

    fn call<T: for<'de> Deserialize<'de>>(&self, base: &str, method: &str) -> Result<T> {
        self.call_with_body(base, method, &serde_json::json!({}))
    }

    fn call_with_body<T: for<'de> Deserialize<'de>>(
        &self,
        base: &str,
        method: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let url = format!("{base}/rpc/{method}");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(|source| ClientError::Request {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(ClientError::UnexpectedStatus {
                url,
                status: response.status(),
            });
        }
        response.json().map_err(|source| ClientError::Request { url, source })
    }

    // --- rapl daemon: socket energy ---

    pub fn rapl_start_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "rapl.startListening")?.success)
    }

    pub fn rapl_stop_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "rapl.stopListening")?.success)
    }

    pub fn rapl_get_measured_data(&self) -> Result<Vec<HashMap<String, RaplAccumulator>>> {
        self.call(&self.rapl_base, "rapl.getMeasuredData")
    }

    pub fn rapl_get_measured_processors(&self) -> Result<Vec<String>> {
        self.call(&self.rapl_base, "rapl.getMeasuredProcessors")
    }

    // --- rapl daemon: wall-clock timer ---

    pub fn timer_start_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "timer.startListening")?.success)
    }

    pub fn timer_stop_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "timer.stopListening")?.success)
    }

    pub fn timer_get_measured_data(&self) -> Result<Vec<HashMap<String, TimerAccumulator>>> {
        self.call(&self.rapl_base, "timer.getMeasuredData")
    }

    pub fn timer_get_measured_system_id(&self) -> Result<String> {
        self.call(&self.rapl_base, "timer.getMeasuredSystemId")
    }

    // --- rapl daemon: scope pulse-line arm (not the scope device itself) ---

    pub fn scope_start_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "scope.startListening")?.success)
    }

    pub fn scope_stop_listening(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.rapl_base, "scope.stopListening")?.success)
    }

    pub fn rmeasure_get_measured_kernels(&self) -> Result<Vec<String>> {
        self.call(&self.rapl_base, "rmeasure.getMeasuredKernels")
    }

    // --- scope daemon: oscilloscope handle ---

    pub fn pico_open(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.scope_base, "pico.open")?.success)
    }

    pub fn pico_close(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.scope_base, "pico.close")?.success)
    }

    pub fn pico_get_scope_info(&self) -> Result<ScopeInfo> {
        self.call(&self.scope_base, "pico.getScopeInfo")
    }

    pub fn pico_channel_info(&self) -> Result<HashMap<String, ChannelInfo>> {
        self.call(&self.scope_base, "pico.channelInfo")
    }

    pub fn pico_start_streaming(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.scope_base, "pico.startStreaming")?.success)
    }

    pub fn pico_stop_streaming(&self) -> Result<bool> {
        Ok(self.call::<BoolResponse>(&self.scope_base, "pico.stopStreaming")?.success)
    }

    pub fn pico_get_values(&self) -> Result<Vec<HashMap<String, ScopeAccumulator>>> {
        self.call(&self.scope_base, "pico.getValues")
    }

    pub fn pico_raw_data(&self) -> Result<Vec<String>> {
        self.call(&self.scope_base, "pico.rawData")
    }

    pub fn pico_set_sample(&self, interval: u32, unit: &str) -> Result<bool> {
        let body = SetSampleRequest { interval, unit };
        Ok(self
            .call_with_body::<BoolResponse>(&self.scope_base, "pico.setSample", &body)?
            .success)
    }

    /// Fetch the kernel-name list plus every source's per-kernel data and
    /// zip them positionally via [`zip_positional`].
    pub fn fetch_results(&self) -> Result<MeasurementResults> {
        let names = self.rmeasure_get_measured_kernels()?;
        let sockets = self.rapl_get_measured_data().unwrap_or_default();
        let scope = self.pico_get_values().unwrap_or_default();
        Ok(MeasurementResults {
            occurrences: zip_positional(&names, sockets, scope),
        })
    }
}

/// Zip a kernel-name list against each source's per-kernel data positionally.
/// If the scope and socket arrays differ in length from the name list, the
/// mismatched tail is dropped and logged rather than panicking or silently
/// misaligning the data. An empty source array (the source wasn't armed) is
/// not treated as a mismatch — every occurrence just gets an empty map for
/// that source.
fn zip_positional(
    names: &[String],
    sockets: Vec<HashMap<String, RaplAccumulator>>,
    scope: Vec<HashMap<String, ScopeAccumulator>>,
) -> Vec<KernelOccurrence> {
    let mut len = names.len();
    if !sockets.is_empty() {
        len = len.min(sockets.len());
    }
    if !scope.is_empty() {
        len = len.min(scope.len());
    }

    if sockets.len() != names.len() && !sockets.is_empty() {
        warn!(
            "rapl kernel count {} does not match name list length {}; dropping mismatched tail",
            sockets.len(),
            names.len()
        );
    }
    if scope.len() != names.len() && !scope.is_empty() {
        warn!(
            "scope kernel count {} does not match name list length {}; dropping mismatched tail",
            scope.len(),
            names.len()
        );
    }

    (0..len)
        .map(|i| KernelOccurrence {
            name: names[i].clone(),
            sockets: sockets.get(i).cloned().unwrap_or_default(),
            scope_channels: scope.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rapl_accumulator_average_power_divides_energy_by_elapsed() {
        let acc = RaplAccumulator {
            energy: 10.0,
            elapsed_time: 2.0,
        };
        assert_eq!(acc.average_power_watts(), 5.0);
    }

    #[test]
    fn rapl_accumulator_average_power_zero_when_no_elapsed_time() {
        let acc = RaplAccumulator {
            energy: 10.0,
            elapsed_time: 0.0,
        };
        assert_eq!(acc.average_power_watts(), 0.0);
    }

    #[test]
    fn scope_accumulator_add_widens_envelope() {
        let a = ScopeAccumulator {
            energy: 1.0,
            min_power: 2.0,
            max_power: 5.0,
            elapsed_time: 0.1,
        };
        let b = ScopeAccumulator {
            energy: 1.0,
            min_power: 1.0,
            max_power: 6.0,
            elapsed_time: 0.1,
        };
        let sum = a.add(&b);
        assert_eq!(sum.min_power, 1.0);
        assert_eq!(sum.max_power, 6.0);
        assert_eq!(sum.energy, 2.0);
    }

    #[test]
    fn scope_accumulator_add_respects_unset_sentinel() {
        let unset = ScopeAccumulator::zero();
        let set = ScopeAccumulator {
            energy: 3.0,
            min_power: 2.0,
            max_power: 4.0,
            elapsed_time: 0.2,
        };
        let sum = unset.add(&set);
        assert_eq!(sum.min_power, 2.0);
        assert_eq!(sum.max_power, 4.0);
    }

    fn occurrence(name: &str, socket_energy: f64, socket_elapsed: f64) -> KernelOccurrence {
        let mut sockets = HashMap::new();
        sockets.insert(
            "socket0".to_string(),
            RaplAccumulator {
                energy: socket_energy,
                elapsed_time: socket_elapsed,
            },
        );
        KernelOccurrence {
            name: name.to_string(),
            sockets,
            scope_channels: HashMap::new(),
        }
    }

    #[test]
    fn aggregated_sources_sums_all_occurrences_of_same_name() {
        let results = MeasurementResults {
            occurrences: vec![
                occurrence("k1", 3.0, 1.0),
                occurrence("other", 100.0, 100.0),
                occurrence("k1", 4.0, 1.0),
            ],
        };
        let agg = results.aggregated_sources("k1");
        assert_eq!(agg.occurrence_count, 2);
        assert_eq!(agg.sockets["socket0"].energy, 7.0);
        assert_eq!(agg.sockets["socket0"].elapsed_time, 2.0);
    }

    #[test]
    fn aggregated_sources_empty_for_unknown_name() {
        let results = MeasurementResults {
            occurrences: vec![occurrence("k1", 3.0, 1.0)],
        };
        let agg = results.aggregated_sources("nope");
        assert_eq!(agg.occurrence_count, 0);
        assert!(agg.sockets.is_empty());
    }

    // --- zip_positional ---

    fn rapl_map(energy: f64) -> HashMap<String, RaplAccumulator> {
        let mut map = HashMap::new();
        map.insert(
            "socket0".to_string(),
            RaplAccumulator {
                energy,
                elapsed_time: 1.0,
            },
        );
        map
    }

    fn scope_map(energy: f64) -> HashMap<String, ScopeAccumulator> {
        let mut map = HashMap::new();
        map.insert(
            "rail0".to_string(),
            ScopeAccumulator {
                energy,
                min_power: 1.0,
                max_power: 2.0,
                elapsed_time: 1.0,
            },
        );
        map
    }

    #[test]
    fn zip_positional_equal_lengths_yields_complete_mapping() {
        let names = vec!["k1".to_string(), "k2".to_string()];
        let sockets = vec![rapl_map(1.0), rapl_map(2.0)];
        let scope = vec![scope_map(10.0), scope_map(20.0)];

        let occurrences = zip_positional(&names, sockets, scope);

        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].name, "k1");
        assert_eq!(occurrences[0].sockets["socket0"].energy, 1.0);
        assert_eq!(occurrences[0].scope_channels["rail0"].energy, 10.0);
        assert_eq!(occurrences[1].name, "k2");
        assert_eq!(occurrences[1].sockets["socket0"].energy, 2.0);
        assert_eq!(occurrences[1].scope_channels["rail0"].energy, 20.0);
    }

    #[test]
    fn zip_positional_drops_mismatched_socket_tail() {
        let names = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let sockets = vec![rapl_map(1.0), rapl_map(2.0)]; // one short
        let scope = vec![scope_map(10.0), scope_map(20.0), scope_map(30.0)];

        let occurrences = zip_positional(&names, sockets, scope);

        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0].name, "k1");
        assert_eq!(occurrences[1].name, "k2");
    }

    #[test]
    fn zip_positional_drops_mismatched_scope_tail() {
        let names = vec!["k1".to_string(), "k2".to_string()];
        let sockets = vec![rapl_map(1.0), rapl_map(2.0)];
        let scope = vec![scope_map(10.0)]; // one short

        let occurrences = zip_positional(&names, sockets, scope);

        assert_eq!(occurrences.len(), 1);
        assert_eq!(occurrences[0].name, "k1");
        assert_eq!(occurrences[0].scope_channels["rail0"].energy, 10.0);
    }

    #[test]
    fn zip_positional_empty_source_array_is_not_a_mismatch() {
        let names = vec!["k1".to_string()];
        let sockets = vec![rapl_map(1.0)];
        let scope = Vec::new(); // scope source never armed

        let occurrences = zip_positional(&names, sockets, scope);

        assert_eq!(occurrences.len(), 1);
        assert!(occurrences[0].scope_channels.is_empty());
    }

    #[test]
    fn from_env_reports_missing_var() {
        // SAFETY: test-only process-wide env mutation, no other test reads this var.
        unsafe {
            std::env::remove_var("RMEASURE_SERVICE_URL");
        }
        let err = MeasurementClient::from_env().unwrap_err();
        assert!(matches!(err, ClientError::MissingEnvVar("RMEASURE_SERVICE_URL")));
    }
}
