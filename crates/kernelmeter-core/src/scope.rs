//! Oscilloscope streaming pipeline.
//!
//! Runs the scope in continuous streaming mode and segments the sample
//! stream into per-kernel windows purely by thresholding the pulse
//! channel — this component never receives a begin/end call directly; it
//! infers kernel boundaries from the physical pulse wire the marker
//! demultiplexer drives (see [`crate::marker`]).

use crate::model::{ChannelDescriptor, KernelList, ScopeKernelResult, TimeUnit};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MAX_ADC: i32 = 32767;
const BUFFER_SIZE: usize = 1_000_000;
const V_SUPPLY: f64 = 12.0;

/// The only device variant with fully characterized default ranges; any
/// other reported variant still works but logs a fallback warning on open.
pub const SUPPORTED_VARIANT: &str = "PS4000A";

/// Raw 16-bit ADC value for one channel at one sample index.
pub type RawSample = i16;

/// Convert a raw ADC reading to millivolts given the channel's configured
/// voltage range. Values at or above [`MAX_ADC`] are clamped (and the
/// caller is expected to log that once, not on every sample).
pub fn raw_to_millivolts(raw: RawSample, range_mv: u32) -> f64 {
    let clamped = (raw as i32).min(MAX_ADC);
    (clamped as f64) * (range_mv as f64) / (MAX_ADC as f64)
}

/// A contiguous block of fresh samples delivered by one poll, across all
/// enabled channels, using the min-aggregate buffer (see the open question
/// in the design notes about the unused max buffer).
pub struct StreamingBlock {
    pub start_index: usize,
    pub count: usize,
    /// channel index -> min-aggregate buffer for this block
    pub min_values: std::collections::HashMap<u8, Vec<RawSample>>,
    pub autostop: bool,
}

/// Abstraction over the vendor scope SDK: open/close, static info,
/// per-channel configuration, and the streaming poll loop's data delivery.
pub trait ScopeDevice: Send {
    fn open(&mut self) -> crate::error::Result<()>;
    fn close(&mut self) -> crate::error::Result<()>;
    fn device_variant(&self) -> String;
    fn configure_channel(&mut self, channel: &ChannelDescriptor) -> crate::error::Result<()>;
    fn start_streaming(&mut self, interval: u32, unit: TimeUnit) -> crate::error::Result<()>;
    fn stop_streaming(&mut self) -> crate::error::Result<()>;
    /// Block until the next poll tick (or autostop), returning the latest
    /// block of fresh samples. Returns `None` once streaming has stopped.
    fn poll(&mut self) -> Option<StreamingBlock>;

    /// Hardware-availability check consulted at arm time, ahead of
    /// [`Self::open`]. Default is `true`; a real vendor device would
    /// enumerate attached units here.
    fn probe(&self) -> bool {
        true
    }
}

/// State threaded through the streaming loop's window-segmentation state
/// machine; kept separate from [`ScopeDevice`] so the loop logic is
/// testable against a scripted sequence of blocks.
pub struct ScopePipeline<D: ScopeDevice> {
    device: D,
    channels: Vec<ChannelDescriptor>,
    sample_interval: u32,
    time_unit: TimeUnit,
    pulse_threshold_mv: f64,
    kernel_list: KernelList<ScopeKernelResult>,
    in_flight: Option<ScopeKernelResult>,
    was_in_kernel: bool,
    streaming: Arc<AtomicBool>,
}

impl<D: ScopeDevice> ScopePipeline<D> {
    pub fn new(device: D, channels: Vec<ChannelDescriptor>, pulse_threshold_mv: f64) -> Self {
        Self {
            device,
            channels,
            sample_interval: 1,
            time_unit: TimeUnit::Ms,
            pulse_threshold_mv,
            kernel_list: KernelList::new(),
            in_flight: None,
            was_in_kernel: false,
            streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_sample(&mut self, interval: u32, unit: TimeUnit) {
        self.sample_interval = interval;
        self.time_unit = unit;
    }

    pub fn kernel_list(&self) -> &KernelList<ScopeKernelResult> {
        &self.kernel_list
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Hardware-availability check consulted at arm time, before
    /// [`Self::open`]/[`Self::start_streaming`].
    pub fn is_available(&self) -> bool {
        self.device.probe()
    }

    /// A clone of the atomic streaming flag, so callers can signal a stop
    /// without taking the pipeline's mutex — the background poll loop holds
    /// that mutex for the duration of [`Self::run_streaming_loop`], so
    /// disarming has to flip this from the outside rather than calling
    /// [`Self::stop_streaming`] directly.
    pub fn streaming_flag(&self) -> Arc<AtomicBool> {
        self.streaming.clone()
    }

    pub fn start_measurement(&mut self) {
        self.kernel_list.clear();
        self.in_flight = None;
        self.was_in_kernel = false;
    }

    fn pulse_channel(&self) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|c| c.is_pulse_channel)
    }

    pub fn open(&mut self) -> crate::error::Result<()> {
        self.device.open()?;
        let variant = self.device.device_variant();
        if variant != SUPPORTED_VARIANT {
            warn!(
                "scope device variant {variant:?} is not the fully-supported {SUPPORTED_VARIANT:?}; \
                 falling back to configured channel ranges as given"
            );
        } else {
            info!("scope device variant: {variant}");
        }
        for channel in &self.channels {
            self.device.configure_channel(channel)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> crate::error::Result<()> {
        self.device.close()
    }

    pub fn start_streaming(&mut self) -> crate::error::Result<()> {
        self.streaming.store(true, Ordering::SeqCst);
        self.device.start_streaming(self.sample_interval, self.time_unit)
    }

    /// Disarm: stop the device and discard any in-flight window.
    pub fn stop_streaming(&mut self) -> crate::error::Result<()> {
        self.streaming.store(false, Ordering::SeqCst);
        self.in_flight = None;
        self.was_in_kernel = false;
        self.device.stop_streaming()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Run the 1 Hz poll loop until autostop or [`Self::stop_streaming`] is
    /// called from another thread sharing the same streaming flag.
    pub fn run_streaming_loop(&mut self) {
        while self.streaming.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            let Some(block) = self.device.poll() else {
                break;
            };
            self.process_block(&block);
            if block.autostop {
                self.streaming.store(false, Ordering::SeqCst);
                break;
            }
        }
        // A disarm that landed mid-window discards the in-flight record
        // rather than ever appending it.
        self.in_flight = None;
        self.was_in_kernel = false;
        let _ = self.device.stop_streaming();
    }

    fn dt_seconds(&self) -> f64 {
        self.sample_interval as f64 / self.time_unit.divisor()
    }

    /// Segment one delivered block into kernel windows. Exposed separately
    /// from [`Self::run_streaming_loop`] so the state machine can be
    /// driven deterministically in tests.
    pub fn process_block(&mut self, block: &StreamingBlock) {
        let Some(pulse) = self.pulse_channel().cloned() else {
            warn!("scope: no pulse channel configured, cannot segment kernels");
            return;
        };
        let Some(pulse_values) = block.min_values.get(&pulse.index) else {
            warn!("scope: pulse channel {} missing from block", pulse.index);
            return;
        };

        let dt = self.dt_seconds();

        for i in 0..block.count {
            let raw = pulse_values.get(i).copied().unwrap_or(0);
            let mv = raw_to_millivolts(raw, pulse.voltage_range_mv);
            let is_in_kernel = mv > self.pulse_threshold_mv;

            match (self.was_in_kernel, is_in_kernel) {
                (false, true) => {
                    let mut fresh = ScopeKernelResult::default();
                    for channel in &self.channels {
                        if channel.enabled && !channel.is_pulse_channel {
                            fresh
                                .channels
                                .insert(channel.component_id.clone(), Default::default());
                        }
                    }
                    self.in_flight = Some(fresh);
                }
                (true, false) => {
                    if let Some(result) = self.in_flight.take() {
                        self.kernel_list.push(String::new(), result);
                    }
                }
                (true, true) => {
                    if let Some(result) = self.in_flight.as_mut() {
                        for channel in &self.channels {
                            if !channel.enabled || channel.is_pulse_channel {
                                continue;
                            }
                            let values = match block.min_values.get(&channel.index) {
                                Some(v) => v,
                                None => continue,
                            };
                            let raw = values.get(i).copied().unwrap_or(0);
                            let mv = raw_to_millivolts(raw, channel.voltage_range_mv);
                            let watts = (mv / channel.amplifier_gain / 1000.0)
                                / channel.shunt_resistance_ohms
                                * V_SUPPLY;
                            if let Some(acc) = result.channels.get_mut(&channel.component_id) {
                                acc.accumulate(watts, dt);
                            }
                            result
                                .raw_trace_chunks
                                .push(format!("{watts};"));
                        }
                    }
                }
                (false, false) => {}
            }

            self.was_in_kernel = is_in_kernel;
        }
    }
}

/// Publishes `(start_index, count, autostop)` onto a single-slot channel,
/// replacing the vendor callback's global mutable flags
/// (`g_ready`/`g_sampleCount`/`g_startIndex`/`g_autoStop`).
pub struct StreamingHandoff {
    sender: Sender<StreamingBlock>,
}

impl StreamingHandoff {
    pub fn channel() -> (Self, Receiver<StreamingBlock>) {
        let (tx, rx) = mpsc::channel();
        (Self { sender: tx }, rx)
    }

    pub fn publish(&self, block: StreamingBlock) -> Result<(), mpsc::SendError<StreamingBlock>> {
        self.sender.send(block)
    }
}

/// Drains whatever is currently queued without blocking, matching the
/// original's "non-blocking check, then process if ready" poll shape.
pub fn try_take_latest(rx: &Receiver<StreamingBlock>) -> Option<StreamingBlock> {
    match rx.try_recv() {
        Ok(block) => Some(block),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
}

/// In-memory scope used in tests and wherever no vendor hardware is
/// attached: replays a scripted sequence of pulse/channel readings.
pub struct SimulatedScopeDevice {
    blocks: std::collections::VecDeque<StreamingBlock>,
    opened: bool,
}

impl SimulatedScopeDevice {
    pub fn new(blocks: Vec<StreamingBlock>) -> Self {
        Self {
            blocks: blocks.into(),
            opened: false,
        }
    }
}

impl ScopeDevice for SimulatedScopeDevice {
    fn open(&mut self) -> crate::error::Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> crate::error::Result<()> {
        self.opened = false;
        Ok(())
    }

    fn device_variant(&self) -> String {
        "simulated".to_string()
    }

    fn configure_channel(&mut self, _channel: &ChannelDescriptor) -> crate::error::Result<()> {
        Ok(())
    }

    fn start_streaming(&mut self, _interval: u32, _unit: TimeUnit) -> crate::error::Result<()> {
        Ok(())
    }

    fn stop_streaming(&mut self) -> crate::error::Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Option<StreamingBlock> {
        self.blocks.pop_front()
    }
}

#[allow(dead_code)]
fn _buffer_size_hint() -> usize {
    BUFFER_SIZE
}

/// Static, per-device information surfaced by `pico.getScopeInfo`. Real
/// hardware would read these strings off the unit at `open()`; this
/// rendition has no vendor SDK to query (see the Non-goals), so the
/// waveform-generating device below reports fixed placeholder strings.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub driver_version: String,
    pub usb_version: String,
    pub hardware_version: String,
    pub variant: String,
    pub batch_and_serial: String,
    pub calibration_date: String,
    pub kernel_version: String,
}

/// A [`ScopeDevice`] that generates a synthetic square-wave pulse and a
/// steady per-channel power signal instead of talking to vendor hardware —
/// this crate deliberately carries no PicoScope SDK linkage. Used as the
/// scope daemon's device when no other backend is wired in, and in any
/// hardware-free demo or integration test that wants a believable stream
/// rather than a hand-scripted block sequence.
pub struct WaveformScopeDevice {
    info: DeviceInfo,
    channels: Vec<ChannelDescriptor>,
    opened: bool,
    streaming: bool,
    half_period_samples: usize,
    samples_per_poll: usize,
    next_index: usize,
    elapsed_phase: usize,
}

impl WaveformScopeDevice {
    /// `half_period_samples` is how many samples the pulse channel holds
    /// high (and then low) before flipping, producing one kernel window
    /// every full period. `samples_per_poll` mimics the block size the
    /// device hands back on each 1 Hz poll.
    pub fn new(half_period_samples: usize, samples_per_poll: usize) -> Self {
        Self {
            info: DeviceInfo {
                driver_version: "0.0.0-simulated".into(),
                usb_version: "3.0".into(),
                hardware_version: "1".into(),
                variant: SUPPORTED_VARIANT.into(),
                batch_and_serial: "SIMULATED/0001".into(),
                calibration_date: "2020-01-01".into(),
                kernel_version: "1".into(),
            },
            channels: Vec::new(),
            opened: false,
            streaming: false,
            half_period_samples: half_period_samples.max(1),
            samples_per_poll,
            next_index: 0,
            elapsed_phase: 0,
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    fn is_high_phase(&self, sample_offset: usize) -> bool {
        let phase = (self.elapsed_phase + sample_offset) / self.half_period_samples;
        phase % 2 == 1
    }
}

impl ScopeDevice for WaveformScopeDevice {
    fn open(&mut self) -> crate::error::Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> crate::error::Result<()> {
        self.opened = false;
        self.streaming = false;
        Ok(())
    }

    fn device_variant(&self) -> String {
        self.info.variant.clone()
    }

    fn configure_channel(&mut self, channel: &ChannelDescriptor) -> crate::error::Result<()> {
        self.channels.retain(|c| c.index != channel.index);
        self.channels.push(channel.clone());
        Ok(())
    }

    fn start_streaming(&mut self, _interval: u32, _unit: TimeUnit) -> crate::error::Result<()> {
        if !self.opened {
            return Err(crate::error::Error::ScopeUnavailable(
                "device not open".into(),
            ));
        }
        self.streaming = true;
        self.next_index = 0;
        self.elapsed_phase = 0;
        Ok(())
    }

    fn stop_streaming(&mut self) -> crate::error::Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn poll(&mut self) -> Option<StreamingBlock> {
        if !self.streaming {
            return None;
        }
        let count = self.samples_per_poll;
        let mut min_values = std::collections::HashMap::new();
        for channel in &self.channels {
            if !channel.enabled {
                continue;
            }
            let values: Vec<RawSample> = (0..count)
                .map(|i| {
                    if channel.is_pulse_channel {
                        if self.is_high_phase(i) {
                            (MAX_ADC as f64 * 0.8) as RawSample
                        } else {
                            0
                        }
                    } else {
                        (MAX_ADC as f64 * 0.2) as RawSample
                    }
                })
                .collect();
            min_values.insert(channel.index, values);
        }
        let block = StreamingBlock {
            start_index: self.next_index,
            count,
            min_values,
            autostop: false,
        };
        self.next_index += count;
        self.elapsed_phase += count;
        Some(block)
    }
}
