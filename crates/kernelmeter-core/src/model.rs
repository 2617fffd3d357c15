//! Shared data model: descriptors, accumulators, and kernel result records.
//!
//! These types are deliberately source-agnostic — the same [`KernelList`]
//! shape backs the socket counter, the timer, and the scope pipeline, each
//! parameterized over a different accumulator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque, printable identifier for a demarcated code region.
pub type KernelName = String;

/// A physical socket: which hardware-description component it is, and which
/// logical CPU's register file addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketDescriptor {
    pub component_id: String,
    pub lead_core_index: u32,
}

/// An oscilloscope analog channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub index: u8,
    pub component_id: String,
    pub coupling: Coupling,
    pub voltage_range_mv: u32,
    pub enabled: bool,
    pub analog_offset_v: f64,
    pub shunt_resistance_ohms: f64,
    pub amplifier_gain: f64,
    pub is_pulse_channel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    Ac,
    Dc,
}

/// The most recent raw register reading and timestamp for one (kernel,
/// socket) pair, kept to diff against the next sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketSample {
    pub raw_joules: f64,
    pub timestamp_ns: u64,
}

/// Cumulative energy and elapsed time for one (kernel, socket) pair.
///
/// Invariant: both fields are non-decreasing across the samples that build
/// them up within a single kernel's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketAccumulator {
    pub energy_joules: f64,
    pub elapsed_ns: u64,
}

impl SocketAccumulator {
    pub fn average_power_watts(&self) -> f64 {
        if self.elapsed_ns == 0 {
            0.0
        } else {
            self.energy_joules / (self.elapsed_ns as f64 / 1e9)
        }
    }
}

/// Cumulative energy and power envelope for one (kernel, channel) pair.
///
/// `min_power_watts` starts at the sentinel `-1.0`, meaning "unset"; it is
/// replaced by the first real sample and thereafter only ever decreases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeAccumulator {
    pub energy_joules: f64,
    pub min_power_watts: f64,
    pub max_power_watts: f64,
    pub elapsed_s: f64,
}

impl Default for ScopeAccumulator {
    fn default() -> Self {
        Self {
            energy_joules: 0.0,
            min_power_watts: -1.0,
            max_power_watts: -1.0,
            elapsed_s: 0.0,
        }
    }
}

impl ScopeAccumulator {
    /// Fold one instantaneous power sample of duration `dt_s` into the
    /// accumulator, updating the min/max sentinel on the first sample.
    pub fn accumulate(&mut self, watts: f64, dt_s: f64) {
        self.elapsed_s += dt_s;
        self.energy_joules += watts * dt_s;
        if self.min_power_watts < 0.0 {
            self.min_power_watts = watts;
            self.max_power_watts = watts;
        } else {
            self.min_power_watts = self.min_power_watts.min(watts);
            self.max_power_watts = self.max_power_watts.max(watts);
        }
    }
}

/// One occurrence of a kernel as seen by the socket-energy source: a map
/// from socket to its accumulator at finalization.
pub type SocketKernelResult = BTreeMap<String, SocketAccumulator>;

/// One occurrence of a kernel as seen by the scope source: per-channel
/// accumulators plus the raw per-sample power trace, stored as chunks to
/// avoid repeated reallocation over a long-running kernel.
#[derive(Debug, Clone, Default)]
pub struct ScopeKernelResult {
    pub channels: BTreeMap<String, ScopeAccumulator>,
    pub raw_trace_chunks: Vec<String>,
}

impl ScopeKernelResult {
    pub fn raw_trace(&self) -> String {
        self.raw_trace_chunks.concat()
    }
}

/// One occurrence of a kernel as seen by the timer source: elapsed time
/// against the single configured system component, no energy term.
pub type TimerKernelResult = BTreeMap<String, f64>;

/// Ordered sequence of kernel occurrences, one entry per begin/end pair,
/// in arrival order. Duplicate kernel names are independent entries;
/// merging by name is a query-time fold (see the client's aggregation).
#[derive(Debug, Clone, Default)]
pub struct KernelList<R> {
    names: Vec<KernelName>,
    results: Vec<R>,
}

impl<R> KernelList<R> {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.results.clear();
    }

    pub fn push(&mut self, name: KernelName, result: R) {
        self.names.push(name);
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn names(&self) -> &[KernelName] {
        &self.names
    }

    pub fn results(&self) -> &[R] {
        &self.results
    }

    /// The in-flight (most recently begun) result, mutable, if any.
    pub fn last_mut(&mut self) -> Option<&mut R> {
        self.results.last_mut()
    }

    /// Remove the in-flight entry without freezing it (disarm mid-window).
    pub fn discard_last(&mut self) {
        self.names.pop();
        self.results.pop();
    }
}

/// Units in which the scope's sample interval is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Fs,
    Ps,
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    /// Denominator such that `1 unit = 1/divisor` seconds.
    pub fn divisor(self) -> f64 {
        match self {
            TimeUnit::Fs => 1e15,
            TimeUnit::Ps => 1e12,
            TimeUnit::Ns => 1e9,
            TimeUnit::Us => 1e6,
            TimeUnit::Ms => 1e3,
            TimeUnit::S => 1.0,
        }
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        TimeUnit::Ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- ScopeAccumulator ---

    #[test]
    fn scope_accumulator_starts_at_sentinel() {
        let acc = ScopeAccumulator::default();
        assert_eq!(acc.min_power_watts, -1.0);
        assert_eq!(acc.max_power_watts, -1.0);
        assert_eq!(acc.energy_joules, 0.0);
    }

    #[test]
    fn scope_accumulator_first_sample_sets_min_and_max() {
        let mut acc = ScopeAccumulator::default();
        acc.accumulate(5.0, 0.001);
        assert_eq!(acc.min_power_watts, 5.0);
        assert_eq!(acc.max_power_watts, 5.0);
    }

    #[test]
    fn scope_accumulator_tracks_envelope() {
        let mut acc = ScopeAccumulator::default();
        acc.accumulate(5.0, 0.001);
        acc.accumulate(2.0, 0.001);
        acc.accumulate(9.0, 0.001);
        assert_eq!(acc.min_power_watts, 2.0);
        assert_eq!(acc.max_power_watts, 9.0);
        assert!(acc.min_power_watts <= acc.max_power_watts);
    }

    // --- KernelList ---

    #[test]
    fn kernel_list_preserves_order_and_duplicates() {
        let mut list: KernelList<SocketKernelResult> = KernelList::new();
        list.push("k1".into(), SocketKernelResult::new());
        list.push("k1".into(), SocketKernelResult::new());
        assert_eq!(list.len(), 2);
        assert_eq!(list.names(), &["k1".to_string(), "k1".to_string()]);
    }

    #[test]
    fn kernel_list_discard_last_removes_in_flight_entry() {
        let mut list: KernelList<SocketKernelResult> = KernelList::new();
        list.push("k1".into(), SocketKernelResult::new());
        list.discard_last();
        assert!(list.is_empty());
    }

    #[test]
    fn kernel_list_clear_resets_on_rearm() {
        let mut list: KernelList<SocketKernelResult> = KernelList::new();
        list.push("k1".into(), SocketKernelResult::new());
        list.clear();
        assert!(list.is_empty());
    }

    // --- TimeUnit ---

    #[test]
    fn time_unit_divisors_match_seconds_denominator() {
        assert_eq!(TimeUnit::S.divisor(), 1.0);
        assert_eq!(TimeUnit::Ms.divisor(), 1e3);
        assert_eq!(TimeUnit::Us.divisor(), 1e6);
        assert_eq!(TimeUnit::Ns.divisor(), 1e9);
        assert_eq!(TimeUnit::Ps.divisor(), 1e12);
        assert_eq!(TimeUnit::Fs.divisor(), 1e15);
    }
}
