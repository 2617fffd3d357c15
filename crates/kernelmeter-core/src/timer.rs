//! Wall-clock timer source.
//!
//! Shares the demultiplexer's begin/end/refresh cadence but records only
//! elapsed time against a single configured system component — no energy
//! term, and no register access of its own.

use crate::model::{KernelList, TimerKernelResult};
use std::time::Instant;

pub struct TimerCounter {
    system_id: String,
    kernel_list: KernelList<TimerKernelResult>,
    last_timestamp_ns: Option<u64>,
    clock: Instant,
}

impl TimerCounter {
    pub fn new(system_id: String) -> Self {
        Self {
            system_id,
            kernel_list: KernelList::new(),
            last_timestamp_ns: None,
            clock: Instant::now(),
        }
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// The wall clock has no hardware mode that fails to probe, unlike the
    /// register and pulse sources; kept for parity with their arm-time
    /// availability checks rather than because it can ever return `false`.
    pub fn is_available(&self) -> bool {
        true
    }

    pub fn start_measurement(&mut self) {
        self.kernel_list.clear();
        self.last_timestamp_ns = None;
    }

    pub fn kernel_list(&self) -> &KernelList<TimerKernelResult> {
        &self.kernel_list
    }

    pub fn calculate(&mut self, name: &str, is_begin: bool) {
        let now_ns = self.clock.elapsed().as_nanos() as u64;

        if is_begin {
            let mut result = TimerKernelResult::new();
            result.insert(self.system_id.clone(), 0.0);
            self.kernel_list.push(name.to_string(), result);
        } else if let Some(prev_ns) = self.last_timestamp_ns {
            let elapsed_s = (now_ns.saturating_sub(prev_ns)) as f64 / 1e9;
            if let Some(entry) = self.kernel_list.last_mut() {
                *entry.entry(self.system_id.clone()).or_insert(0.0) += elapsed_s;
            }
        }

        self.last_timestamp_ns = Some(now_ns);
    }

    pub fn discard_last(&mut self) {
        self.kernel_list.discard_last();
    }
}
