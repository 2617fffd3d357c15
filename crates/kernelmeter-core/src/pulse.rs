//! Pulse-emitter abstraction over the parallel-port GPIO line.
//!
//! The marker demultiplexer never touches hardware directly; it drives a
//! [`PulseEmitter`] so that its state machine can be exercised without root
//! privileges or a parallel port attached.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

pub trait PulseEmitter: Send {
    fn raise(&mut self) -> Result<()>;
    fn lower(&mut self) -> Result<()>;

    /// Hardware-availability check consulted at arm time, before any edge
    /// is ever driven. Default is `true` for emitters with nothing to
    /// probe (e.g. [`RecordingPulseEmitter`] in tests).
    fn probe(&self) -> bool {
        true
    }
}

/// Drives the parallel port's data pins through `/dev/port`, writing a
/// single high/low byte at the configured base address.
pub struct ParallelPortPulseEmitter {
    base_address: u16,
}

impl ParallelPortPulseEmitter {
    pub fn new(base_address: u16) -> Self {
        Self { base_address }
    }

    fn write_byte(&mut self, value: u8) -> Result<()> {
        let mut port = OpenOptions::new()
            .write(true)
            .open("/dev/port")
            .map_err(Error::Pulse)?;
        port.seek(SeekFrom::Start(self.base_address as u64))
            .map_err(Error::Pulse)?;
        port.write_all(&[value]).map_err(Error::Pulse)
    }
}

impl PulseEmitter for ParallelPortPulseEmitter {
    fn raise(&mut self) -> Result<()> {
        self.write_byte(0xff)
    }

    fn lower(&mut self) -> Result<()> {
        self.write_byte(0x00)
    }

    /// Checks that `/dev/port` is writable without driving an edge —
    /// probing must not have a side effect on the physical line.
    fn probe(&self) -> bool {
        OpenOptions::new().write(true).open("/dev/port").is_ok()
    }
}

/// Records edges in memory instead of touching hardware; used in tests and
/// wherever the demultiplexer runs without a parallel port attached.
#[derive(Debug, Default)]
pub struct RecordingPulseEmitter {
    pub edges: Vec<bool>,
}

impl PulseEmitter for RecordingPulseEmitter {
    fn raise(&mut self) -> Result<()> {
        self.edges.push(true);
        Ok(())
    }

    fn lower(&mut self) -> Result<()> {
        self.edges.push(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_emitter_captures_edges_in_order() {
        let mut emitter = RecordingPulseEmitter::default();
        emitter.raise().unwrap();
        emitter.lower().unwrap();
        emitter.raise().unwrap();
        assert_eq!(emitter.edges, vec![true, false, true]);
    }

    #[test]
    fn recording_emitter_probes_available_without_recording_an_edge() {
        let emitter = RecordingPulseEmitter::default();
        assert!(emitter.probe());
        assert!(emitter.edges.is_empty());
    }
}
