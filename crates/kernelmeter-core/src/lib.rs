//! # kernelmeter-core
//!
//! Measurement core shared by the rapl and scope daemons: marker pipe
//! demultiplexing, the package-energy counter with 32-bit wrap correction,
//! the wall-clock timer, and the oscilloscope streaming pipeline that
//! segments a continuous sample stream into per-kernel windows.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kernelmeter_core::config::Config;
//! use kernelmeter_core::register::MsrRegisterSource;
//! use kernelmeter_core::socket::{Socket, SocketCounter};
//!
//! let config = Config::load("/etc/kernelmeter/rapl.toml").unwrap();
//! let sockets = config
//!     .rapl
//!     .sockets
//!     .iter()
//!     .map(|s| Socket {
//!         component_id: s.component_id.clone(),
//!         lead_core_index: s.lead_core_index,
//!     })
//!     .collect();
//! let mut counter = SocketCounter::new(sockets, Box::new(MsrRegisterSource::new()));
//! counter.start_measurement();
//! ```
//!
//! ## Architecture
//!
//! Marker pipe → [`marker::MarkerDemultiplexer`] → [`socket::SocketCounter`] /
//! [`timer::TimerCounter`], plus a physical pulse line driving
//! [`scope::ScopePipeline`] in the other daemon process. Every hardware
//! touchpoint sits behind a trait ([`pulse::PulseEmitter`],
//! [`register::RegisterSource`], [`scope::ScopeDevice`]) so the
//! demultiplexer and pipeline logic can run against recorded/scripted/
//! simulated implementations in tests.

pub mod config;
pub mod error;
pub mod marker;
pub mod model;
pub mod pulse;
pub mod register;
pub mod scope;
pub mod socket;
pub mod timer;

pub use error::{Error, Result};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
