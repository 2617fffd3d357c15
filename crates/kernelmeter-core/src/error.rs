//! Error taxonomy for the measurement core.
//!
//! Configuration failures are reported eagerly and are meant to abort daemon
//! startup; the remaining variants degrade a single sample or a single RPC
//! call rather than the whole process.

use std::io;

/// Errors surfaced by configuration loading, register access, the marker
/// pipe, and the scope device abstraction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration missing or invalid: {0}")]
    ConfigInvalid(String),

    #[error("register source unavailable: {0}")]
    RegisterUnavailable(String),

    #[error("register read failed: {0}")]
    RegisterRead(#[source] io::Error),

    #[error("marker pipe error: {0}")]
    Pipe(#[source] io::Error),

    #[error("scope device unavailable: {0}")]
    ScopeUnavailable(String),

    #[error("pulse emitter failed: {0}")]
    Pulse(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
