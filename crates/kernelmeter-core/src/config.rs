//! Configuration file loading.
//!
//! The daemon binaries read a single TOML file supplying everything the
//! core needs to know about the deployment: where the marker pipe lives,
//! which sockets and scope channels exist, and where the parallel port is.
//! A missing key or an unparsable file is a startup-fatal [`Error`].

use crate::error::{Error, Result};
use crate::model::{ChannelDescriptor, SocketDescriptor};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rapl: RaplConfig,
    pub timer: TimerConfig,
    pub scope: ScopeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Filesystem path of the begin/end marker pipe.
    pub fifo_path: String,
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: u64,
}

fn default_request_timeout_s() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaplConfig {
    pub sockets: Vec<SocketDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    pub system_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeConfig {
    pub parallel_port_address: u16,
    #[serde(default = "default_pulse_threshold_mv")]
    pub pulse_threshold_mv: f64,
    pub channels: Vec<ChannelDescriptor>,
}

fn default_pulse_threshold_mv() -> f64 {
    3000.0
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|source| Error::ConfigRead {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path_ref.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rapl.sockets.is_empty() {
            return Err(Error::ConfigInvalid(
                "rapl.sockets must declare at least one socket".into(),
            ));
        }
        let pulse_channels = self
            .scope
            .channels
            .iter()
            .filter(|c| c.is_pulse_channel)
            .count();
        if pulse_channels != 1 {
            return Err(Error::ConfigInvalid(format!(
                "scope.channels must mark exactly one channel as the pulse channel, found {pulse_channels}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [server]
        bind_address = "127.0.0.1"
        port = 8080
        fifo_path = "/tmp/kernelmeter.pipe"

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

    #[test]
    fn parses_minimal_valid_config() {
        let config: Config = toml::from_str(VALID).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout_s, 15);
        assert_eq!(config.scope.pulse_threshold_mv, 3000.0);
    }

    #[test]
    fn rejects_missing_pulse_channel() {
        let mut config: Config = toml::from_str(VALID).unwrap();
        config.scope.channels[0].is_pulse_channel = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_socket_list() {
        let mut config: Config = toml::from_str(VALID).unwrap();
        config.rapl.sockets.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/kernelmeter.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn load_reports_parse_failure() {
        let dir = std::env::temp_dir().join(format!("kernelmeter-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
