//! wardgate/src/types.rs
//! Core data structures, type aliases, and constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifier assigned to every accepted client connection, used in logs.
pub type ConnectionId = u64;

/// Read size of the raw packet pump and of the framed update exchange.
pub const DEFAULT_TCP_BUFFSIZE: usize = 1024;

/// Flag token shape looked for in outbound traffic. Overridable through
/// [`JudgeConfig::flag_regex`].
pub const DEFAULT_FLAG_REGEX: &str = "[A-Z0-9]{31}=";

/// Operating mode of a protected service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Simulation,
    Active,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Simulation
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Simulation => f.write_str("SIMULATION_MODE"),
            Mode::Active => f.write_str("ACTIVE_MODE"),
        }
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIMULATION_MODE" => Ok(Mode::Simulation),
            "ACTIVE_MODE" => Ok(Mode::Active),
            _ => Err(()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JudgeConfig {
    /// Address of the learning backend.
    pub updater_address: String,
    pub updater_port: u16,
    #[serde(default = "default_flag_regex")]
    pub flag_regex: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
}

fn default_flag_regex() -> String {
    DEFAULT_FLAG_REGEX.to_string()
}

fn default_update_interval() -> u64 {
    40
}

fn default_exchange_timeout() -> u64 {
    60
}

impl JudgeConfig {
    /// Config pointing at `address:port` with every other field at its default.
    pub fn for_endpoint(address: impl Into<String>, port: u16) -> Self {
        JudgeConfig {
            updater_address: address.into(),
            updater_port: port,
            flag_regex: default_flag_regex(),
            update_interval_secs: default_update_interval(),
            exchange_timeout_secs: default_exchange_timeout(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_wire_names() {
        assert_eq!(Mode::Simulation.to_string(), "SIMULATION_MODE");
        assert_eq!(Mode::Active.to_string(), "ACTIVE_MODE");
        assert_eq!("ACTIVE_MODE".parse::<Mode>(), Ok(Mode::Active));
        assert!("active_mode".parse::<Mode>().is_err());
    }

    #[test]
    fn judge_config_defaults_from_json() {
        let config: JudgeConfig =
            serde_json::from_str(r#"{"updaterAddress": "10.0.0.1", "updaterPort": 4444}"#).unwrap();
        assert_eq!(config.updater_address, "10.0.0.1");
        assert_eq!(config.flag_regex, DEFAULT_FLAG_REGEX);
        assert_eq!(config.update_interval(), Duration::from_secs(40));
        assert_eq!(config.exchange_timeout(), Duration::from_secs(60));
    }
}
