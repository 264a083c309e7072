//! # Typed Configuration Records
//!
//! The control plane is configured from the `mps` section of the referee's
//! structured configuration. This module owns the typed form of that section
//! and its validation; parsing the surrounding file format is the caller's
//! business (the shipped binary feeds it JSON, the embedding referee may use
//! whatever its config layer produces).
//!
//! Key layout mirrors the deployed configuration tree:
//!
//! ```text
//! mps.enable                          bool
//! mps.stations.connection             plc | simulation | mockup (fleet-wide)
//! mps.stations.<name>.type            BS | CS | RS | DS
//! mps.stations.<name>.host            string
//! mps.stations.<name>.port            u16
//! mps.stations.<name>.active          bool, default true
//! mps.stations.<name>.connection      per-station override
//! mps.stations.<name>.ring-costs      color -> payment bases (RS only)
//! clips.timer-interval                tick interval, ms
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::station::{RingColor, StationKind, StationName};

/// How a station's transport reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Real industrial controller on the field
    #[value(name = "plc")]
    Plc,
    /// External simulator speaking the same wire schema
    #[value(name = "simulation")]
    Simulation,
    /// In-process stub, completes immediately
    #[value(name = "mockup")]
    Mockup,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Plc => write!(f, "plc"),
            ConnectionMode::Simulation => write!(f, "simulation"),
            ConnectionMode::Mockup => write!(f, "mockup"),
        }
    }
}

/// Configuration failures. All of these are fatal during startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("station '{0}' has an invalid name (want <team>-<kind>[index], e.g. C-BS)")]
    InvalidName(String),

    #[error("station '{0}': port must be non-zero")]
    InvalidPort(String),

    #[error("station '{0}': ring-costs only apply to RS stations")]
    UnexpectedRingCosts(String),

    #[error("station '{name}': name says {hinted} but type says {declared}")]
    KindConflict {
        name: String,
        hinted: StationKind,
        declared: StationKind,
    },
}

/// One station entry under `mps.stations.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationEntry {
    #[serde(rename = "type")]
    pub kind: StationKind,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub connection: Option<ConnectionMode>,
    /// Payment bases consumed per ring color; Ring stations only. Colors not
    /// listed fall back to the season defaults.
    #[serde(default, rename = "ring-costs")]
    pub ring_costs: Option<BTreeMap<RingColor, u16>>,
}

/// The `mps` configuration section in typed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpsConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// Tick interval of the periodic status broadcast, milliseconds
    /// (`clips.timer-interval` in the deployed tree).
    #[serde(default = "default_timer_interval", rename = "timer-interval")]
    pub timer_interval_ms: u64,

    /// Timeout bounding each BUSY-edge wait of a station command, ms.
    #[serde(default = "default_command_timeout", rename = "command-timeout")]
    pub command_timeout_ms: u64,

    /// Fleet-wide connection mode; individual stations may override.
    #[serde(default)]
    pub connection: Option<ConnectionMode>,

    #[serde(default)]
    pub stations: BTreeMap<String, StationEntry>,
}

impl Default for MpsConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            timer_interval_ms: default_timer_interval(),
            command_timeout_ms: default_command_timeout(),
            connection: None,
            stations: BTreeMap::new(),
        }
    }
}

fn default_enable() -> bool {
    true
}

fn default_active() -> bool {
    true
}

fn default_timer_interval() -> u64 {
    crate::defaults::TIMER_INTERVAL_MS
}

fn default_command_timeout() -> u64 {
    crate::defaults::COMMAND_TIMEOUT.as_millis() as u64
}

impl MpsConfig {
    /// Check every station entry. The name must parse, the port must be
    /// usable, ring costs may only appear on Ring stations, and a variety
    /// encoded in the name must not contradict the declared type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, entry) in &self.stations {
            let parsed = StationName::parse(name)
                .map_err(|_| ConfigError::InvalidName(name.clone()))?;
            if entry.port == 0 {
                return Err(ConfigError::InvalidPort(name.clone()));
            }
            if entry.ring_costs.is_some() && entry.kind != StationKind::Ring {
                return Err(ConfigError::UnexpectedRingCosts(name.clone()));
            }
            if let Some(hinted) = parsed.kind_hint() {
                if hinted != entry.kind {
                    return Err(ConfigError::KindConflict {
                        name: name.clone(),
                        hinted,
                        declared: entry.kind,
                    });
                }
            }
        }
        Ok(())
    }

    /// Effective connection mode for one entry: the per-station override
    /// wins over the fleet-wide setting, and the field default is the PLC.
    pub fn connection_for(&self, entry: &StationEntry) -> ConnectionMode {
        entry
            .connection
            .or(self.connection)
            .unwrap_or(ConnectionMode::Plc)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MpsConfig {
        serde_json::from_str(
            r#"{
                "enable": true,
                "timer-interval": 40,
                "connection": "mockup",
                "stations": {
                    "C-BS": { "type": "BS", "host": "127.0.0.1", "port": 4840 },
                    "C-RS1": {
                        "type": "RS", "host": "127.0.0.1", "port": 4841,
                        "connection": "plc",
                        "ring-costs": { "BLUE": 2, "ORANGE": 1 }
                    },
                    "M-DS": { "type": "DS", "host": "127.0.0.1", "port": 4842, "active": false }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_deployed_key_layout() {
        let config = sample();
        assert!(config.enable);
        assert_eq!(config.timer_interval(), Duration::from_millis(40));
        assert_eq!(config.stations.len(), 3);

        let bs = &config.stations["C-BS"];
        assert_eq!(bs.kind, StationKind::Base);
        assert!(bs.active, "active defaults to true");

        let rs = &config.stations["C-RS1"];
        let costs = rs.ring_costs.as_ref().unwrap();
        assert_eq!(costs[&RingColor::Blue], 2);

        assert!(!config.stations["M-DS"].active);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn station_override_beats_fleet_connection() {
        let config = sample();
        assert_eq!(
            config.connection_for(&config.stations["C-BS"]),
            ConnectionMode::Mockup
        );
        assert_eq!(
            config.connection_for(&config.stations["C-RS1"]),
            ConnectionMode::Plc
        );

        let bare = MpsConfig::default();
        let entry = StationEntry {
            kind: StationKind::Base,
            host: "10.0.0.1".into(),
            port: 502,
            active: true,
            connection: None,
            ring_costs: None,
        };
        assert_eq!(bare.connection_for(&entry), ConnectionMode::Plc);
    }

    #[test]
    fn rejects_bad_station_name() {
        let mut config = sample();
        let entry = config.stations["C-BS"].clone();
        config.stations.insert("bogus".into(), entry);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidName(name)) if name == "bogus"
        ));
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = sample();
        config.stations.get_mut("C-BS").unwrap().port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn rejects_ring_costs_on_base_station() {
        let mut config = sample();
        config.stations.get_mut("C-BS").unwrap().ring_costs =
            Some(BTreeMap::from([(RingColor::Blue, 1)]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnexpectedRingCosts(_))
        ));
    }

    #[test]
    fn rejects_name_contradicting_type() {
        let mut config = sample();
        let mut entry = config.stations["C-BS"].clone();
        entry.kind = StationKind::Cap;
        config.stations.insert("M-BS".into(), entry);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::KindConflict { .. })
        ));
    }
}
