//! The declarative configuration file: a station list, the medium
//! model selection and optional per-link SNR overrides.
//!
//! Parsed with `serde`/`toml`. Loading validates everything up front
//! so that a reload can be applied atomically or not at all.

use std::{collections::HashSet, fs, path::Path};

use serde::Deserialize;

use crate::{
    err::ConfigError,
    ieee80211::MacAddr,
    medium::{Medium, PathLossModel, PerTable},
};

/// One station entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StationConfig {
    /// Radio hardware address.
    pub mac: MacAddr,
    /// Position on the plane [m].
    #[serde(default)]
    pub position: (f64, f64),
    /// Movement per tick [m]; see the engine's movement job.
    #[serde(default)]
    pub direction: (f64, f64),
    /// Transmit power [dBm].
    #[serde(default = "default_tx_power")]
    pub tx_power: f64,
    /// Location configuration information bytes, if the station
    /// answers FTM requests with one.
    #[serde(default)]
    pub lci: Option<String>,
    /// Civic location string, as above.
    #[serde(default)]
    pub civicloc: Option<String>,
}

fn default_tx_power() -> f64 {
    20.0
}

/// A pinned SNR between two stations, symmetric.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// First endpoint.
    pub node1: MacAddr,
    /// Second endpoint.
    pub node2: MacAddr,
    /// SNR to pin [dB].
    pub snr: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MediumSection {
    model: Option<String>,
    #[serde(default = "default_exponent")]
    path_loss_exponent: f64,
    #[serde(default)]
    sigma: f64,
    #[serde(default = "default_floors")]
    floors: u32,
    #[serde(default = "default_floor_penetration")]
    floor_penetration: u32,
    #[serde(default)]
    fading: bool,
    #[serde(default = "default_fading_coefficient")]
    fading_coefficient: f64,
    per_file: Option<String>,
}

fn default_exponent() -> f64 {
    3.5
}

fn default_floors() -> u32 {
    1
}

fn default_floor_penetration() -> u32 {
    15
}

fn default_fading_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    medium: MediumSection,
    #[serde(default)]
    stations: Vec<StationConfig>,
    #[serde(default)]
    links: Vec<LinkConfig>,
}

/// A fully validated configuration, ready to swap into the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stations to create.
    pub stations: Vec<StationConfig>,
    /// SNR overrides to pin after creation.
    pub links: Vec<LinkConfig>,
    /// Medium parameters, PER table already loaded.
    pub medium: Medium,
}

impl Config {
    /// An empty configuration: no stations, no model.
    pub fn empty() -> Self {
        Config {
            stations: Vec::new(),
            links: Vec::new(),
            medium: Medium::default(),
        }
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut seen = HashSet::new();
        for station in &raw.stations {
            if !seen.insert(station.mac) {
                return Err(ConfigError::DuplicateStation(station.mac.to_string()));
            }
        }
        for link in &raw.links {
            for mac in [link.node1, link.node2] {
                if !seen.contains(&mac) {
                    return Err(ConfigError::UnknownLinkPeer(mac.to_string()));
                }
            }
        }

        let model = match raw.medium.model.as_deref() {
            None => None,
            Some("free_space") => Some(PathLossModel::FreeSpace),
            Some("log_distance") => Some(PathLossModel::LogDistance {
                exponent: raw.medium.path_loss_exponent,
                sigma: raw.medium.sigma,
            }),
            Some("itu_indoor") => Some(PathLossModel::ItuIndoor {
                floors: raw.medium.floors,
                floor_penetration: raw.medium.floor_penetration,
            }),
            Some(other) => {
                return Err(ConfigError::Parse(format!("unknown medium model {other:?}")))
            }
        };

        let per = match &raw.medium.per_file {
            Some(path) => PerTable::from_file(path)?,
            None => PerTable::default(),
        };

        Ok(Config {
            stations: raw.stations,
            links: raw.links,
            medium: Medium {
                model,
                fading_coefficient: if raw.medium.fading {
                    raw.medium.fading_coefficient
                } else {
                    0.0
                },
                per,
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::parse(
            r#"
            [medium]
            model = "free_space"

            [[stations]]
            mac = "02:00:00:00:00:00"
            position = [0.0, 0.0]
            tx_power = 15.0

            [[stations]]
            mac = "02:00:00:00:00:01"
            position = [1000.0, 0.0]
            direction = [1.0, 0.0]

            [[links]]
            node1 = "02:00:00:00:00:00"
            node2 = "02:00:00:00:00:01"
            snr = 20
            "#,
        )
        .unwrap();
        assert_eq!(cfg.stations.len(), 2);
        assert_eq!(cfg.stations[0].tx_power, 15.0);
        assert_eq!(cfg.stations[1].position, (1000.0, 0.0));
        assert_eq!(cfg.links[0].snr, 20);
        assert_eq!(cfg.medium.model, Some(PathLossModel::FreeSpace));
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = Config::parse(
            r#"
            [[stations]]
            mac = "02:00:00:00:00:00"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.stations[0].position, (0.0, 0.0));
        assert_eq!(cfg.stations[0].tx_power, 20.0);
        assert!(cfg.medium.model.is_none());
    }

    #[test]
    fn test_duplicate_station_rejected() {
        let err = Config::parse(
            r#"
            [[stations]]
            mac = "02:00:00:00:00:00"
            [[stations]]
            mac = "02:00:00:00:00:00"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStation(_)));
    }

    #[test]
    fn test_link_with_unknown_peer_rejected() {
        let err = Config::parse(
            r#"
            [[stations]]
            mac = "02:00:00:00:00:00"
            [[links]]
            node1 = "02:00:00:00:00:00"
            node2 = "02:00:00:00:00:01"
            snr = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLinkPeer(_)));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = Config::parse(
            r#"
            [medium]
            model = "two_ray_ground"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
