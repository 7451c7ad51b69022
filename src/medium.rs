//! Signal propagation: path loss models, link SNR and the packet
//! error table.
//!
//! Everything here is a pure function of station geometry and frame
//! metadata except for the explicitly random contributions (shadowing
//! in the log-distance model, fading when enabled), which draw from
//! the engine's RNG at link-matrix recompute or delivery time. With
//! those disabled the same inputs always produce the same SNR, which
//! the test suite relies on.

use std::{fs, path::Path};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{
    err::ConfigError,
    ieee80211::{self, NOISE_LEVEL},
};

/// Link SNR assumed when no propagation model is configured [dB].
pub const SNR_DEFAULT: i32 = 30;

/// Bounds applied to every computed link SNR [dB].
const SNR_CLAMP: (i32, i32) = (-100, 100);

/// Distance floor so co-located stations don't blow up the log terms.
const MIN_DISTANCE_M: f64 = 0.1;

/// The propagation model variants, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathLossModel {
    /// Free-space path loss.
    FreeSpace,
    /// Log-distance with configurable exponent and log-normal
    /// shadowing (sigma in dB, 0 disables the random term).
    LogDistance {
        /// Path loss exponent `n`.
        exponent: f64,
        /// Shadowing standard deviation [dB].
        sigma: f64,
    },
    /// ITU indoor propagation with a floor penetration term.
    ItuIndoor {
        /// Number of floors between the stations.
        floors: u32,
        /// Penetration loss per floor [dB].
        floor_penetration: u32,
    },
}

impl PathLossModel {
    /// Path loss in dB over `dist_m` metres at `freq_mhz`.
    pub fn path_loss<R: Rng>(&self, dist_m: f64, freq_mhz: u32, rng: &mut R) -> f64 {
        let d = dist_m.max(MIN_DISTANCE_M);
        let f = f64::from(freq_mhz);
        match *self {
            PathLossModel::FreeSpace => 20.0 * d.log10() + 20.0 * f.log10() - 27.55,
            PathLossModel::LogDistance { exponent, sigma } => {
                // Reference loss at 1 m is free space.
                let l0 = 20.0 * f.log10() - 27.55;
                let shadowing = if sigma > 0.0 {
                    Normal::new(0.0, sigma)
                        .map(|n| n.sample(rng))
                        .unwrap_or(0.0)
                } else {
                    0.0
                };
                l0 + 10.0 * exponent * d.log10() + shadowing
            }
            PathLossModel::ItuIndoor {
                floors,
                floor_penetration,
            } => {
                20.0 * f.log10()
                    + 30.0 * d.log10()
                    + f64::from(floors * floor_penetration)
                    - 28.0
            }
        }
    }
}

/// The medium-wide propagation parameters shared by all links.
#[derive(Debug, Clone)]
pub struct Medium {
    /// Propagation model; [`None`] pins every link to [`SNR_DEFAULT`].
    pub model: Option<PathLossModel>,
    /// Fading noise standard deviation [dB]; 0 disables fading.
    pub fading_coefficient: f64,
    /// The packet error table in effect.
    pub per: PerTable,
}

impl Default for Medium {
    fn default() -> Self {
        Medium {
            model: None,
            fading_coefficient: 0.0,
            per: PerTable::default(),
        }
    }
}

impl Medium {
    /// Directed link SNR from geometry, ignoring overrides (the engine
    /// layers those on top). Draws shadowing when the model has it.
    pub fn link_snr<R: Rng>(
        &self,
        dist_m: f64,
        tx_power_dbm: f64,
        freq_mhz: u32,
        rng: &mut R,
    ) -> i32 {
        let model = match &self.model {
            Some(m) => m,
            None => return SNR_DEFAULT,
        };
        let loss = model.path_loss(dist_m, freq_mhz, rng);
        let snr = tx_power_dbm - loss - f64::from(NOISE_LEVEL);
        (snr.round() as i32).clamp(SNR_CLAMP.0, SNR_CLAMP.1)
    }

    /// Zero-mean fading contribution for one reception [dB].
    pub fn fading_signal<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.fading_coefficient > 0.0 {
            Normal::new(0.0, self.fading_coefficient)
                .map(|n| n.sample(rng))
                .unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

/// Number of rate columns carried per table row; matches the full
/// 2.4 GHz rate set, with 5 GHz indexes offset past the CCK rates.
const PER_RATE_COLUMNS: usize = 12;

/// Reference frame length the table rows are stated for [bytes].
const PER_REFERENCE_LEN: f64 = 1024.0;

/// Packet error probability per `(signal dBm, rate)` cell.
///
/// Lookup interpolates linearly between the two bracketing signal rows
/// at the exact rate column and then rescales for frame length; out of
/// range signals clamp to the edge rows.
#[derive(Debug, Clone)]
pub struct PerTable {
    signal_min: i32,
    rows: Vec<[f64; PER_RATE_COLUMNS]>,
}

/// SNR at which each rate hits 50% PER for a 1024-byte frame [dB],
/// indexed like the 2.4 GHz rate table.
const RATE_SNR_MIDPOINTS: [f64; PER_RATE_COLUMNS] = [
    10.0, 11.0, 13.0, 16.0, 12.0, 13.0, 15.0, 17.0, 20.0, 24.0, 27.0, 29.0,
];

impl Default for PerTable {
    /// Table synthesised from a logistic PER-vs-SNR curve per rate,
    /// sampled at 1 dB steps from the noise floor up to -53 dBm.
    fn default() -> Self {
        let signal_min = NOISE_LEVEL;
        let rows = (0..39)
            .map(|row| {
                let snr = f64::from(row);
                let mut cells = [0.0; PER_RATE_COLUMNS];
                for (idx, cell) in cells.iter_mut().enumerate() {
                    *cell = 1.0 / (1.0 + ((snr - RATE_SNR_MIDPOINTS[idx]) / 1.0).exp());
                }
                cells
            })
            .collect();
        PerTable { signal_min, rows }
    }
}

impl PerTable {
    /// Load a replacement table from a whitespace-separated file: one
    /// row per signal level, `signal p0 p1 ... p11`, signal levels
    /// ascending in 1 dB steps.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let mut signal_min = None;
        let mut rows = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let signal: i32 = fields
                .next()
                .ok_or_else(|| ConfigError::PerTable(format!("line {}: empty row", lineno + 1)))?
                .parse()
                .map_err(|_| {
                    ConfigError::PerTable(format!("line {}: bad signal value", lineno + 1))
                })?;
            let expected = signal_min.map(|min| min + rows.len() as i32);
            match expected {
                None => signal_min = Some(signal),
                Some(want) if want == signal => {}
                Some(want) => {
                    return Err(ConfigError::PerTable(format!(
                        "line {}: signal {signal}, expected {want} (rows must ascend by 1 dB)",
                        lineno + 1
                    )))
                }
            }
            let mut cells = [0.0; PER_RATE_COLUMNS];
            for (idx, cell) in cells.iter_mut().enumerate() {
                let value: f64 = fields
                    .next()
                    .ok_or_else(|| {
                        ConfigError::PerTable(format!(
                            "line {}: expected {PER_RATE_COLUMNS} rate columns, got {idx}",
                            lineno + 1
                        ))
                    })?
                    .parse()
                    .map_err(|_| {
                        ConfigError::PerTable(format!("line {}: bad PER value", lineno + 1))
                    })?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::PerTable(format!(
                        "line {}: PER {value} outside [0, 1]",
                        lineno + 1
                    )));
                }
                *cell = value;
            }
            rows.push(cells);
        }
        match signal_min {
            Some(signal_min) if !rows.is_empty() => Ok(PerTable { signal_min, rows }),
            _ => Err(ConfigError::PerTable("no rows".into())),
        }
    }

    /// Packet error probability for one reception attempt.
    pub fn error_prob(&self, snr_db: f64, rate_idx: usize, freq_mhz: u32, frame_len: usize) -> f64 {
        let column = if ieee80211::is_5ghz(freq_mhz) {
            (rate_idx + 4).min(PER_RATE_COLUMNS - 1)
        } else {
            rate_idx.min(PER_RATE_COLUMNS - 1)
        };
        let signal = snr_db + f64::from(NOISE_LEVEL);
        let offset = signal - f64::from(self.signal_min);
        let last = (self.rows.len() - 1) as f64;
        let reference = if offset <= 0.0 {
            self.rows[0][column]
        } else if offset >= last {
            self.rows[self.rows.len() - 1][column]
        } else {
            let below = offset.floor() as usize;
            let frac = offset - offset.floor();
            self.rows[below][column] * (1.0 - frac) + self.rows[below + 1][column] * frac
        };
        // Rescale the reference-length PER to this frame's length.
        let success = (1.0 - reference).powf(frame_len as f64 / PER_REFERENCE_LEN);
        (1.0 - success).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn test_free_space_loss_at_kilometre() {
        let loss = PathLossModel::FreeSpace.path_loss(1000.0, 2412, &mut rng());
        // 20log10(1000) + 20log10(2412) - 27.55 ~= 100.1 dB
        assert!((loss - 100.1).abs() < 0.2, "{loss}");
    }

    #[test]
    fn test_link_snr_matches_scenarios() {
        let medium = Medium {
            model: Some(PathLossModel::FreeSpace),
            ..Medium::default()
        };
        // 1 km at 15 dBm: marginal link.
        let far = medium.link_snr(1000.0, 15.0, 2412, &mut rng());
        assert!((0..10).contains(&far), "{far}");
        // 5 m at 15 dBm: at least 40 dB.
        let near = medium.link_snr(5.0, 15.0, 2412, &mut rng());
        assert!(near >= 40, "{near}");
    }

    #[test]
    fn test_no_model_returns_default_snr() {
        let medium = Medium::default();
        assert_eq!(medium.link_snr(12345.0, 1.0, 2412, &mut rng()), SNR_DEFAULT);
    }

    #[test]
    fn test_log_distance_deterministic_without_sigma() {
        let model = PathLossModel::LogDistance {
            exponent: 3.5,
            sigma: 0.0,
        };
        let a = model.path_loss(120.0, 2412, &mut rng());
        let b = model.path_loss(120.0, 2412, &mut rng());
        assert_eq!(a, b);
    }

    #[test]
    fn test_per_monotone_in_snr() {
        let table = PerTable::default();
        let mut last = 1.0f64;
        for snr in -5..45 {
            let p = table.error_prob(f64::from(snr), 0, 2412, 1500);
            assert!(p <= last + 1e-12, "PER rose at {snr} dB: {p} > {last}");
            last = p;
        }
    }

    #[test]
    fn test_per_extremes() {
        let table = PerTable::default();
        assert!(table.error_prob(0.0, 0, 2412, 1500) > 0.99);
        assert!(table.error_prob(52.0, 0, 2412, 1500) < 1e-6);
    }

    #[test]
    fn test_per_length_scaling() {
        let table = PerTable::default();
        let short = table.error_prob(12.0, 0, 2412, 100);
        let long = table.error_prob(12.0, 0, 2412, 1500);
        assert!(long > short);
    }

    #[test]
    fn test_per_file_roundtrip_and_validation() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wmediumd-per-{}.dat", std::process::id()));
        {
            let mut f = fs::File::create(&path).unwrap();
            writeln!(f, "# signal then one PER per rate").unwrap();
            for signal in -91..=-88 {
                let cells = vec!["0.5"; PER_RATE_COLUMNS].join(" ");
                writeln!(f, "{signal} {cells}").unwrap();
            }
        }
        let table = PerTable::from_file(&path).unwrap();
        assert_eq!(table.rows.len(), 4);
        assert!((table.error_prob(1.0, 3, 2412, 1024) - 0.5).abs() < 1e-9);
        fs::remove_file(&path).unwrap();

        assert!(PerTable::from_file(dir.join("missing-per-file.dat")).is_err());
    }
}
