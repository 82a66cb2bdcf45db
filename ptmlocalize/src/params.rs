use std::thread;
use std::time::Duration;

use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};

/// Delta scores above this value mark a site as confidently localized
pub const DELTA_SCORE_THRESHOLD: f64 = 95.0;

/// The probabilistic localization scores an external scorer may compute
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbabilisticScore {
    AScore,
    #[default]
    PhosphoRs,
}

impl ProbabilisticScore {
    /// Whether the score can discriminate sites when a mass occurs more than once
    pub fn supports_multiple_occurrences(&self) -> bool {
        matches!(self, Self::PhosphoRs)
    }

    /// The score expected for `occurrences` modifications spread uniformly over `candidates` sites
    pub fn random_floor(&self, occurrences: usize, candidates: usize) -> f64 {
        match self {
            Self::AScore => 0.0,
            Self::PhosphoRs => {
                if candidates == 0 {
                    0.0
                } else {
                    100.0 * occurrences as f64 / candidates as f64
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtmScoringParams {
    pub probabilistic_score: ProbabilisticScore,
    /// Whether probabilistic scores are computed at all
    pub probabilistic_score_calculation: bool,
    /// The fixed probabilistic score above which a site is very confident
    pub probabilistic_score_threshold: f64,
    /// Derive the probabilistic score threshold from a false localization rate
    pub estimate_flr: bool,
    /// The false localization rate target, in percent
    pub flr: f64,
    /// Precursor charge buckets with fewer points are pooled when estimating thresholds
    pub flr_min_points: usize,
    pub delta_score_decimals: Option<u32>,
    /// The names of the variable modifications searched for, in priority order
    pub variable_modifications: Vec<String>,
    /// Modification masses within this many Daltons are considered identical
    pub mass_tolerance: f64,
    /// The number of scoring threads, 0 uses every available core
    pub threads: usize,
    pub pool_timeout_secs: u64,
    pub channel_buffer_size: usize,
    pub peptide_inference: bool,
}

impl Default for PtmScoringParams {
    fn default() -> Self {
        Self {
            probabilistic_score: ProbabilisticScore::PhosphoRs,
            probabilistic_score_calculation: true,
            probabilistic_score_threshold: 95.0,
            estimate_flr: false,
            flr: 1.0,
            flr_min_points: 100,
            delta_score_decimals: None,
            variable_modifications: Vec::new(),
            mass_tolerance: 0.001,
            threads: 0,
            pool_timeout_secs: 7 * 24 * 60 * 60,
            channel_buffer_size: 1024,
            peptide_inference: true,
        }
    }
}

impl PtmScoringParams {
    pub fn tolerance(&self) -> Tolerance {
        Tolerance::Da(self.mass_tolerance)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn thread_count(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Floor `score` to the configured number of decimals, if any
    pub fn round_delta_score(&self, score: f64) -> f64 {
        match self.delta_score_decimals {
            Some(decimals) => {
                let factor = 10f64.powi(decimals as i32);
                (score * factor).floor() / factor
            }
            None => score,
        }
    }
}
