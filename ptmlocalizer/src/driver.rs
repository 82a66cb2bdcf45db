use std::io;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use ptmlocalize::{
    CancellationToken, MatchStore, PtmLocalizationEngine, PtmLocalizationError, PtmScoringParams,
};

use crate::args::ArgProbabilisticScore;
use crate::project::Project;
use crate::write::{write_json, LocalizationReport};

#[derive(Debug, Error)]
pub enum PtmLocalizerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),

    #[error("Failed to read or write JSON: {0}")]
    JSONError(
        #[source]
        #[from]
        serde_json::Error,
    ),

    #[error("Failed to load the configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        figment::Error,
    ),

    #[error("Failed to serialize the configuration: {0}")]
    ConfigWriteError(
        #[source]
        #[from]
        toml::ser::Error,
    ),

    #[error("The variable modification {0} is not defined in the project")]
    UndefinedModification(String),

    #[error("Localization failed: {0}")]
    LocalizationError(
        #[source]
        #[from]
        PtmLocalizationError,
    ),
}

#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct PtmLocalizer {
    /// The path to read the identification project from, may be a gzip compressed JSON file.
    /// Use "-" to read from STDIN.
    #[arg()]
    pub input_file: String,

    /// The path to write the localization report to, a ".gz" extension compresses it.
    ///
    /// Defaults to STDOUT.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// The path to read a TOML configuration file from.
    ///
    /// Configurations are also read from "ptmlocalizer.toml" in the working directory
    /// and from environment variables prefixed with "PTMLOCALIZER_".
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// Write the complete configuration of this run to a TOML file
    #[arg(long = "write-config")]
    pub write_config: Option<PathBuf>,

    /// Write the localization rate thresholds estimated during this run to a JSON file
    #[arg(long = "save-thresholds")]
    pub save_thresholds: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short = 't',
        long = "threads",
        default_value_t = -1,
    )]
    pub threads: i32,

    /// The probabilistic site score to use
    #[arg(
        short = 's',
        long = "probabilistic-score",
        value_enum,
        default_value_t = ArgProbabilisticScore::PhosphoRs
    )]
    pub probabilistic_score: ArgProbabilisticScore,

    /// Only use delta scores to localize modifications
    #[arg(long = "no-probabilistic-score")]
    #[serde(default)]
    pub no_probabilistic_score: bool,

    /// The probabilistic score a site needs to be confidently localized
    #[arg(short = 'T', long = "threshold", default_value_t = 95.0)]
    pub probabilistic_score_threshold: f64,

    /// Estimate the probabilistic score thresholds from the data at the false localization
    /// rate given by `--flr`
    #[arg(long = "estimate-flr")]
    #[serde(default)]
    pub estimate_flr: bool,

    /// The false localization rate, in percent, thresholds are estimated at
    #[arg(long = "flr", default_value_t = 1.0)]
    pub flr: f64,

    /// The number of localization points needed to estimate a threshold for a
    /// modification mass
    #[arg(long = "flr-min-points", default_value_t = 100)]
    pub flr_min_points: usize,

    /// The number of decimals delta scores are rounded down to
    #[arg(long = "delta-score-decimals")]
    pub delta_score_decimals: Option<u32>,

    /// The absolute mass tolerance, in Daltons, used to group modifications by mass
    #[arg(long = "mass-tolerance", default_value_t = 0.001)]
    pub mass_tolerance: f64,

    /// A variable modification to localize, may be repeated. Defaults to the variable
    /// modifications listed in the project.
    #[arg(short = 'm', long = "variable-modification")]
    #[serde(default)]
    pub variable_modifications: Vec<String>,

    /// Do not infer unresolved sites from other spectrum matches
    #[arg(long = "no-peptide-inference")]
    #[serde(default)]
    pub no_peptide_inference: bool,

    /// The number of seconds to wait for spectrum match scoring to finish
    #[arg(long = "pool-timeout", default_value_t = 7 * 24 * 60 * 60)]
    pub pool_timeout: u64,
}

impl PtmLocalizer {
    /// Build the engine's parameters, falling back to the project's variable modifications
    pub fn scoring_params(&self, project: &Project) -> PtmScoringParams {
        let variable_modifications = if self.variable_modifications.is_empty() {
            project.variable_modifications.clone()
        } else {
            self.variable_modifications.clone()
        };
        PtmScoringParams {
            probabilistic_score: self.probabilistic_score.into(),
            probabilistic_score_calculation: !self.no_probabilistic_score,
            probabilistic_score_threshold: self.probabilistic_score_threshold,
            estimate_flr: self.estimate_flr,
            flr: self.flr,
            flr_min_points: self.flr_min_points,
            delta_score_decimals: self.delta_score_decimals,
            variable_modifications,
            mass_tolerance: self.mass_tolerance,
            threads: self.threads.max(0) as usize,
            pool_timeout_secs: self.pool_timeout,
            peptide_inference: !self.no_peptide_inference,
            ..Default::default()
        }
    }

    pub fn main(&self) -> Result<(), PtmLocalizerError> {
        let start = Instant::now();
        info!(
            "ptmlocalizer v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());

        let project = Project::read(&self.input_file)?;
        let params = self.scoring_params(&project);
        if let Some(name) = project
            .undefined_modifications(&params.variable_modifications)
            .first()
        {
            return Err(PtmLocalizerError::UndefinedModification(name.to_string()));
        }
        info!(
            "Localizing {} with {}",
            params.variable_modifications.join(", "),
            if params.probabilistic_score_calculation {
                self.probabilistic_score.to_string()
            } else {
                "delta scores only".to_string()
            }
        );

        let (registry, scorer, store) = project.into_parts(params.tolerance());
        if scorer.is_empty() && params.probabilistic_score_calculation {
            warn!("No probabilistic site scores were found in the input");
        }
        let engine = PtmLocalizationEngine::new(registry, scorer, params);
        let handler = CancellationToken::new();

        let mut summary = engine.score_psm_ptms(&store, &handler)?;
        summary += engine.peptide_inference(&store, &handler)?;

        let (n_peptides, n_proteins) = store.group_matches();
        info!("Grouped matches into {n_peptides} peptides and {n_proteins} proteins");
        summary += engine.score_peptide_ptms(&store, &handler)?;
        summary += engine.score_protein_ptms(&store, &handler)?;

        let thresholds = if engine.params().estimate_flr {
            Some(engine.psm_ptm_map())
        } else {
            None
        };
        if let (Some(path), Some(thresholds)) = (self.save_thresholds.as_ref(), thresholds.as_ref())
        {
            info!("Writing localization thresholds to {}", path.display());
            write_json(thresholds, path)?;
        }

        let report = LocalizationReport::collect(&store, engine.params(), summary, thresholds);
        write_json(&report, &self.output_file)?;

        info!(
            "Localized {} spectrum matches, {} peptides and {} proteins",
            summary.psms_scored,
            summary.peptides_scored,
            summary.proteins_scored
        );
        info!(
            "Wrote {} spectrum matches to {}",
            store.spectrum_match_count(),
            self.output_file.display()
        );
        info!("Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }
}
