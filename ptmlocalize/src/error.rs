//! Error types for the localization engine.
//!
//! Data inconsistencies are always fatal and are kept apart from resource failures
//! so that callers cannot swallow one while handling the other. A match that simply
//! has not been scored yet is not an error, it is represented by an empty [`Option`].
use std::time::Duration;

use thiserror::Error;

/// A violation of one of the engine's internal invariants, caused either by a
/// programming defect or by search results that disagree with the search parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InconsistencyError {
    #[error(
        "{peptide} carries {occurrences} modification(s) of mass {mass:.4} \
         but only {candidates} site(s) can hold them"
    )]
    TooFewCandidateSites {
        peptide: String,
        mass: f64,
        occurrences: usize,
        candidates: usize,
    },
    #[error("Two modifications of mass {mass:.4} were scored at site {site} of {peptide}")]
    DuplicateSiteScore {
        peptide: String,
        mass: f64,
        site: usize,
    },
    #[error("The peptide key {0} already belongs to a different peptide match")]
    DuplicatePeptideKey(String),
    #[error(
        "Selected {selected} representative site(s) for mass {mass:.4} \
         but {required} were required"
    )]
    InsufficientRepresentativeSites {
        mass: f64,
        required: usize,
        selected: usize,
    },
    #[error("No modification of mass {mass:.4} can be placed at site {site} of {peptide}")]
    NoCompatibleModification {
        peptide: String,
        mass: f64,
        site: usize,
    },
    #[error(
        "{peptide} has {confident} confident site(s) for only {occurrences} \
         modification(s) of mass {mass:.4}"
    )]
    TooManyConfidentSites {
        peptide: String,
        mass: f64,
        confident: usize,
        occurrences: usize,
    },
    #[error("The modification {0} is not registered")]
    UnknownModification(String),
    #[error("No {kind} was found for the key {key}")]
    MissingMatch { kind: &'static str, key: String },
}

#[derive(Debug, Error)]
pub enum PtmLocalizationError {
    #[error("Data inconsistency: {0}")]
    Inconsistency(
        #[from]
        #[source]
        InconsistencyError,
    ),
    #[error("Scoring did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Failed to build the scoring thread pool: {0}")]
    ThreadPool(
        #[from]
        #[source]
        rayon::ThreadPoolBuildError,
    ),
}
