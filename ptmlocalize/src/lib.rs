pub mod error;
pub mod modification;
pub mod peptide;
pub mod site;
pub mod matches;
pub mod store;
pub mod params;
pub mod flr;
pub mod scoring;
pub mod selector;
pub mod classifier;
pub mod aggregation;
pub mod inference;
pub mod progress;
pub mod scheduler;
pub mod api;

#[cfg(test)]
pub(crate) mod fixtures;

pub use crate::api::PtmLocalizationEngine;
pub use crate::error::{InconsistencyError, PtmLocalizationError};
pub use crate::matches::{PeptideAssumption, PeptideMatch, ProteinMatch, SpectrumMatch};
pub use crate::modification::{
    Modification, ModificationMatch, ModificationPosition, ModificationRegistry,
    ModificationTable,
};
pub use crate::params::{ProbabilisticScore, PtmScoringParams};
pub use crate::peptide::Peptide;
pub use crate::progress::{CancellationToken, ProgressRecord, WaitingHandler};
pub use crate::scoring::SiteProbabilityScorer;
pub use crate::site::{PtmScores, PtmScoring, SiteConfidence};
pub use crate::store::{InMemoryMatchStore, MatchStore};
