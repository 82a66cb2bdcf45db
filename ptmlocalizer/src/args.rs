use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use ptmlocalize::ProbabilisticScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgProbabilisticScore {
    /// Ascore, only localizes one occurrence of a modification per peptide
    AScore,
    /// PhosphoRS, handles any number of occurrences of a modification
    #[default]
    PhosphoRs,
}

impl Display for ArgProbabilisticScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ArgProbabilisticScore> for ProbabilisticScore {
    fn from(value: ArgProbabilisticScore) -> Self {
        match value {
            ArgProbabilisticScore::AScore => ProbabilisticScore::AScore,
            ArgProbabilisticScore::PhosphoRs => ProbabilisticScore::PhosphoRs,
        }
    }
}
