use serde::{Deserialize, Serialize};

use crate::peptide::Peptide;
use crate::site::PtmScores;

/// One candidate peptide for a spectrum as reported by the search engine.
///
/// `probability` follows the search engine's convention where lower is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeptideAssumption {
    pub peptide: Peptide,
    pub probability: f64,
    #[serde(default)]
    pub proteins: Vec<String>,
}

impl PeptideAssumption {
    pub fn new(peptide: Peptide, probability: f64) -> Self {
        Self {
            peptide,
            probability,
            proteins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumMatch {
    pub key: String,
    pub spectrum_file: String,
    pub spectrum_title: String,
    pub charge: i32,
    /// The best scoring assumption, also present in `peptide_assumptions`
    pub best_peptide: Option<PeptideAssumption>,
    pub peptide_assumptions: Vec<PeptideAssumption>,
    pub ptm_scores: Option<PtmScores>,
    pub validated: bool,
}

impl SpectrumMatch {
    pub fn new(
        spectrum_file: impl Into<String>,
        spectrum_title: impl Into<String>,
        charge: i32,
    ) -> Self {
        let spectrum_file = spectrum_file.into();
        let spectrum_title = spectrum_title.into();
        Self {
            key: spectrum_key(&spectrum_file, &spectrum_title),
            spectrum_file,
            spectrum_title,
            charge,
            best_peptide: None,
            peptide_assumptions: Vec::new(),
            ptm_scores: None,
            validated: true,
        }
    }

    /// Add an assumption, promoting it to the best one if it has the lowest probability so far
    pub fn add_assumption(&mut self, assumption: PeptideAssumption) {
        let is_best = self
            .best_peptide
            .as_ref()
            .map(|best| assumption.probability < best.probability)
            .unwrap_or(true);
        if is_best {
            self.best_peptide = Some(assumption.clone());
        }
        self.peptide_assumptions.push(assumption);
    }

    pub fn best_peptide(&self) -> Option<&Peptide> {
        self.best_peptide.as_ref().map(|a| &a.peptide)
    }

    pub fn ptm_scores_mut(&mut self) -> &mut PtmScores {
        self.ptm_scores.get_or_insert_with(PtmScores::default)
    }
}

pub fn spectrum_key(spectrum_file: &str, spectrum_title: &str) -> String {
    format!("{spectrum_file}:{spectrum_title}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeptideMatch {
    pub key: String,
    pub peptide: Peptide,
    pub spectrum_match_keys: Vec<String>,
    pub ptm_scores: Option<PtmScores>,
    pub validated: bool,
}

impl PeptideMatch {
    pub fn new(peptide: Peptide) -> Self {
        Self {
            key: peptide.matching_key(),
            peptide,
            spectrum_match_keys: Vec::new(),
            ptm_scores: None,
            validated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinMatch {
    pub accession: String,
    pub peptide_match_keys: Vec<String>,
    pub ptm_scores: Option<PtmScores>,
    pub validated: bool,
}

impl ProteinMatch {
    pub fn new(accession: impl Into<String>) -> Self {
        Self {
            accession: accession.into(),
            peptide_match_keys: Vec::new(),
            ptm_scores: None,
            validated: true,
        }
    }
}
