//! Reading identification projects and the site scores tabulated alongside them.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use flate2::bufread::GzDecoder;
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ptmlocalize::{
    InMemoryMatchStore, Modification, ModificationMatch, ModificationRegistry, ModificationTable,
    Peptide, PeptideAssumption, ProbabilisticScore, SiteProbabilityScorer, SpectrumMatch,
};

use crate::driver::PtmLocalizerError;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProteinEntry {
    pub accession: String,
    pub sequence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationEntry {
    pub name: String,
    pub site: usize,
    #[serde(default = "default_true")]
    pub variable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssumptionEntry {
    pub sequence: String,
    #[serde(default)]
    pub modifications: Vec<ModificationEntry>,
    pub probability: f64,
    #[serde(default)]
    pub proteins: Vec<String>,
}

/// Probabilistic site scores computed for one modification mass of a spectrum match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteScoreEntry {
    pub mass: f64,
    pub scores: BTreeMap<usize, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumMatchEntry {
    pub spectrum_file: String,
    pub spectrum_title: String,
    pub charge: i32,
    #[serde(default = "default_true")]
    pub validated: bool,
    pub assumptions: Vec<AssumptionEntry>,
    #[serde(default)]
    pub site_scores: Vec<SiteScoreEntry>,
}

/// An identification project: the search's modification definitions, protein sequences and
/// spectrum matches with their peptide assumptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub modifications: Vec<Modification>,
    #[serde(default)]
    pub variable_modifications: Vec<String>,
    #[serde(default)]
    pub proteins: Vec<ProteinEntry>,
    #[serde(default)]
    pub spectrum_matches: Vec<SpectrumMatchEntry>,
}

impl Project {
    /// Read a JSON project from `path`, `-` meaning STDIN. Gzip compressed files are
    /// recognized by their `.gz` extension.
    pub fn read(path: &str) -> Result<Self, PtmLocalizerError> {
        let reader: Box<dyn BufRead> = if path == "-" {
            Box::new(io::BufReader::new(io::stdin().lock()))
        } else {
            let handle = io::BufReader::new(fs::File::open(path)?);
            if Path::new(path).extension().is_some_and(|ext| ext == "gz") {
                Box::new(io::BufReader::new(GzDecoder::new(handle)))
            } else {
                Box::new(handle)
            }
        };
        let project: Project = serde_json::from_reader(reader)?;
        debug!(
            "Read {} modifications, {} proteins and {} spectrum matches",
            project.modifications.len(),
            project.proteins.len(),
            project.spectrum_matches.len()
        );
        Ok(project)
    }

    /// The variable modifications named by the project or `requested` which the project
    /// does not define
    pub fn undefined_modifications<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .filter(|name| !self.modifications.iter().any(|m| &m.name == *name))
            .map(|s| s.as_str())
            .collect()
    }

    /// Split the project into the pieces the localization engine consumes
    pub fn into_parts(
        self,
        tolerance: Tolerance,
    ) -> (ModificationTable, TabulatedSiteScorer, InMemoryMatchStore) {
        let registry: ModificationTable = self.modifications.into_iter().collect();
        let store = InMemoryMatchStore::new();
        for protein in self.proteins {
            store.add_protein_sequence(protein.accession, protein.sequence);
        }

        let mut scores = HashMap::new();
        for entry in self.spectrum_matches {
            let mut spectrum_match =
                SpectrumMatch::new(entry.spectrum_file, entry.spectrum_title, entry.charge);
            spectrum_match.validated = entry.validated;
            for assumption in entry.assumptions {
                let modifications = assumption
                    .modifications
                    .into_iter()
                    .map(|m| {
                        if registry.get_modification(&m.name).is_none() {
                            warn!(
                                "{} on {} is not a defined modification",
                                m.name, spectrum_match.key
                            );
                        }
                        ModificationMatch::new(m.name, m.site, m.variable)
                    })
                    .collect();
                let mut peptide_assumption = PeptideAssumption::new(
                    Peptide::with_modifications(assumption.sequence, modifications),
                    assumption.probability,
                );
                peptide_assumption.proteins = assumption.proteins;
                spectrum_match.add_assumption(peptide_assumption);
            }
            if !entry.site_scores.is_empty() {
                scores.insert(spectrum_match.key.clone(), entry.site_scores);
            }
            store.insert_spectrum_match(spectrum_match);
        }

        let scorer = TabulatedSiteScorer { scores, tolerance };
        (registry, scorer, store)
    }
}

/// A [`SiteProbabilityScorer`] serving site scores computed ahead of time, keyed by spectrum
/// match and modification mass.
///
/// The same table serves every scoring method.
#[derive(Debug, Clone)]
pub struct TabulatedSiteScorer {
    scores: HashMap<String, Vec<SiteScoreEntry>>,
    tolerance: Tolerance,
}

impl TabulatedSiteScorer {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl SiteProbabilityScorer for TabulatedSiteScorer {
    fn score_sites(
        &self,
        spectrum_match: &SpectrumMatch,
        _peptide: &Peptide,
        modifications: &[&Modification],
        _method: ProbabilisticScore,
    ) -> BTreeMap<usize, f64> {
        let Some(entries) = self.scores.get(&spectrum_match.key) else {
            return BTreeMap::new();
        };
        entries
            .iter()
            .find(|entry| {
                modifications
                    .iter()
                    .any(|m| self.tolerance.test(entry.mass, m.mass))
            })
            .map(|entry| entry.scores.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PROJECT: &str = r#"{
        "modifications": [
            {"name": "Phospho", "mass": 79.966331, "residues": ["S", "T", "Y"]},
            {"name": "Oxidation", "mass": 15.994915, "residues": ["M"]}
        ],
        "variable_modifications": ["Phospho", "Oxidation"],
        "proteins": [{"accession": "PROT1", "sequence": "MKPESAAASKR"}],
        "spectrum_matches": [
            {
                "spectrum_file": "run",
                "spectrum_title": "1",
                "charge": 2,
                "assumptions": [
                    {
                        "sequence": "PESAAASK",
                        "modifications": [{"name": "Phospho", "site": 3}],
                        "probability": 0.01,
                        "proteins": ["PROT1"]
                    }
                ],
                "site_scores": [{"mass": 79.9663, "scores": {"3": 99.0, "7": 1.0}}]
            }
        ]
    }"#;

    #[test]
    fn test_into_parts() {
        let project: Project = serde_json::from_str(PROJECT).unwrap();
        assert!(project
            .undefined_modifications(&["Phospho".to_string(), "Acetyl".to_string()])
            .contains(&"Acetyl"));

        let (registry, scorer, store) = project.into_parts(Tolerance::Da(0.001));
        assert_eq!(registry.len(), 2);
        assert_eq!(scorer.len(), 1);

        let sm = ptmlocalize::MatchStore::spectrum_match(&store, "run:1").unwrap();
        assert!(sm.validated);
        let best = sm.best_peptide.as_ref().unwrap();
        assert_eq!(best.proteins, vec!["PROT1".to_string()]);
        assert_eq!(best.peptide.modification_matches[0].site, 3);

        let phospho = registry.get_modification("Phospho").unwrap();
        let oxidation = registry.get_modification("Oxidation").unwrap();
        let scores = scorer.score_sites(
            &sm,
            &best.peptide,
            &[phospho],
            ProbabilisticScore::PhosphoRs,
        );
        assert_eq!(scores.get(&3), Some(&99.0));
        assert!(scorer
            .score_sites(&sm, &best.peptide, &[oxidation], ProbabilisticScore::AScore)
            .is_empty());
    }
}
