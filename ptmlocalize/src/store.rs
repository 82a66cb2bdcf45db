//! Access to the spectrum, peptide and protein matches of an identification run.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};
use std::vec;

use tracing::debug;

use crate::matches::{PeptideMatch, ProteinMatch, SpectrumMatch};

/// A store of matches shared by every stage of the engine.
///
/// Matches are handed out by value and written back with the `update_*` methods, which
/// must be visible to any later read from the same process.
pub trait MatchStore: Send + Sync {
    fn spectrum_match(&self, key: &str) -> Option<SpectrumMatch>;
    fn update_spectrum_match(&self, spectrum_match: SpectrumMatch);

    fn peptide_match(&self, key: &str) -> Option<PeptideMatch>;
    fn update_peptide_match(&self, peptide_match: PeptideMatch);
    fn remove_peptide_match(&self, key: &str) -> Option<PeptideMatch>;

    fn protein_match(&self, accession: &str) -> Option<ProteinMatch>;
    fn update_protein_match(&self, protein_match: ProteinMatch);

    fn spectrum_files(&self) -> Vec<String>;
    fn spectrum_match_keys(&self, spectrum_file: &str) -> Vec<String>;
    fn peptide_match_keys(&self) -> Vec<String>;
    fn protein_match_keys(&self) -> Vec<String>;

    fn protein_sequence(&self, accession: &str) -> Option<String>;

    fn spectrum_match_count(&self) -> usize {
        self.spectrum_files()
            .iter()
            .map(|f| self.spectrum_match_keys(f).len())
            .sum()
    }

    fn psm_iterator(&self, spectrum_file: &str) -> PsmIterator {
        PsmIterator::new(self.spectrum_match_keys(spectrum_file))
    }
}

/// A thread-safe cursor over the spectrum match keys of one spectrum file
#[derive(Debug)]
pub struct PsmIterator {
    keys: Mutex<vec::IntoIter<String>>,
    len: usize,
}

impl PsmIterator {
    pub fn new(keys: Vec<String>) -> Self {
        let len = keys.len();
        Self {
            keys: Mutex::new(keys.into_iter()),
            len,
        }
    }

    pub fn next_key(&self) -> Option<String> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A [`MatchStore`] holding everything in memory
#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    spectrum_matches: RwLock<HashMap<String, SpectrumMatch>>,
    spectrum_files: RwLock<BTreeMap<String, Vec<String>>>,
    peptide_matches: RwLock<BTreeMap<String, PeptideMatch>>,
    protein_matches: RwLock<BTreeMap<String, ProteinMatch>>,
    protein_sequences: RwLock<HashMap<String, String>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_protein_sequence(&self, accession: impl Into<String>, sequence: impl Into<String>) {
        self.protein_sequences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(accession.into(), sequence.into());
    }

    /// Add a new spectrum match, registering it under its spectrum file
    pub fn insert_spectrum_match(&self, spectrum_match: SpectrumMatch) {
        let key = spectrum_match.key.clone();
        let file = spectrum_match.spectrum_file.clone();
        let previous = self
            .spectrum_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), spectrum_match);
        if previous.is_none() {
            self.spectrum_files
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(file)
                .or_default()
                .push(key);
        }
    }

    /// Group validated spectrum matches into peptide matches by the matching key of their best
    /// peptide, then attach those peptide matches to protein matches by accession.
    ///
    /// Any existing peptide and protein matches are replaced.
    pub fn group_matches(&self) -> (usize, usize) {
        let mut peptides: BTreeMap<String, PeptideMatch> = BTreeMap::new();
        let mut proteins: BTreeMap<String, ProteinMatch> = BTreeMap::new();
        for file in self.spectrum_files() {
            for key in self.spectrum_match_keys(&file) {
                let Some(sm) = self.spectrum_match(&key) else {
                    continue;
                };
                if !sm.validated {
                    continue;
                }
                let Some(best) = sm.best_peptide.as_ref() else {
                    continue;
                };
                let peptide_key = best.peptide.matching_key();
                let peptide_match = peptides
                    .entry(peptide_key.clone())
                    .or_insert_with(|| PeptideMatch::new(best.peptide.clone()));
                peptide_match.spectrum_match_keys.push(key.clone());
                for accession in best.proteins.iter() {
                    let protein_match = proteins
                        .entry(accession.clone())
                        .or_insert_with(|| ProteinMatch::new(accession.clone()));
                    if !protein_match.peptide_match_keys.contains(&peptide_key) {
                        protein_match.peptide_match_keys.push(peptide_key.clone());
                    }
                }
            }
        }
        let counts = (peptides.len(), proteins.len());
        debug!(
            "Grouped matches into {} peptides and {} proteins",
            counts.0, counts.1
        );
        *self
            .peptide_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner) = peptides;
        *self
            .protein_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner) = proteins;
        counts
    }
}

impl MatchStore for InMemoryMatchStore {
    fn spectrum_match(&self, key: &str) -> Option<SpectrumMatch> {
        self.spectrum_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn update_spectrum_match(&self, spectrum_match: SpectrumMatch) {
        self.insert_spectrum_match(spectrum_match)
    }

    fn peptide_match(&self, key: &str) -> Option<PeptideMatch> {
        self.peptide_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn update_peptide_match(&self, peptide_match: PeptideMatch) {
        self.peptide_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peptide_match.key.clone(), peptide_match);
    }

    fn remove_peptide_match(&self, key: &str) -> Option<PeptideMatch> {
        self.peptide_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    fn protein_match(&self, accession: &str) -> Option<ProteinMatch> {
        self.protein_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(accession)
            .cloned()
    }

    fn update_protein_match(&self, protein_match: ProteinMatch) {
        self.protein_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protein_match.accession.clone(), protein_match);
    }

    fn spectrum_files(&self) -> Vec<String> {
        self.spectrum_files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn spectrum_match_keys(&self, spectrum_file: &str) -> Vec<String> {
        self.spectrum_files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(spectrum_file)
            .cloned()
            .unwrap_or_default()
    }

    fn peptide_match_keys(&self) -> Vec<String> {
        self.peptide_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn protein_match_keys(&self) -> Vec<String> {
        self.protein_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn protein_sequence(&self, accession: &str) -> Option<String> {
        self.protein_sequences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(accession)
            .cloned()
    }
}
