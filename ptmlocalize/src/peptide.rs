use std::fmt::Display;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::modification::ModificationMatch;

/// A peptide sequence and the modifications placed on it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Peptide {
    pub sequence: String,
    #[serde(default)]
    pub modification_matches: Vec<ModificationMatch>,
}

impl Peptide {
    pub fn new(sequence: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            modification_matches: Vec::new(),
        }
    }

    pub fn with_modifications(
        sequence: impl Into<String>,
        modification_matches: Vec<ModificationMatch>,
    ) -> Self {
        Self {
            sequence: sequence.into(),
            modification_matches,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Whether any variable modification is placed on this peptide
    pub fn is_modified(&self) -> bool {
        self.modification_matches.iter().any(|m| m.variable)
    }

    pub fn variable_modifications(&self) -> impl Iterator<Item = &ModificationMatch> {
        self.modification_matches.iter().filter(|m| m.variable)
    }

    /// A key identifying this peptide among others of the same sequence.
    ///
    /// Only confidently localized modifications contribute their site, so peptides that differ
    /// only by the placement of ambiguous modifications share a key.
    pub fn matching_key(&self) -> String {
        let tokens = self
            .variable_modifications()
            .map(|m| {
                if m.confident {
                    format!("{}@{}", m.name, m.site)
                } else {
                    m.name.clone()
                }
            })
            .sorted()
            .join("_");
        if tokens.is_empty() {
            self.sequence.clone()
        } else {
            format!("{}_{}", self.sequence, tokens)
        }
    }

    /// The 1-based start positions of every occurrence of this peptide's sequence in `protein`
    pub fn occurrences_in(&self, protein: &str) -> Vec<usize> {
        sequence_occurrences(protein, &self.sequence)
            .into_iter()
            .map(|i| i + 1)
            .collect()
    }
}

impl Display for Peptide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sequence)?;
        for m in self.variable_modifications() {
            write!(f, " {}@{}", m.name, m.site)?;
        }
        Ok(())
    }
}

/// The 0-based offsets of every, possibly overlapping, occurrence of `needle` in `haystack`
pub fn sequence_occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_matching_key() {
        let mut peptide = Peptide::with_modifications(
            "PEPTSIDE",
            vec![
                ModificationMatch::variable("Phospho", 4),
                ModificationMatch::variable("Oxidation", 1),
                ModificationMatch::fixed("Carbamidomethyl", 2),
            ],
        );
        assert_eq!(peptide.matching_key(), "PEPTSIDE_Oxidation_Phospho");
        peptide.modification_matches[0].confident = true;
        assert_eq!(peptide.matching_key(), "PEPTSIDE_Oxidation_Phospho@4");
        assert_eq!(Peptide::new("PEPTIDE").matching_key(), "PEPTIDE");
    }

    #[test]
    fn test_occurrences() {
        let peptide = Peptide::new("AA");
        assert_eq!(peptide.occurrences_in("AAAB"), vec![1, 2]);
        assert!(Peptide::new("TIDE").occurrences_in("PEP").is_empty());
        assert_eq!(sequence_occurrences("PEPTIDEPEP", "PEP"), vec![0, 7]);
    }
}
