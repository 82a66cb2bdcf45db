use std::collections::BTreeMap;

use crate::matches::{PeptideAssumption, SpectrumMatch};
use crate::modification::{
    Modification, ModificationMatch, ModificationPosition, ModificationTable,
};
use crate::params::{ProbabilisticScore, PtmScoringParams};
use crate::peptide::Peptide;
use crate::scoring::SiteProbabilityScorer;

pub const PHOSPHO: f64 = 79.966331;
pub const OXIDATION: f64 = 15.994915;

pub fn registry() -> ModificationTable {
    ModificationTable::from_iter([
        Modification::new(
            "Phospho",
            PHOSPHO,
            ModificationPosition::Anywhere,
            vec!['S', 'T', 'Y'],
        ),
        Modification::new(
            "Phospho-NTerm",
            PHOSPHO,
            ModificationPosition::NTerm,
            Vec::new(),
        ),
        Modification::new(
            "Oxidation",
            OXIDATION,
            ModificationPosition::Anywhere,
            vec!['M'],
        ),
        Modification::new(
            "Carbamidomethyl",
            57.021464,
            ModificationPosition::Anywhere,
            vec!['C'],
        ),
    ])
}

pub fn params() -> PtmScoringParams {
    PtmScoringParams {
        variable_modifications: vec!["Phospho".into(), "Oxidation".into()],
        threads: 2,
        ..Default::default()
    }
}

pub fn params_with_terminal() -> PtmScoringParams {
    PtmScoringParams {
        variable_modifications: vec![
            "Phospho".into(),
            "Phospho-NTerm".into(),
            "Oxidation".into(),
        ],
        ..params()
    }
}

pub fn peptide(sequence: &str, modifications: &[(&str, usize)]) -> Peptide {
    Peptide::with_modifications(
        sequence,
        modifications
            .iter()
            .map(|(name, site)| ModificationMatch::variable(*name, *site))
            .collect(),
    )
}

/// A spectrum match whose assumptions all share `sequence`, best first
pub fn psm(
    file: &str,
    title: &str,
    sequence: &str,
    assumptions: &[(&[(&str, usize)], f64)],
) -> SpectrumMatch {
    let mut sm = SpectrumMatch::new(file, title, 2);
    for (modifications, probability) in assumptions {
        let mut assumption = PeptideAssumption::new(peptide(sequence, modifications), *probability);
        assumption.proteins.push("PROT1".to_string());
        sm.add_assumption(assumption);
    }
    sm
}

/// Site scores looked up by spectrum title
#[derive(Debug, Default, Clone)]
pub struct TitleScorer(pub BTreeMap<String, BTreeMap<usize, f64>>);

impl SiteProbabilityScorer for TitleScorer {
    fn score_sites(
        &self,
        spectrum_match: &SpectrumMatch,
        _peptide: &Peptide,
        _modifications: &[&Modification],
        _method: ProbabilisticScore,
    ) -> BTreeMap<usize, f64> {
        self.0
            .get(&spectrum_match.spectrum_title)
            .cloned()
            .unwrap_or_default()
    }
}
