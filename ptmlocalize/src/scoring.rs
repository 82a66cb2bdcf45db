//! Attach delta and probabilistic site scores to spectrum matches.
use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::InconsistencyError;
use crate::matches::SpectrumMatch;
use crate::modification::{
    grouping_mass, similar_modifications, MassKey, Modification, ModificationRegistry,
};
use crate::params::{ProbabilisticScore, PtmScoringParams};
use crate::peptide::Peptide;

/// A probabilistic site localization scorer such as A-score or PhosphoRS.
///
/// Implementations return a score for every site of `peptide` that could carry any of
/// `modifications`, given the spectrum evidence behind `spectrum_match`. They must not
/// have side effects visible to the engine.
pub trait SiteProbabilityScorer: Send + Sync {
    fn score_sites(
        &self,
        spectrum_match: &SpectrumMatch,
        peptide: &Peptide,
        modifications: &[&Modification],
        method: ProbabilisticScore,
    ) -> BTreeMap<usize, f64>;
}

/// A scorer without spectrum evidence, every site is left unscored
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSiteScorer;

impl SiteProbabilityScorer for NullSiteScorer {
    fn score_sites(
        &self,
        _spectrum_match: &SpectrumMatch,
        _peptide: &Peptide,
        _modifications: &[&Modification],
        _method: ProbabilisticScore,
    ) -> BTreeMap<usize, f64> {
        BTreeMap::new()
    }
}

/// The indices of the variable modifications of a peptide grouped by mass.
///
/// Modifications within the mass tolerance of each other share a group, keyed and valued
/// by their [`grouping_mass`].
pub(crate) fn variable_modifications_by_mass<R: ModificationRegistry + ?Sized>(
    registry: &R,
    params: &PtmScoringParams,
    peptide: &Peptide,
) -> Result<BTreeMap<MassKey, (f64, Vec<usize>)>, InconsistencyError> {
    let mut by_mass: BTreeMap<MassKey, (f64, Vec<usize>)> = BTreeMap::new();
    for (i, m) in peptide.modification_matches.iter().enumerate() {
        if !m.variable {
            continue;
        }
        let mass = grouping_mass(
            registry,
            &params.variable_modifications,
            registry.modification_mass(&m.name)?,
            params.tolerance(),
        );
        by_mass
            .entry(MassKey::from_mass(mass))
            .or_insert_with(|| (mass, Vec::new()))
            .1
            .push(i);
    }
    Ok(by_mass)
}

/// A single localization point for the false localization rate map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalizationEvidence {
    pub mass: f64,
    pub score: f64,
    pub is_conflict: bool,
}

pub struct ScoreAttacher<'a, R: ModificationRegistry + ?Sized, S: SiteProbabilityScorer + ?Sized> {
    registry: &'a R,
    scorer: &'a S,
    params: &'a PtmScoringParams,
}

impl<'a, R: ModificationRegistry + ?Sized, S: SiteProbabilityScorer + ?Sized>
    ScoreAttacher<'a, R, S>
{
    pub fn new(registry: &'a R, scorer: &'a S, params: &'a PtmScoringParams) -> Self {
        Self {
            registry,
            scorer,
            params,
        }
    }

    /// Attach delta scores and, when enabled, probabilistic scores to `spectrum_match`
    pub fn attach_scores(
        &self,
        spectrum_match: &mut SpectrumMatch,
    ) -> Result<(), InconsistencyError> {
        self.attach_delta_score(spectrum_match)?;
        if self.params.probabilistic_score_calculation {
            self.attach_probabilistic_score(spectrum_match)?;
        }
        Ok(())
    }

    /// Score each variable modification site of the best peptide by how much better the search
    /// engine rated assumptions placing that mass there than assumptions placing it elsewhere.
    pub fn attach_delta_score(
        &self,
        spectrum_match: &mut SpectrumMatch,
    ) -> Result<(), InconsistencyError> {
        let Some(best) = spectrum_match.best_peptide.as_ref() else {
            return Ok(());
        };
        let peptide = &best.peptide;
        let tolerance = self.params.tolerance();

        let mut seen: BTreeSet<(MassKey, usize)> = BTreeSet::new();
        let mut scores: Vec<(String, usize, f64)> = Vec::new();
        for m in peptide.variable_modifications() {
            let mass = self.registry.modification_mass(&m.name)?;
            let key = MassKey::from_mass(grouping_mass(
                self.registry,
                &self.params.variable_modifications,
                mass,
                tolerance,
            ));
            if !seen.insert((key, m.site)) {
                return Err(InconsistencyError::DuplicateSiteScore {
                    peptide: peptide.to_string(),
                    mass,
                    site: m.site,
                });
            }

            let mut ref_p: Option<f64> = None;
            let mut secondary_p: Option<f64> = None;
            for assumption in spectrum_match.peptide_assumptions.iter() {
                if assumption.peptide.sequence != peptide.sequence {
                    continue;
                }
                let mut found = false;
                let mut at_site = false;
                for other in assumption.peptide.variable_modifications() {
                    let other_mass = self.registry.modification_mass(&other.name)?;
                    if tolerance.test(other_mass, mass) {
                        found = true;
                        if other.site == m.site {
                            at_site = true;
                        }
                    }
                }
                if !found {
                    continue;
                }
                let slot = if at_site {
                    &mut ref_p
                } else {
                    &mut secondary_p
                };
                let probability = assumption.probability;
                *slot = Some(slot.map_or(probability, |p| p.min(probability)));
            }

            let ref_p = ref_p.unwrap_or(best.probability);
            let delta = match secondary_p {
                Some(secondary_p) => ((secondary_p - ref_p).max(0.0) * 100.0).min(100.0),
                None => 0.0,
            };
            scores.push((m.name.clone(), m.site, self.params.round_delta_score(delta)));
        }

        let ptm_scores = spectrum_match.ptm_scores_mut();
        for (_, scoring) in ptm_scores.scorings_mut() {
            scoring.clear_delta_scores();
        }
        for (name, site, delta) in scores {
            trace!("{name}@{site} delta score {delta}");
            ptm_scores.scoring_mut(&name).set_delta_score(site, delta);
        }
        Ok(())
    }

    /// Delegate to the probabilistic scorer for every ambiguous mass of the best peptide and
    /// record each returned site against the modification that can occupy it.
    pub fn attach_probabilistic_score(
        &self,
        spectrum_match: &mut SpectrumMatch,
    ) -> Result<(), InconsistencyError> {
        let Some(peptide) = spectrum_match.best_peptide().cloned() else {
            return Ok(());
        };
        let method = self.params.probabilistic_score;
        let by_mass = variable_modifications_by_mass(self.registry, self.params, &peptide)?;

        let mut recorded: Vec<(String, usize, f64)> = Vec::new();
        let mut cleared: Vec<String> = Vec::new();
        for (_, (mass, occurrences)) in by_mass.iter() {
            if occurrences.len() > 1 && !method.supports_multiple_occurrences() {
                continue;
            }
            let similar = similar_modifications(
                self.registry,
                &self.params.variable_modifications,
                *mass,
                self.params.tolerance(),
            );
            let candidate_sites: BTreeSet<usize> = similar
                .iter()
                .flat_map(|m| self.registry.potential_sites(&peptide.sequence, m))
                .collect();
            if candidate_sites.len() <= occurrences.len() {
                continue;
            }
            cleared.extend(similar.iter().map(|m| m.name.clone()));

            let site_scores = self
                .scorer
                .score_sites(spectrum_match, &peptide, &similar, method);
            for (site, score) in site_scores {
                let modification = self.resolve_site(&peptide, &similar, site, *mass)?;
                recorded.push((modification.name.clone(), site, score));
            }
        }

        let ptm_scores = spectrum_match.ptm_scores_mut();
        for name in cleared {
            ptm_scores.scoring_mut(&name).clear_probabilistic_scores();
        }
        for (name, site, score) in recorded {
            ptm_scores
                .scoring_mut(&name)
                .set_probabilistic_score(site, score);
        }
        Ok(())
    }

    /// Find the modification a scored site belongs to. Terminal sites resolve against
    /// terminal modifications, every other site against the first modification that
    /// can be placed there.
    fn resolve_site<'m>(
        &self,
        peptide: &Peptide,
        similar: &[&'m Modification],
        site: usize,
        mass: f64,
    ) -> Result<&'m Modification, InconsistencyError> {
        let length = peptide.len();
        let found = if site == 0 {
            similar.iter().find(|m| m.is_n_term())
        } else if site == length + 1 {
            similar.iter().find(|m| m.is_c_term())
        } else {
            similar.iter().find(|m| {
                self.registry
                    .potential_sites(&peptide.sequence, m)
                    .contains(&site)
            })
        };
        found
            .copied()
            .ok_or_else(|| InconsistencyError::NoCompatibleModification {
                peptide: peptide.to_string(),
                mass,
                site,
            })
    }

    /// Evidence for the false localization rate map: for each mass placed once on the best
    /// peptide, the best probabilistic score and whether its site differs from the search
    /// engine's placement. Scores are negated so that lower is better.
    pub fn localization_evidence(
        &self,
        spectrum_match: &SpectrumMatch,
    ) -> Result<Vec<LocalizationEvidence>, InconsistencyError> {
        let (Some(peptide), Some(ptm_scores)) =
            (spectrum_match.best_peptide(), spectrum_match.ptm_scores.as_ref())
        else {
            return Ok(Vec::new());
        };
        let mut evidence = Vec::new();
        let by_mass = variable_modifications_by_mass(self.registry, self.params, peptide)?;
        for (_, (mass, occurrences)) in by_mass {
            if occurrences.len() != 1 {
                continue;
            }
            let names: Vec<String> = similar_modifications(
                self.registry,
                &self.params.variable_modifications,
                mass,
                self.params.tolerance(),
            )
            .into_iter()
            .map(|m| m.name.clone())
            .collect();
            let best = names
                .iter()
                .filter_map(|n| ptm_scores.scoring(n))
                .flat_map(|s| s.probabilistic_scores())
                .fold(None, |acc: Option<(usize, f64)>, (site, score)| match acc {
                    Some((_, best)) if best >= *score => acc,
                    _ => Some((*site, *score)),
                });
            if let Some((site, score)) = best {
                let engine_site = peptide.modification_matches[occurrences[0]].site;
                evidence.push(LocalizationEvidence {
                    mass,
                    score: -score,
                    is_conflict: site != engine_site,
                });
            }
        }
        Ok(evidence)
    }
}
