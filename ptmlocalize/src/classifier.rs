//! Turn site scores into confidence tiers and decide where each modification sits.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{instrument, trace};

use crate::error::InconsistencyError;
use crate::flr::PsmPtmMap;
use crate::matches::SpectrumMatch;
use crate::modification::{possible_sites, similar_modifications, MassKey, ModificationRegistry};
use crate::params::{PtmScoringParams, DELTA_SCORE_THRESHOLD};
use crate::peptide::Peptide;
use crate::scoring::variable_modifications_by_mass;
use crate::selector::{RepresentativeSiteSelector, ScoredSite};
use crate::site::{PtmScores, SiteConfidence};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationSummary {
    pub confident_sites: usize,
    pub ambiguous_sites: usize,
}

/// The confidence tier implied by a delta score alone
pub fn delta_score_confidence(delta_score: f64) -> SiteConfidence {
    if delta_score <= 0.0 {
        SiteConfidence::Random
    } else if delta_score <= DELTA_SCORE_THRESHOLD {
        SiteConfidence::Doubtful
    } else {
        SiteConfidence::Confident
    }
}

/// Move the modification matches at `indices` onto `sites`. Matches already on one of
/// the sites stay there, the rest take the remaining sites in ascending order, switching
/// to a modification possible at their new site when needed.
pub(crate) fn relocate(
    peptide: &mut Peptide,
    indices: &[usize],
    sites: &[usize],
    names_at: &BTreeMap<usize, Vec<String>>,
) {
    let mut used = BTreeSet::new();
    let mut movers = Vec::new();
    for i in indices.iter().copied() {
        let site = peptide.modification_matches[i].site;
        if sites.contains(&site) && used.insert(site) {
            continue;
        }
        movers.push(i);
    }
    let mut free = sites.iter().filter(|s| !used.contains(*s)).copied();
    for i in movers {
        let Some(site) = free.next() else {
            break;
        };
        let m = &mut peptide.modification_matches[i];
        trace!("Moving {} from {} to {}", m.name, m.site, site);
        m.site = site;
        if let Some(names) = names_at.get(&site) {
            if !names.contains(&m.name) {
                if let Some(name) = names.first() {
                    m.name = name.clone();
                }
            }
        }
    }
}

struct RankedSite {
    site: usize,
    probabilistic_score: f64,
    delta_score: f64,
}

pub struct SiteClassifier<'a, R: ModificationRegistry + ?Sized> {
    registry: &'a R,
    params: &'a PtmScoringParams,
}

impl<'a, R: ModificationRegistry + ?Sized> SiteClassifier<'a, R> {
    pub fn new(registry: &'a R, params: &'a PtmScoringParams) -> Self {
        Self { registry, params }
    }

    /// Classify every modification site of the best peptide of `spectrum_match`.
    ///
    /// Confident sites are recorded and their matches flagged, the remaining matches are moved
    /// onto representative sites and the competing sites are recorded as ambiguous groups.
    /// Classifying the same match again gives the same result.
    #[instrument(level = "debug", skip_all, fields(key = %spectrum_match.key))]
    pub fn classify(
        &self,
        spectrum_match: &mut SpectrumMatch,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<ClassificationSummary, InconsistencyError> {
        let Some(mut peptide) = spectrum_match.best_peptide().cloned() else {
            return Ok(ClassificationSummary::default());
        };
        if peptide.modification_matches.is_empty() {
            return Ok(ClassificationSummary::default());
        }
        let mut scores = spectrum_match.ptm_scores.take().unwrap_or_default();
        let result =
            self.classify_peptide(&mut peptide, &mut scores, spectrum_match.charge, flr_map);
        spectrum_match.ptm_scores = Some(scores);
        let summary = result?;
        if let Some(best) = spectrum_match.best_peptide.as_mut() {
            best.peptide = peptide;
        }
        Ok(summary)
    }

    fn doubtful_threshold(&self, mass: f64, charge: i32, flr_map: Option<&PsmPtmMap>) -> f64 {
        if self.params.estimate_flr {
            if let Some(limit) = flr_map.and_then(|map| map.score_limit(mass, charge)) {
                return -limit;
            }
        }
        self.params.probabilistic_score_threshold
    }

    pub(crate) fn classify_peptide(
        &self,
        peptide: &mut Peptide,
        scores: &mut PtmScores,
        charge: i32,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<ClassificationSummary, InconsistencyError> {
        let method = self.params.probabilistic_score;
        let mut summary = ClassificationSummary::default();

        scores.reset_sites();
        for (_, scoring) in scores.scorings_mut() {
            scoring.clear_confidence();
        }

        let mut occupied: BTreeSet<usize> = BTreeSet::new();
        for m in peptide.modification_matches.iter_mut() {
            if m.variable {
                m.confident = false;
            } else {
                m.confident = true;
                scores
                    .scoring_mut(&m.name)
                    .set_confidence(m.site, SiteConfidence::VeryConfident);
                occupied.insert(m.site);
            }
        }

        let by_mass = variable_modifications_by_mass(self.registry, self.params, peptide)?;
        let mut pool: Vec<ScoredSite> = Vec::new();
        let mut to_select: BTreeMap<MassKey, usize> = BTreeMap::new();

        for (key, (mass, occurrences)) in by_mass.iter() {
            let similar = similar_modifications(
                self.registry,
                &self.params.variable_modifications,
                *mass,
                self.params.tolerance(),
            );
            let mut candidates = possible_sites(self.registry, &peptide.sequence, &similar);
            // the search engine's own placements are always candidates
            for i in occurrences.iter() {
                let m = &peptide.modification_matches[*i];
                candidates
                    .entry(m.site)
                    .or_insert_with(|| vec![m.name.clone()]);
            }
            let n = occurrences.len();
            let candidate_count = candidates.len();
            let distinct_sites: BTreeSet<usize> = occurrences
                .iter()
                .map(|i| peptide.modification_matches[*i].site)
                .collect();
            if candidate_count < n || distinct_sites.len() < n {
                return Err(InconsistencyError::TooFewCandidateSites {
                    peptide: peptide.to_string(),
                    mass: *mass,
                    occurrences: n,
                    candidates: candidate_count.min(distinct_sites.len()),
                });
            }

            if candidate_count == n {
                let sites: Vec<usize> = candidates.keys().copied().collect();
                relocate(peptide, occurrences, &sites, &candidates);
                for i in occurrences.iter() {
                    let m = &mut peptide.modification_matches[*i];
                    m.confident = true;
                    scores
                        .scoring_mut(&m.name)
                        .set_confidence(m.site, SiteConfidence::VeryConfident);
                    scores.add_confident(m.site, &m.name);
                    occupied.insert(m.site);
                }
                summary.confident_sites += n;
                to_select.insert(*key, 0);
                continue;
            }

            let names: Vec<String> = similar.iter().map(|m| m.name.clone()).collect();
            let has_probabilistic_scores = names
                .iter()
                .filter_map(|n| scores.scoring(n))
                .any(|s| s.has_probabilistic_scores());
            let use_delta = !self.params.probabilistic_score_calculation
                || (n > 1 && !method.supports_multiple_occurrences())
                || !has_probabilistic_scores;

            let mut confident_here = 0;
            if use_delta {
                for i in occurrences.iter() {
                    let m = &mut peptide.modification_matches[*i];
                    let delta = scores
                        .scoring(&m.name)
                        .and_then(|s| s.delta_score(m.site))
                        .unwrap_or_default();
                    let mut tier = delta_score_confidence(delta);
                    // a site claimed by another mass is left to the representative selection
                    if occupied.contains(&m.site) {
                        tier = tier.min(SiteConfidence::Doubtful);
                    }
                    scores.scoring_mut(&m.name).set_confidence(m.site, tier);
                    if tier.is_confident() {
                        m.confident = true;
                        scores.add_confident(m.site, &m.name);
                        occupied.insert(m.site);
                        confident_here += 1;
                    }
                }
            } else {
                let mut ranked: Vec<RankedSite> = candidates
                    .iter()
                    .filter(|(site, _)| !occupied.contains(*site))
                    .map(|(site, names)| RankedSite {
                        site: *site,
                        probabilistic_score: scores
                            .best_probabilistic_score(names, *site)
                            .unwrap_or_default(),
                        delta_score: scores.best_delta_score(names, *site).unwrap_or_default(),
                    })
                    .collect();
                ranked.sort_by(|a, b| {
                    b.probabilistic_score
                        .total_cmp(&a.probabilistic_score)
                        .then_with(|| b.delta_score.total_cmp(&a.delta_score))
                        .then_with(|| a.site.cmp(&b.site))
                });
                if ranked.len() < n {
                    return Err(InconsistencyError::TooFewCandidateSites {
                        peptide: peptide.to_string(),
                        mass: *mass,
                        occurrences: n,
                        candidates: ranked.len(),
                    });
                }

                // name each chosen site after the best scoring modification possible there
                let mut best_names: BTreeMap<usize, Vec<String>> = BTreeMap::new();
                for r in ranked[..n].iter() {
                    let mut site_names = candidates.get(&r.site).cloned().unwrap_or_default();
                    site_names.sort_by(|a, b| {
                        let score = |name: &String| {
                            scores
                                .scoring(name)
                                .and_then(|s| s.probabilistic_score(r.site))
                                .unwrap_or_default()
                        };
                        score(b).total_cmp(&score(a))
                    });
                    best_names.insert(r.site, site_names);
                }
                let top_sites: Vec<usize> = ranked[..n].iter().map(|r| r.site).collect();
                relocate(peptide, occurrences, &top_sites, &best_names);

                let random_floor = method.random_floor(n, candidate_count);
                let tie_score = ranked.get(n).map(|r| r.probabilistic_score);
                let doubtful = self.doubtful_threshold(*mass, charge, flr_map);
                for i in occurrences.iter() {
                    let m = &mut peptide.modification_matches[*i];
                    let score = ranked
                        .iter()
                        .find(|r| r.site == m.site)
                        .map(|r| r.probabilistic_score)
                        .unwrap_or_default();
                    let tier = if score <= random_floor || tie_score.is_some_and(|t| score <= t) {
                        SiteConfidence::Random
                    } else if score <= doubtful {
                        SiteConfidence::Doubtful
                    } else {
                        SiteConfidence::VeryConfident
                    };
                    scores.scoring_mut(&m.name).set_confidence(m.site, tier);
                    if tier.is_confident() {
                        m.confident = true;
                        scores.add_confident(m.site, &m.name);
                        occupied.insert(m.site);
                        confident_here += 1;
                    }
                }
            }

            summary.confident_sites += confident_here;
            to_select.insert(*key, n - confident_here);
            for (site, names) in candidates.iter() {
                if occupied.contains(site) {
                    continue;
                }
                let probabilistic_score = if use_delta {
                    0.0
                } else {
                    scores
                        .best_probabilistic_score(names, *site)
                        .unwrap_or_default()
                };
                pool.push(ScoredSite::new(
                    *site,
                    *key,
                    probabilistic_score,
                    scores.best_delta_score(names, *site).unwrap_or_default(),
                    names.clone(),
                ));
            }
        }

        pool.retain(|entry| !occupied.contains(&entry.site));
        let selection = RepresentativeSiteSelector::new(pool).select(&to_select)?;

        for (key, (_, occurrences)) in by_mass.iter() {
            let Some(groups) = selection.get(key) else {
                continue;
            };
            let pending: Vec<usize> = occurrences
                .iter()
                .copied()
                .filter(|i| !peptide.modification_matches[*i].confident)
                .collect();
            let representatives: Vec<usize> = groups.keys().copied().collect();
            let names_at: BTreeMap<usize, Vec<String>> = groups
                .iter()
                .filter_map(|(rep, group)| group.get(rep).map(|names| (*rep, names.clone())))
                .collect();
            relocate(peptide, &pending, &representatives, &names_at);
        }
        for (_, groups) in selection {
            for (representative, group) in groups {
                scores.add_ambiguous_group(representative, group);
                summary.ambiguous_sites += 1;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::{params, psm, registry};
    use crate::modification::{Modification, ModificationPosition, ModificationTable};
    use crate::params::ProbabilisticScore;

    fn set_scores(
        sm: &mut SpectrumMatch,
        name: &str,
        delta: &[(usize, f64)],
        probabilistic: &[(usize, f64)],
    ) {
        let scoring = sm.ptm_scores_mut().scoring_mut(name);
        for (site, d) in delta {
            scoring.set_delta_score(*site, *d);
        }
        for (site, p) in probabilistic {
            scoring.set_probabilistic_score(*site, *p);
        }
    }

    fn sites_of(sm: &SpectrumMatch) -> Vec<(usize, bool)> {
        sm.best_peptide()
            .unwrap()
            .variable_modifications()
            .map(|m| (m.site, m.confident))
            .collect()
    }

    #[test]
    fn test_delta_tiers() {
        assert_eq!(delta_score_confidence(0.0), SiteConfidence::Random);
        assert_eq!(delta_score_confidence(95.0), SiteConfidence::Doubtful);
        assert_eq!(delta_score_confidence(95.5), SiteConfidence::Confident);
    }

    #[test]
    fn test_forced_assignment() {
        let registry = registry();
        let params = params();
        let classifier = SiteClassifier::new(&registry, &params);
        // two phosphorylations, only S2 and T5 can carry them
        let mut sm = psm("run", "1", "ASPKTR", &[(&[("Phospho", 2), ("Phospho", 5)], 0.01)]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 2);
        assert_eq!(summary.ambiguous_sites, 0);
        assert_eq!(sites_of(&sm), vec![(2, true), (5, true)]);
        let scores = sm.ptm_scores.as_ref().unwrap();
        assert_eq!(scores.ambiguous_groups().count(), 0);
        assert_eq!(
            scores.scoring("Phospho").unwrap().confidence(5),
            Some(SiteConfidence::VeryConfident)
        );
    }

    #[test]
    fn test_too_few_sites() {
        let registry = registry();
        let params = params();
        let classifier = SiteClassifier::new(&registry, &params);
        let mut sm = psm("run", "1", "ASPKR", &[(&[("Phospho", 2), ("Phospho", 2)], 0.01)]);
        assert!(matches!(
            classifier.classify(&mut sm, None),
            Err(InconsistencyError::TooFewCandidateSites { .. })
        ));
    }

    #[test]
    fn test_delta_classification() {
        let registry = registry();
        let mut params = params();
        params.probabilistic_score_calculation = false;
        let classifier = SiteClassifier::new(&registry, &params);

        let mut sm = psm("run", "1", "PESTYK", &[(&[("Phospho", 3)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[(3, 97.0)], &[]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 1);
        assert_eq!(sites_of(&sm), vec![(3, true)]);
        assert_eq!(summary.ambiguous_sites, 0);

        let mut sm = psm("run", "2", "PESTYK", &[(&[("Phospho", 4)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[(4, 40.0), (3, 12.0)], &[]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 0);
        assert_eq!(summary.ambiguous_sites, 1);
        assert_eq!(sites_of(&sm), vec![(4, false)]);
        let scores = sm.ptm_scores.as_ref().unwrap();
        let group = scores.ambiguous_group(4).unwrap();
        assert_eq!(group.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(
            scores.scoring("Phospho").unwrap().confidence(4),
            Some(SiteConfidence::Doubtful)
        );
    }

    #[test]
    fn test_probabilistic_classification() {
        let registry = registry();
        let params = params();
        let classifier = SiteClassifier::new(&registry, &params);

        // the search engine placed the phosphorylation on S3, the evidence says Y5
        let mut sm = psm("run", "1", "PESTYK", &[(&[("Phospho", 3)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[(3, 10.0)], &[(3, 2.0), (4, 1.0), (5, 97.0)]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 1);
        assert_eq!(sites_of(&sm), vec![(5, true)]);
        assert_eq!(
            sm.ptm_scores.as_ref().unwrap().scoring("Phospho").unwrap().confidence(5),
            Some(SiteConfidence::VeryConfident)
        );

        // a tie between the two best sites can not be resolved
        let mut sm = psm("run", "2", "PESTYK", &[(&[("Phospho", 3)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[], &[(3, 48.0), (4, 48.0), (5, 4.0)]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 0);
        let scores = sm.ptm_scores.as_ref().unwrap();
        assert_eq!(
            scores.scoring("Phospho").unwrap().confidence(3),
            Some(SiteConfidence::Random)
        );
        assert_eq!(scores.representative_sites().collect::<Vec<_>>(), vec![3]);

        // above the random floor of 33.3 but below the threshold
        let mut sm = psm("run", "3", "PESTYK", &[(&[("Phospho", 3)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[], &[(3, 20.0), (4, 70.0), (5, 10.0)]);
        classifier.classify(&mut sm, None).unwrap();
        assert_eq!(sites_of(&sm), vec![(4, false)]);
        assert_eq!(
            sm.ptm_scores.as_ref().unwrap().scoring("Phospho").unwrap().confidence(4),
            Some(SiteConfidence::Doubtful)
        );
    }

    #[test]
    fn test_flr_threshold() {
        let registry = registry();
        let mut params = params();
        params.estimate_flr = true;
        let classifier = SiteClassifier::new(&registry, &params);

        let mut flr_map = PsmPtmMap::new();
        let mut sm = psm("run", "1", "PESTYK", &[(&[("Phospho", 3)], 0.01)]);
        for i in 0..10 {
            flr_map.add_point(crate::fixtures::PHOSPHO, -(90.0 - i as f64), &sm, false);
        }
        flr_map.add_point(crate::fixtures::PHOSPHO, -50.0, &sm, true);
        flr_map.finalize(1.0, 1);
        assert_eq!(flr_map.score_limit(crate::fixtures::PHOSPHO, 2), Some(-81.0));

        set_scores(&mut sm, "Phospho", &[], &[(3, 85.0), (4, 10.0), (5, 5.0)]);
        classifier.classify(&mut sm, Some(&flr_map)).unwrap();
        assert_eq!(sites_of(&sm), vec![(3, true)]);

        classifier.classify(&mut sm, None).unwrap();
        assert_eq!(sites_of(&sm), vec![(3, false)]);
    }

    #[test]
    fn test_a_score_with_multiple_occurrences_uses_delta() {
        let registry = registry();
        let mut params = params();
        params.probabilistic_score = ProbabilisticScore::AScore;
        let classifier = SiteClassifier::new(&registry, &params);
        let mut sm = psm("run", "1", "SSTSK", &[(&[("Phospho", 1), ("Phospho", 3)], 0.01)]);
        set_scores(&mut sm, "Phospho", &[(1, 99.0), (3, 50.0)], &[(2, 100.0), (4, 100.0)]);
        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 1);
        assert_eq!(sites_of(&sm), vec![(1, true), (3, false)]);
    }

    #[test]
    fn test_site_claimed_by_another_mass() {
        let registry = ModificationTable::from_iter([
            Modification::new("Acetyl", 42.010565, ModificationPosition::Anywhere, vec!['K']),
            Modification::new("Trimethyl", 42.04695, ModificationPosition::Anywhere, vec!['K']),
        ]);
        let params = PtmScoringParams {
            variable_modifications: vec!["Acetyl".into(), "Trimethyl".into()],
            ..params()
        };
        let classifier = SiteClassifier::new(&registry, &params);
        let mut sm = psm("run", "1", "AKAKAK", &[(&[("Acetyl", 2), ("Trimethyl", 4)], 0.01)]);
        set_scores(&mut sm, "Acetyl", &[], &[(2, 0.5), (4, 99.0), (6, 0.5)]);
        set_scores(&mut sm, "Trimethyl", &[(4, 99.0)], &[]);

        let summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(summary.confident_sites, 1);
        assert_eq!(summary.ambiguous_sites, 1);
        let peptide = sm.best_peptide().unwrap();
        let placed: Vec<(&str, usize, bool)> = peptide
            .variable_modifications()
            .map(|m| (m.name.as_str(), m.site, m.confident))
            .collect();
        assert_eq!(placed, vec![("Acetyl", 4, true), ("Trimethyl", 2, false)]);

        let scores = sm.ptm_scores.as_ref().unwrap();
        let confident: Vec<usize> = scores.confident_sites().map(|(site, _)| *site).collect();
        assert_eq!(confident, vec![4]);
        assert!(scores.confident_sites().all(|(_, names)| names == &["Acetyl".to_string()]));
        assert_eq!(
            scores.scoring("Trimethyl").unwrap().confidence(4),
            Some(SiteConfidence::Doubtful)
        );
        let group = scores.ambiguous_group(2).unwrap();
        assert_eq!(group.keys().copied().collect::<Vec<_>>(), vec![2, 6]);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let registry = registry();
        let params = params();
        let classifier = SiteClassifier::new(&registry, &params);
        let mut sm = psm(
            "run",
            "1",
            "MPESTYKSM",
            &[(&[("Phospho", 4), ("Phospho", 8), ("Oxidation", 1)], 0.01)],
        );
        set_scores(
            &mut sm,
            "Phospho",
            &[(4, 30.0)],
            &[(4, 40.0), (5, 60.0), (6, 99.0), (8, 1.0)],
        );
        set_scores(&mut sm, "Oxidation", &[(1, 50.0)], &[(1, 50.0), (9, 50.0)]);
        let first_summary = classifier.classify(&mut sm, None).unwrap();
        let first = sm.clone();
        let second_summary = classifier.classify(&mut sm, None).unwrap();
        assert_eq!(first_summary, second_summary);
        assert_eq!(first, sm);

        let mut seen = BTreeSet::new();
        for (_, group) in sm.ptm_scores.as_ref().unwrap().ambiguous_groups() {
            for site in group.keys() {
                assert!(seen.insert(*site));
            }
        }
        for (site, _) in sm.ptm_scores.as_ref().unwrap().confident_sites() {
            assert!(!seen.contains(site));
        }
    }
}
