//! Borrow confident localizations across spectrum matches of related sequences.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, trace};

use crate::classifier::SiteClassifier;
use crate::error::InconsistencyError;
use crate::flr::PsmPtmMap;
use crate::modification::{
    possible_sites, similar_modifications, BuildIdentityHasherMassKey, MassKey,
    ModificationRegistry,
};
use crate::params::PtmScoringParams;
use crate::peptide::sequence_occurrences;
use crate::progress::{ProgressRecord, WaitingHandler};
use crate::scoring::variable_modifications_by_mass;
use crate::site::SiteConfidence;
use crate::store::MatchStore;

/// The confident sites of one modification mass on one spectrum match
#[derive(Debug, Clone)]
struct ConfidentLocalization {
    occurrences: usize,
    sites: BTreeSet<usize>,
}

type ConfidentIndex =
    HashMap<MassKey, BTreeMap<String, Vec<ConfidentLocalization>>, BuildIdentityHasherMassKey>;
type UnresolvedIndex = BTreeMap<String, BTreeMap<MassKey, Vec<String>>>;

/// Pair every old site with a distinct new site, closest pairs first.
///
/// Ties are broken on the lower old site, then the lower new site.
fn align_sites(old_sites: &[usize], new_sites: &BTreeSet<usize>) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize, usize)> = old_sites
        .iter()
        .flat_map(|old| new_sites.iter().map(move |new| (old.abs_diff(*new), *old, *new)))
        .collect();
    pairs.sort_unstable();
    let mut used_old = BTreeSet::new();
    let mut used_new = BTreeSet::new();
    let mut aligned = Vec::new();
    for (_, old, new) in pairs {
        if used_old.contains(&old) || used_new.contains(&new) {
            continue;
        }
        used_old.insert(old);
        used_new.insert(new);
        aligned.push((old, new));
    }
    aligned.sort_unstable();
    aligned
}

/// Explains the unresolved modification sites of spectrum matches using the confident
/// sites of other matches with the same or an overlapping sequence.
pub struct PeptideInferenceEngine<'a, R: ModificationRegistry + ?Sized, M: MatchStore + ?Sized> {
    registry: &'a R,
    params: &'a PtmScoringParams,
    store: &'a M,
}

impl<'a, R: ModificationRegistry + ?Sized, M: MatchStore + ?Sized>
    PeptideInferenceEngine<'a, R, M>
{
    pub fn new(registry: &'a R, params: &'a PtmScoringParams, store: &'a M) -> Self {
        Self {
            registry,
            params,
            store,
        }
    }

    /// Re-classify every validated spectrum match and infer sites for those left unresolved.
    ///
    /// Stops early, keeping what was already written, when `handler` is cancelled.
    pub fn run(
        &self,
        handler: &dyn WaitingHandler,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<ProgressRecord, InconsistencyError> {
        let Some((confident, unresolved)) = self.index_matches(handler, flr_map)? else {
            return Ok(ProgressRecord::default());
        };

        let pending: HashSet<&String> = unresolved
            .values()
            .flat_map(|by_mass| by_mass.values().flatten())
            .collect();
        debug!(
            "{} spectrum matches with unresolved sites, {} masses with confident sites",
            pending.len(),
            confident.len()
        );
        handler.set_max_progress(pending.len());

        let mut record = ProgressRecord::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut inferred: HashSet<String> = HashSet::new();
        for (spectrum_file, by_mass) in unresolved.iter() {
            for (mass, keys) in by_mass.iter() {
                let Some(by_sequence) = confident.get(mass) else {
                    for key in keys {
                        if visited.insert(key.clone()) {
                            handler.increase_progress();
                        }
                    }
                    continue;
                };
                for key in keys {
                    if handler.is_cancelled() {
                        info!("Peptide inference cancelled in {spectrum_file}");
                        return Ok(record);
                    }
                    if self.infer_sites(key, *mass, by_sequence)? {
                        inferred.insert(key.clone());
                    }
                    if visited.insert(key.clone()) {
                        handler.increase_progress();
                    }
                }
            }
        }
        record.psms_inferred = inferred.len();
        Ok(record)
    }

    fn index_matches(
        &self,
        handler: &dyn WaitingHandler,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<Option<(ConfidentIndex, UnresolvedIndex)>, InconsistencyError> {
        let classifier = SiteClassifier::new(self.registry, self.params);
        let mut confident = ConfidentIndex::default();
        let mut unresolved = UnresolvedIndex::new();
        handler.set_max_progress(self.store.spectrum_match_count());

        for spectrum_file in self.store.spectrum_files() {
            for key in self.store.spectrum_match_keys(&spectrum_file) {
                if handler.is_cancelled() {
                    info!("Peptide inference cancelled in {spectrum_file}");
                    return Ok(None);
                }
                handler.increase_progress();
                let Some(mut spectrum_match) = self.store.spectrum_match(&key) else {
                    continue;
                };
                if !spectrum_match.validated {
                    continue;
                }
                let Some(peptide) = spectrum_match.best_peptide() else {
                    continue;
                };
                if !peptide.is_modified() {
                    continue;
                }
                classifier.classify(&mut spectrum_match, flr_map)?;
                let Some(peptide) = spectrum_match.best_peptide() else {
                    continue;
                };

                let by_mass = variable_modifications_by_mass(self.registry, self.params, peptide)?;
                for (mass, (_, indices)) in by_mass {
                    let matches: Vec<_> = indices
                        .iter()
                        .map(|i| &peptide.modification_matches[*i])
                        .collect();
                    let positional = matches.iter().all(|m| {
                        self.registry
                            .get_modification(&m.name)
                            .map_or(true, |modification| modification.is_residue_specific())
                    });
                    if !positional {
                        continue;
                    }
                    if matches.iter().all(|m| m.confident) {
                        confident
                            .entry(mass)
                            .or_default()
                            .entry(peptide.sequence.clone())
                            .or_default()
                            .push(ConfidentLocalization {
                                occurrences: matches.len(),
                                sites: matches.iter().map(|m| m.site).collect(),
                            });
                    } else {
                        unresolved
                            .entry(spectrum_file.clone())
                            .or_default()
                            .entry(mass)
                            .or_default()
                            .push(key.clone());
                    }
                }
                self.store.update_spectrum_match(spectrum_match);
            }
        }
        Ok(Some((confident, unresolved)))
    }

    /// Try to place the unresolved modifications of `mass` on the spectrum match `key`.
    /// Returns whether any modification was marked as inferred.
    fn infer_sites(
        &self,
        key: &str,
        mass: MassKey,
        by_sequence: &BTreeMap<String, Vec<ConfidentLocalization>>,
    ) -> Result<bool, InconsistencyError> {
        let Some(mut spectrum_match) = self.store.spectrum_match(key) else {
            return Err(InconsistencyError::MissingMatch {
                kind: "spectrum match",
                key: key.to_string(),
            });
        };
        let Some(peptide) = spectrum_match.best_peptide() else {
            return Ok(false);
        };
        let sequence = peptide.sequence.clone();
        let length = peptide.len();

        let by_mass = variable_modifications_by_mass(self.registry, self.params, peptide)?;
        let Some((mass_value, indices)) = by_mass.get(&mass) else {
            return Ok(false);
        };
        let pending: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|i| !peptide.modification_matches[*i].confident)
            .collect();
        if pending.is_empty() {
            return Ok(false);
        }
        let occupied: BTreeSet<usize> = peptide
            .modification_matches
            .iter()
            .enumerate()
            .filter(|(i, _)| !pending.contains(i))
            .map(|(_, m)| m.site)
            .collect();
        let similar = similar_modifications(
            self.registry,
            &self.params.variable_modifications,
            *mass_value,
            self.params.tolerance(),
        );
        let names_at = possible_sites(self.registry, &sequence, &similar);
        let accept = |site: &usize| names_at.contains_key(site) && !occupied.contains(site);

        let mut candidates: BTreeSet<usize> = BTreeSet::new();
        if let Some(same_sequence) = by_sequence.get(&sequence) {
            for localization in same_sequence
                .iter()
                .filter(|l| l.occurrences == indices.len())
            {
                candidates.extend(localization.sites.iter().filter(|s| accept(s)));
            }
            if candidates.len() < pending.len() {
                for localization in same_sequence.iter() {
                    candidates.extend(localization.sites.iter().filter(|s| accept(s)));
                }
            }
        }
        if candidates.len() < pending.len() {
            for (other, localizations) in by_sequence.iter() {
                if *other == sequence {
                    continue;
                }
                if other.contains(&sequence) {
                    for offset in sequence_occurrences(other, &sequence) {
                        for localization in localizations {
                            candidates.extend(
                                localization
                                    .sites
                                    .iter()
                                    .filter(|s| **s > offset && **s - offset <= length)
                                    .map(|s| s - offset)
                                    .filter(|s| accept(s)),
                            );
                        }
                    }
                } else if sequence.contains(other.as_str()) {
                    for offset in sequence_occurrences(&sequence, other) {
                        for localization in localizations {
                            candidates.extend(
                                localization
                                    .sites
                                    .iter()
                                    .map(|s| s + offset)
                                    .filter(|s| accept(s)),
                            );
                        }
                    }
                }
            }
        }
        if candidates.is_empty() {
            return Ok(false);
        }

        let old_sites: Vec<usize> = pending
            .iter()
            .map(|i| peptide.modification_matches[*i].site)
            .collect();
        let aligned = align_sites(&old_sites, &candidates);
        if aligned.is_empty() {
            return Ok(false);
        }

        let mut moves = Vec::new();
        let mut settled = Vec::new();
        if let Some(best) = spectrum_match.best_peptide.as_mut() {
            for (old, new) in aligned.iter().copied() {
                let Some(i) = pending
                    .iter()
                    .copied()
                    .find(|i| best.peptide.modification_matches[*i].site == old)
                else {
                    continue;
                };
                let m = &mut best.peptide.modification_matches[i];
                m.inferred = true;
                if old == new {
                    trace!("Inferred {} in place at {new} on {key}", m.name);
                    m.confident = true;
                    settled.push((new, m.name.clone()));
                } else {
                    trace!("Inferred {} at {new} instead of {old} on {key}", m.name);
                    m.site = new;
                    if let Some(names) = names_at.get(&new) {
                        if !names.contains(&m.name) {
                            if let Some(name) = names.first() {
                                m.name = name.clone();
                            }
                        }
                    }
                    moves.push((old, new));
                }
            }
        }
        if let Some(scores) = spectrum_match.ptm_scores.as_mut() {
            for (old, new) in moves {
                scores.change_representative_site(old, new);
            }
            for (site, name) in settled {
                scores.remove_ambiguous_group(site);
                scores
                    .scoring_mut(&name)
                    .set_confidence(site, SiteConfidence::Confident);
                scores.add_confident(site, &name);
            }
        }
        self.store.update_spectrum_match(spectrum_match);
        Ok(true)
    }
}
