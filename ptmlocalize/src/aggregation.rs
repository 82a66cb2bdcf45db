//! Merge spectrum level localizations into peptide and protein level ones.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, instrument, trace};

use crate::error::InconsistencyError;
use crate::matches::PeptideMatch;
use crate::modification::{
    grouping_mass, possible_sites, similar_modifications, BuildIdentityHasherMassKey, MassKey,
    ModificationMatch, ModificationRegistry,
};
use crate::params::PtmScoringParams;
use crate::peptide::Peptide;
use crate::progress::ProgressRecord;
use crate::scoring::variable_modifications_by_mass;
use crate::selector::{RepresentativeSiteSelector, ScoredSite};
use crate::site::{PtmScores, SiteGroup};
use crate::store::MatchStore;

/// An ambiguous group translated onto a protein, with the masses possible at each of its sites
#[derive(Debug)]
struct ProteinGroup {
    representative: usize,
    sites: SiteGroup,
    masses: BTreeMap<usize, BTreeSet<MassKey>>,
}

impl ProteinGroup {
    fn shares_mass_at(&self, site: usize, masses: &BTreeSet<MassKey>) -> bool {
        self.masses
            .get(&site)
            .is_some_and(|here| !here.is_disjoint(masses))
    }

    fn absorb(&mut self, other: ProteinGroup) {
        for (site, names) in other.sites {
            let entry = self.sites.entry(site).or_default();
            for name in names {
                if !entry.contains(&name) {
                    entry.push(name);
                }
            }
        }
        for (site, masses) in other.masses {
            self.masses.entry(site).or_default().extend(masses);
        }
    }
}

/// Aggregates localization results from spectrum matches up to peptide matches, and from
/// peptide matches up to protein matches.
///
/// Both levels read and write shared records in the [`MatchStore`], so aggregation runs on a
/// single thread once spectrum level scoring is complete.
pub struct AggregationEngine<'a, R: ModificationRegistry + ?Sized, M: MatchStore + ?Sized> {
    registry: &'a R,
    params: &'a PtmScoringParams,
    store: &'a M,
}

impl<'a, R: ModificationRegistry + ?Sized, M: MatchStore + ?Sized> AggregationEngine<'a, R, M> {
    pub fn new(registry: &'a R, params: &'a PtmScoringParams, store: &'a M) -> Self {
        Self {
            registry,
            params,
            store,
        }
    }

    fn mass_key(&self, name: &str) -> Result<MassKey, InconsistencyError> {
        let mass = self.registry.modification_mass(name)?;
        Ok(MassKey::from_mass(grouping_mass(
            self.registry,
            &self.params.variable_modifications,
            mass,
            self.params.tolerance(),
        )))
    }

    fn mass_keys(&self, names: &[String]) -> Result<BTreeSet<MassKey>, InconsistencyError> {
        names.iter().map(|n| self.mass_key(n)).collect()
    }

    /// Merge the localizations of every spectrum match supporting the peptide match `key`,
    /// then re-select representative sites and re-key the peptide match.
    ///
    /// Returns the statistics of the merged peptide. Peptides that are not validated or carry
    /// no variable modification are left untouched.
    #[instrument(level = "debug", skip(self))]
    pub fn score_peptide(&self, key: &str) -> Result<ProgressRecord, InconsistencyError> {
        let mut peptide_match =
            self.store
                .peptide_match(key)
                .ok_or_else(|| InconsistencyError::MissingMatch {
                    kind: "peptide match",
                    key: key.to_string(),
                })?;
        if !peptide_match.validated || !peptide_match.peptide.is_modified() {
            return Ok(ProgressRecord::default());
        }
        let peptide = &peptide_match.peptide;

        let mut scores = PtmScores::new();
        let mut inferred_sites: BTreeSet<(MassKey, usize)> = BTreeSet::new();
        let mut preferential: BTreeMap<MassKey, BTreeSet<usize>> = BTreeMap::new();
        let mut grouped_sites: BTreeMap<MassKey, SiteGroup> = BTreeMap::new();

        for psm_key in peptide_match.spectrum_match_keys.iter() {
            let spectrum_match = self.store.spectrum_match(psm_key).ok_or_else(|| {
                InconsistencyError::MissingMatch {
                    kind: "spectrum match",
                    key: psm_key.clone(),
                }
            })?;
            if let Some(best) = spectrum_match.best_peptide() {
                for m in best.variable_modifications().filter(|m| m.inferred) {
                    let mass = self.mass_key(&m.name)?;
                    inferred_sites.insert((mass, m.site));
                    if !m.confident {
                        preferential.entry(mass).or_default().insert(m.site);
                    }
                }
            }
            // a match that was never scored contributes nothing
            let Some(psm_scores) = spectrum_match.ptm_scores.as_ref() else {
                continue;
            };
            for (name, scoring) in psm_scores.scorings() {
                scores.scoring_mut(name).merge_max(scoring);
            }
            for (site, names) in psm_scores.confident_sites() {
                for name in names {
                    scores.add_confident(*site, name);
                }
            }
            for (_, group) in psm_scores.ambiguous_groups() {
                for (site, names) in group {
                    for name in names {
                        let entry = grouped_sites
                            .entry(self.mass_key(name)?)
                            .or_default()
                            .entry(*site)
                            .or_default();
                        if !entry.contains(name) {
                            entry.push(name.clone());
                        }
                    }
                }
            }
        }

        let by_mass = variable_modifications_by_mass(self.registry, self.params, peptide)?;

        let mut confident_by_mass: HashMap<MassKey, BTreeSet<usize>, BuildIdentityHasherMassKey> =
            HashMap::default();
        for (site, names) in scores.confident_sites() {
            for name in names {
                confident_by_mass
                    .entry(self.mass_key(name)?)
                    .or_default()
                    .insert(*site);
            }
        }
        for (mass, sites) in confident_by_mass.iter() {
            let occurrences = by_mass.get(mass).map(|(_, o)| o.len()).unwrap_or_default();
            if sites.len() > occurrences {
                return Err(InconsistencyError::TooManyConfidentSites {
                    peptide: peptide.to_string(),
                    mass: mass.mass(),
                    confident: sites.len(),
                    occurrences,
                });
            }
        }

        let mut pool = Vec::new();
        let mut to_select = BTreeMap::new();
        for (mass, (mass_value, occurrences)) in by_mass.iter() {
            let confident = confident_by_mass.get(mass).map(|s| s.len()).unwrap_or_default();
            to_select.insert(*mass, occurrences.len() - confident);

            let similar = similar_modifications(
                self.registry,
                &self.params.variable_modifications,
                *mass_value,
                self.params.tolerance(),
            );
            let mut candidates = possible_sites(self.registry, &peptide.sequence, &similar);
            for i in occurrences.iter() {
                let m = &peptide.modification_matches[*i];
                candidates
                    .entry(m.site)
                    .or_insert_with(|| vec![m.name.clone()]);
            }
            if let Some(group_sites) = grouped_sites.get(mass) {
                for (site, names) in group_sites {
                    let entry = candidates.entry(*site).or_default();
                    for name in names {
                        if !entry.contains(name) {
                            entry.push(name.clone());
                        }
                    }
                }
            }
            for (site, names) in candidates {
                if scores.is_confident_site(site) {
                    continue;
                }
                pool.push(ScoredSite::new(
                    site,
                    *mass,
                    scores
                        .best_probabilistic_score(&names, site)
                        .unwrap_or_default(),
                    scores.best_delta_score(&names, site).unwrap_or_default(),
                    names,
                ));
            }
        }

        let selection = RepresentativeSiteSelector::new(pool)
            .with_preferential_sites(preferential)
            .select(&to_select)?;

        let mut modification_matches: Vec<ModificationMatch> = peptide
            .modification_matches
            .iter()
            .filter(|m| !m.variable)
            .cloned()
            .collect();
        let mut record = ProgressRecord {
            peptides_scored: 1,
            ..Default::default()
        };
        for (site, names) in scores.confident_sites() {
            for name in names {
                let mut m = ModificationMatch::variable(name.clone(), *site);
                m.confident = true;
                m.inferred = inferred_sites.contains(&(self.mass_key(name)?, *site));
                modification_matches.push(m);
                record.confident_sites += 1;
            }
        }
        for (mass, groups) in selection {
            for (representative, group) in groups {
                let Some(name) = group.get(&representative).and_then(|n| n.first()) else {
                    continue;
                };
                let mut m = ModificationMatch::variable(name.clone(), representative);
                m.inferred = inferred_sites.contains(&(mass, representative));
                modification_matches.push(m);
                scores.add_ambiguous_group(representative, group);
                record.ambiguous_sites += 1;
            }
        }
        modification_matches.sort_by(|a, b| a.site.cmp(&b.site).then_with(|| a.name.cmp(&b.name)));

        let peptide = Peptide::with_modifications(peptide.sequence.clone(), modification_matches);
        let new_key = peptide.matching_key();
        if new_key != peptide_match.key {
            self.rekey(&peptide_match, &new_key)?;
        }
        peptide_match.peptide = peptide;
        peptide_match.key = new_key;
        peptide_match.ptm_scores = Some(scores);
        self.store.update_peptide_match(peptide_match);
        Ok(record)
    }

    fn rekey(&self, peptide_match: &PeptideMatch, new_key: &str) -> Result<(), InconsistencyError> {
        if self.store.peptide_match(new_key).is_some() {
            return Err(InconsistencyError::DuplicatePeptideKey(new_key.to_string()));
        }
        debug!("Re-keying {} as {new_key}", peptide_match.key);
        self.store.remove_peptide_match(&peptide_match.key);
        for accession in self.store.protein_match_keys() {
            let Some(mut protein_match) = self.store.protein_match(&accession) else {
                continue;
            };
            let mut changed = false;
            for key in protein_match.peptide_match_keys.iter_mut() {
                if *key == peptide_match.key {
                    *key = new_key.to_string();
                    changed = true;
                }
            }
            if changed {
                self.store.update_protein_match(protein_match);
            }
        }
        Ok(())
    }

    /// Translate the localizations of every validated, modified peptide of the protein match
    /// `accession` onto the protein sequence and resolve overlapping ambiguous groups.
    #[instrument(level = "debug", skip(self))]
    pub fn score_protein(&self, accession: &str) -> Result<ProgressRecord, InconsistencyError> {
        let mut protein_match = self.store.protein_match(accession).ok_or_else(|| {
            InconsistencyError::MissingMatch {
                kind: "protein match",
                key: accession.to_string(),
            }
        })?;
        if !protein_match.validated {
            return Ok(ProgressRecord::default());
        }
        let sequence = self.store.protein_sequence(accession).ok_or_else(|| {
            InconsistencyError::MissingMatch {
                kind: "protein sequence",
                key: accession.to_string(),
            }
        })?;

        let mut scores = PtmScores::new();
        let mut groups: Vec<ProteinGroup> = Vec::new();
        for peptide_key in protein_match.peptide_match_keys.iter() {
            let peptide_match = self.store.peptide_match(peptide_key).ok_or_else(|| {
                InconsistencyError::MissingMatch {
                    kind: "peptide match",
                    key: peptide_key.clone(),
                }
            })?;
            if !peptide_match.validated || !peptide_match.peptide.is_modified() {
                continue;
            }
            let Some(peptide_scores) = peptide_match.ptm_scores.as_ref() else {
                continue;
            };
            let length = peptide_match.peptide.len();
            for start in peptide_match.peptide.occurrences_in(&sequence) {
                // terminal sites land on the first or last residue
                let translate = |site: usize| start + site.clamp(1, length.max(1)) - 1;
                for (name, scoring) in peptide_scores.scorings() {
                    scores
                        .scoring_mut(name)
                        .merge_mapped(scoring, |site| Some(translate(site)));
                }
                for (site, names) in peptide_scores.confident_sites() {
                    for name in names {
                        scores.add_confident(translate(*site), name);
                    }
                }
                for (representative, group) in peptide_scores.ambiguous_groups() {
                    let mut sites = SiteGroup::new();
                    let mut masses: BTreeMap<usize, BTreeSet<MassKey>> = BTreeMap::new();
                    for (site, names) in group {
                        let site = translate(*site);
                        masses
                            .entry(site)
                            .or_default()
                            .extend(self.mass_keys(names)?);
                        sites.entry(site).or_default().extend(names.iter().cloned());
                    }
                    groups.push(ProteinGroup {
                        representative: translate(*representative),
                        sites,
                        masses,
                    });
                }
            }
        }

        let mut confident_masses: BTreeMap<usize, BTreeSet<MassKey>> = BTreeMap::new();
        for (site, names) in scores.confident_sites() {
            confident_masses
                .entry(*site)
                .or_default()
                .extend(self.mass_keys(names)?);
        }

        groups.sort_by_key(|g| g.representative);
        let mut resolved: Vec<ProteinGroup> = Vec::new();
        for group in groups {
            if group
                .masses
                .iter()
                .any(|(site, masses)| {
                    confident_masses
                        .get(site)
                        .is_some_and(|c| !c.is_disjoint(masses))
                })
            {
                trace!("Dropping group at {}, already localized", group.representative);
                continue;
            }
            let target = resolved.iter().position(|earlier| {
                group
                    .masses
                    .iter()
                    .any(|(site, masses)| earlier.shares_mass_at(*site, masses))
            });
            match target {
                Some(i) => {
                    trace!(
                        "Merging group at {} into group at {}",
                        group.representative,
                        resolved[i].representative
                    );
                    resolved[i].absorb(group);
                }
                None => resolved.push(group),
            }
        }

        let mut record = ProgressRecord {
            proteins_scored: 1,
            confident_sites: scores.confident_sites().count(),
            ..Default::default()
        };
        for group in resolved {
            scores.add_ambiguous_group(group.representative, group.sites);
        }
        record.ambiguous_sites = scores.ambiguous_groups().count();
        protein_match.ptm_scores = Some(scores);
        self.store.update_protein_match(protein_match);
        Ok(record)
    }
}
