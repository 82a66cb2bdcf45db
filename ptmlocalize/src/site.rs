//! Per-match containers for site scores, confidence tiers and ambiguous site groups.
use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

/// How much trust is placed in a modification site, in increasing order
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SiteConfidence {
    #[default]
    Random,
    Doubtful,
    Confident,
    VeryConfident,
}

impl SiteConfidence {
    pub fn is_confident(&self) -> bool {
        *self >= Self::Confident
    }
}

/// The scores of a single modification across its candidate sites on one match
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtmScoring {
    pub name: String,
    delta_scores: BTreeMap<usize, f64>,
    probabilistic_scores: BTreeMap<usize, f64>,
    confidence: BTreeMap<usize, SiteConfidence>,
}

impl PtmScoring {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn delta_score(&self, site: usize) -> Option<f64> {
        self.delta_scores.get(&site).copied()
    }

    pub fn set_delta_score(&mut self, site: usize, score: f64) {
        self.delta_scores.insert(site, score);
    }

    pub fn probabilistic_score(&self, site: usize) -> Option<f64> {
        self.probabilistic_scores.get(&site).copied()
    }

    pub fn set_probabilistic_score(&mut self, site: usize, score: f64) {
        self.probabilistic_scores.insert(site, score);
    }

    pub fn confidence(&self, site: usize) -> Option<SiteConfidence> {
        self.confidence.get(&site).copied()
    }

    pub fn set_confidence(&mut self, site: usize, confidence: SiteConfidence) {
        self.confidence.insert(site, confidence);
    }

    pub fn delta_scores(&self) -> btree_map::Iter<'_, usize, f64> {
        self.delta_scores.iter()
    }

    pub fn probabilistic_scores(&self) -> btree_map::Iter<'_, usize, f64> {
        self.probabilistic_scores.iter()
    }

    pub fn confidences(&self) -> btree_map::Iter<'_, usize, SiteConfidence> {
        self.confidence.iter()
    }

    pub fn has_probabilistic_scores(&self) -> bool {
        !self.probabilistic_scores.is_empty()
    }

    pub fn clear_delta_scores(&mut self) {
        self.delta_scores.clear();
    }

    pub fn clear_probabilistic_scores(&mut self) {
        self.probabilistic_scores.clear();
    }

    pub fn clear_confidence(&mut self) {
        self.confidence.clear();
    }

    /// Merge `other` into `self`, keeping the highest score and tier seen at each site
    pub fn merge_max(&mut self, other: &PtmScoring) {
        self.merge_mapped(other, Some)
    }

    /// As [`PtmScoring::merge_max`], with every site of `other` first passed through `map_site`.
    /// Sites mapped to `None` are skipped.
    pub fn merge_mapped(&mut self, other: &PtmScoring, map_site: impl Fn(usize) -> Option<usize>) {
        for (site, score) in other.delta_scores.iter() {
            if let Some(site) = map_site(*site) {
                let entry = self.delta_scores.entry(site).or_insert(*score);
                *entry = entry.max(*score);
            }
        }
        for (site, score) in other.probabilistic_scores.iter() {
            if let Some(site) = map_site(*site) {
                let entry = self.probabilistic_scores.entry(site).or_insert(*score);
                *entry = entry.max(*score);
            }
        }
        for (site, tier) in other.confidence.iter() {
            if let Some(site) = map_site(*site) {
                let entry = self.confidence.entry(site).or_insert(*tier);
                *entry = (*entry).max(*tier);
            }
        }
    }
}

/// A group of interchangeable sites, the representative site included, each
/// mapped to the modification names possible there.
pub type SiteGroup = BTreeMap<usize, Vec<String>>;

/// All localization results attached to a spectrum, peptide or protein match
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtmScores {
    scorings: BTreeMap<String, PtmScoring>,
    confident_sites: BTreeMap<usize, Vec<String>>,
    ambiguous_sites: BTreeMap<usize, SiteGroup>,
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

impl PtmScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoring(&self, name: &str) -> Option<&PtmScoring> {
        self.scorings.get(name)
    }

    pub fn scoring_mut(&mut self, name: &str) -> &mut PtmScoring {
        self.scorings
            .entry(name.to_string())
            .or_insert_with(|| PtmScoring::new(name))
    }

    pub fn scorings(&self) -> btree_map::Iter<'_, String, PtmScoring> {
        self.scorings.iter()
    }

    pub fn scorings_mut(&mut self) -> btree_map::IterMut<'_, String, PtmScoring> {
        self.scorings.iter_mut()
    }

    /// The highest probabilistic score of any of `names` at `site`
    pub fn best_probabilistic_score(&self, names: &[String], site: usize) -> Option<f64> {
        names
            .iter()
            .filter_map(|n| self.scoring(n).and_then(|s| s.probabilistic_score(site)))
            .reduce(f64::max)
    }

    /// The highest delta score of any of `names` at `site`
    pub fn best_delta_score(&self, names: &[String], site: usize) -> Option<f64> {
        names
            .iter()
            .filter_map(|n| self.scoring(n).and_then(|s| s.delta_score(site)))
            .reduce(f64::max)
    }

    pub fn confident_sites(&self) -> btree_map::Iter<'_, usize, Vec<String>> {
        self.confident_sites.iter()
    }

    pub fn is_confident_site(&self, site: usize) -> bool {
        self.confident_sites.contains_key(&site)
    }

    pub fn ambiguous_groups(&self) -> btree_map::Iter<'_, usize, SiteGroup> {
        self.ambiguous_sites.iter()
    }

    pub fn ambiguous_group(&self, representative: usize) -> Option<&SiteGroup> {
        self.ambiguous_sites.get(&representative)
    }

    pub fn representative_sites(&self) -> impl Iterator<Item = usize> + '_ {
        self.ambiguous_sites.keys().copied()
    }

    /// The representative of the group containing `site`, if any
    pub fn group_of(&self, site: usize) -> Option<usize> {
        self.ambiguous_sites
            .iter()
            .find(|(_, group)| group.contains_key(&site))
            .map(|(rep, _)| *rep)
    }

    pub fn remove_ambiguous_group(&mut self, representative: usize) -> Option<SiteGroup> {
        self.ambiguous_sites.remove(&representative)
    }

    /// Forget every confident site and ambiguous group, keeping the scores
    pub fn reset_sites(&mut self) {
        self.confident_sites.clear();
        self.ambiguous_sites.clear();
    }

    /// Record `name` as confidently localized at `site`, removing the site from any
    /// ambiguous group.
    ///
    /// A group that loses its representative is re-anchored on its lowest remaining site.
    pub fn add_confident(&mut self, site: usize, name: &str) {
        push_unique(self.confident_sites.entry(site).or_default(), name);
        if let Some(rep) = self.group_of(site) {
            if let Some(mut group) = self.ambiguous_sites.remove(&rep) {
                group.remove(&site);
                let new_rep = if rep == site {
                    group.keys().next().copied()
                } else {
                    Some(rep)
                };
                if let Some(new_rep) = new_rep {
                    self.ambiguous_sites.insert(new_rep, group);
                }
            }
        }
    }

    /// Add an ambiguous group anchored on `representative`.
    ///
    /// Each site stays in a single group: a representative is taken out of whatever group
    /// already covered it, a secondary site already covered elsewhere stays where it was
    /// and its names are added there, and confident sites are never added.
    pub fn add_ambiguous_group(&mut self, representative: usize, group: SiteGroup) {
        if self.is_confident_site(representative) {
            return;
        }
        if let Some(owner) = self.group_of(representative) {
            if owner != representative {
                if let Some(owner_group) = self.ambiguous_sites.get_mut(&owner) {
                    owner_group.remove(&representative);
                }
            }
        }
        let mut kept = SiteGroup::new();
        for (site, names) in group {
            if self.is_confident_site(site) {
                continue;
            }
            match self.group_of(site) {
                Some(owner) if owner != representative => {
                    if let Some(owner_names) = self
                        .ambiguous_sites
                        .get_mut(&owner)
                        .and_then(|g| g.get_mut(&site))
                    {
                        for name in names.iter() {
                            push_unique(owner_names, name);
                        }
                    }
                }
                _ => {
                    kept.insert(site, names);
                }
            }
        }
        let target = self.ambiguous_sites.entry(representative).or_default();
        for (site, names) in kept {
            let entry = target.entry(site).or_default();
            for name in names.iter() {
                push_unique(entry, name);
            }
        }
    }

    /// Move the group anchored on `old` so it is anchored on `new`, carrying the names
    /// at `old` over.
    pub fn change_representative_site(&mut self, old: usize, new: usize) {
        if old == new {
            return;
        }
        let Some(mut group) = self.ambiguous_sites.remove(&old) else {
            return;
        };
        let names = group.get(&old).cloned().unwrap_or_default();
        if let Some(owner) = self.group_of(new) {
            if let Some(owner_group) = self.ambiguous_sites.get_mut(&owner) {
                owner_group.remove(&new);
            }
        }
        let entry = group.entry(new).or_default();
        for name in names.iter() {
            push_unique(entry, name);
        }
        match self.ambiguous_sites.get_mut(&new) {
            Some(existing) => {
                for (site, names) in group {
                    let entry = existing.entry(site).or_default();
                    for name in names.iter() {
                        push_unique(entry, name);
                    }
                }
            }
            None => {
                self.ambiguous_sites.insert(new, group);
            }
        }
    }
}
