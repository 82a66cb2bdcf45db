//! False localization rate bookkeeping.
//!
//! Each localized spectrum match contributes a point per modification mass: its best
//! probabilistic score and whether the best scoring site disagrees with the search
//! engine's placement. Disagreements play the part of decoys when deriving score limits.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matches::SpectrumMatch;
use crate::modification::MassKey;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalizationPoint {
    pub score: f64,
    pub conflict: bool,
}

/// A score distribution of agreeing and conflicting localizations, where lower scores are better
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDecoyMap {
    points: Vec<LocalizationPoint>,
}

impl TargetDecoyMap {
    pub fn add_point(&mut self, score: f64, conflict: bool) {
        self.points.push(LocalizationPoint { score, conflict });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn conflicts(&self) -> usize {
        self.points.iter().filter(|p| p.conflict).count()
    }

    pub fn merge(&mut self, other: &TargetDecoyMap) {
        self.points.extend_from_slice(&other.points);
    }

    /// The largest score at which the cumulative ratio of conflicts to agreements, in
    /// percent, does not exceed `flr`.
    pub fn estimate_score_limit(&self, flr: f64) -> Option<f64> {
        let mut points = self.points.clone();
        points.sort_by(|a, b| a.score.total_cmp(&b.score));
        let mut agreements = 0usize;
        let mut conflicts = 0usize;
        let mut limit = None;
        let mut i = 0;
        while i < points.len() {
            let score = points[i].score;
            while i < points.len() && points[i].score.total_cmp(&score) == Ordering::Equal {
                if points[i].conflict {
                    conflicts += 1;
                } else {
                    agreements += 1;
                }
                i += 1;
            }
            if agreements > 0 && 100.0 * conflicts as f64 / agreements as f64 <= flr {
                limit = Some(score);
            }
        }
        limit
    }
}

/// Localization points per modification mass and precursor charge, with the
/// score limits derived from them once finalized.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsmPtmMap {
    maps: BTreeMap<MassKey, BTreeMap<i32, TargetDecoyMap>>,
    groups: BTreeMap<MassKey, BTreeMap<i32, i32>>,
    score_limits: BTreeMap<MassKey, BTreeMap<i32, f64>>,
    finalized: bool,
}

impl PsmPtmMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(
        &mut self,
        mass: f64,
        score: f64,
        spectrum_match: &SpectrumMatch,
        is_conflict: bool,
    ) {
        self.maps
            .entry(MassKey::from_mass(mass))
            .or_default()
            .entry(spectrum_match.charge)
            .or_default()
            .add_point(score, is_conflict);
    }

    pub fn point_count(&self) -> usize {
        self.maps
            .values()
            .flat_map(|m| m.values())
            .map(|m| m.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Pool sparse charge buckets and compute a score limit for every pool.
    ///
    /// Charges are walked in ascending order and collected until a pool holds at least
    /// `min_points` points. Trailing charges that never reach it join the last pool.
    pub fn finalize(&mut self, flr: f64, min_points: usize) {
        self.groups.clear();
        self.score_limits.clear();
        for (mass, by_charge) in self.maps.iter() {
            let mut pools: Vec<Vec<i32>> = Vec::new();
            let mut current: Vec<i32> = Vec::new();
            let mut current_size = 0;
            for (charge, map) in by_charge.iter() {
                current.push(*charge);
                current_size += map.len();
                if current_size >= min_points {
                    pools.push(std::mem::take(&mut current));
                    current_size = 0;
                }
            }
            if !current.is_empty() {
                match pools.last_mut() {
                    Some(last) => last.extend(current),
                    None => pools.push(current),
                }
            }

            let groups = self.groups.entry(*mass).or_default();
            for pool in pools {
                let Some(representative) = pool.first().copied() else {
                    continue;
                };
                let mut merged = TargetDecoyMap::default();
                for charge in pool.iter() {
                    groups.insert(*charge, representative);
                    if let Some(map) = by_charge.get(charge) {
                        merged.merge(map);
                    }
                }
                let limit = merged.estimate_score_limit(flr);
                debug!(
                    "Mass {:.4} charges {:?}: {} points, {} conflicts, score limit {:?}",
                    mass.mass(),
                    pool,
                    merged.len(),
                    merged.conflicts(),
                    limit
                );
                if let Some(limit) = limit {
                    self.score_limits
                        .entry(*mass)
                        .or_default()
                        .insert(representative, limit);
                }
            }
        }
        self.finalized = true;
    }

    /// The score limit for a modification mass at a precursor charge, available once finalized.
    ///
    /// A charge never seen while collecting points borrows the pool of the closest known charge.
    pub fn score_limit(&self, mass: f64, charge: i32) -> Option<f64> {
        if !self.finalized {
            return None;
        }
        let key = MassKey::from_mass(mass);
        let groups = self.groups.get(&key)?;
        let representative = match groups.get(&charge) {
            Some(rep) => *rep,
            None => groups
                .iter()
                .min_by_key(|(c, _)| ((**c - charge).abs(), **c))
                .map(|(_, rep)| *rep)?,
        };
        self.score_limits.get(&key)?.get(&representative).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_score_limit() {
        let mut map = TargetDecoyMap::default();
        for i in 0..100 {
            map.add_point(-(100.0 - i as f64), false);
        }
        map.add_point(-99.5, true);
        map.add_point(-0.25, true);
        let limit = map.estimate_score_limit(1.0).unwrap();
        assert_eq!(limit, -1.0);
        assert_eq!(map.estimate_score_limit(0.5), Some(-100.0));
        assert!(TargetDecoyMap::default().estimate_score_limit(1.0).is_none());
    }

    #[test]
    fn test_charge_pooling() {
        let mut map = PsmPtmMap::new();
        let mut psm2 = SpectrumMatch::new("run", "a", 2);
        let psm3 = SpectrumMatch::new("run", "b", 3);
        for i in 0..10 {
            map.add_point(79.966, -(99.0 - i as f64), &psm2, false);
        }
        map.add_point(79.966, -95.0, &psm3, false);
        assert_eq!(map.point_count(), 11);
        assert!(map.score_limit(79.966, 2).is_none());

        map.finalize(1.0, 5);
        assert!(map.is_finalized());
        assert_eq!(map.score_limit(79.966, 3), map.score_limit(79.966, 2));
        assert_eq!(map.score_limit(79.966, 6), map.score_limit(79.966, 2));
        assert_eq!(map.score_limit(79.966, 2), Some(-90.0));
        assert!(map.score_limit(15.995, 2).is_none());

        psm2.charge = 4;
        let mut other = map.clone();
        other.add_point(79.966, -10.0, &psm2, true);
        other.finalize(1.0, 5);
        assert_eq!(other.point_count(), 12);
    }
}
