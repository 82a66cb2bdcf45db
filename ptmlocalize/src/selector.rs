//! Greedy, conflict-aware selection of representative sites for ambiguous modifications.
//!
//! Given a pool of scored candidate sites per modification mass and the number of sites
//! each mass still needs, [`RepresentativeSiteSelector`] picks representative sites best
//! score first. A site claimed by one mass is no longer available to the others, and a
//! site is refused to a mass when taking it would leave another mass with fewer possible
//! sites than it still needs. Every unselected candidate is attached to the closest
//! representative of its mass as a secondary site.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::InconsistencyError;
use crate::modification::MassKey;
use crate::site::SiteGroup;

/// A candidate site for a modification mass with its best scores
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSite {
    pub site: usize,
    pub mass: MassKey,
    pub probabilistic_score: f64,
    pub delta_score: f64,
    pub modifications: Vec<String>,
}

impl ScoredSite {
    pub fn new(
        site: usize,
        mass: MassKey,
        probabilistic_score: f64,
        delta_score: f64,
        modifications: Vec<String>,
    ) -> Self {
        Self {
            site,
            mass,
            probabilistic_score,
            delta_score,
            modifications,
        }
    }

    /// Highest probabilistic score, then highest delta score, then lightest mass, then lowest site
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .probabilistic_score
            .total_cmp(&self.probabilistic_score)
            .then_with(|| other.delta_score.total_cmp(&self.delta_score))
            .then_with(|| self.mass.cmp(&other.mass))
            .then_with(|| self.site.cmp(&other.site))
    }
}

/// Per mass, the selected representative sites and the group each one covers
pub type RepresentativeSites = BTreeMap<MassKey, BTreeMap<usize, SiteGroup>>;

#[derive(Debug, Default, Clone)]
pub struct RepresentativeSiteSelector {
    pool: Vec<ScoredSite>,
    preferential_sites: BTreeMap<MassKey, BTreeSet<usize>>,
}

impl RepresentativeSiteSelector {
    /// Build a selector over `pool`. Repeated `(mass, site)` entries are collapsed,
    /// keeping their best scores and every modification name.
    pub fn new(pool: impl IntoIterator<Item = ScoredSite>) -> Self {
        let mut merged: BTreeMap<(MassKey, usize), ScoredSite> = BTreeMap::new();
        for entry in pool {
            match merged.get_mut(&(entry.mass, entry.site)) {
                Some(existing) => {
                    existing.probabilistic_score =
                        existing.probabilistic_score.max(entry.probabilistic_score);
                    existing.delta_score = existing.delta_score.max(entry.delta_score);
                    for name in entry.modifications {
                        if !existing.modifications.contains(&name) {
                            existing.modifications.push(name);
                        }
                    }
                }
                None => {
                    merged.insert((entry.mass, entry.site), entry);
                }
            }
        }
        let mut pool: Vec<ScoredSite> = merged.into_values().collect();
        pool.sort_by(|a, b| a.rank(b));
        Self {
            pool,
            preferential_sites: BTreeMap::new(),
        }
    }

    /// Sites that are taken for their mass before any other, regardless of score
    pub fn with_preferential_sites(
        mut self,
        preferential_sites: BTreeMap<MassKey, BTreeSet<usize>>,
    ) -> Self {
        self.preferential_sites = preferential_sites;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Select exactly `to_select[mass]` representative sites for every mass.
    pub fn select(
        &self,
        to_select: &BTreeMap<MassKey, usize>,
    ) -> Result<RepresentativeSites, InconsistencyError> {
        let mut state = SelectionState::new(&self.pool, to_select);

        for (mass, sites) in self.preferential_sites.iter() {
            for entry in self
                .pool
                .iter()
                .filter(|e| e.mass == *mass && sites.contains(&e.site))
            {
                if state.can_claim(entry) {
                    trace!("Preferential site {} for mass {:.4}", entry.site, mass.mass());
                    state.claim(entry);
                }
            }
        }

        for entry in self.pool.iter() {
            if !state.can_claim(entry) {
                continue;
            }
            if let Some(starved) = state.starved_by(entry) {
                trace!(
                    "Refusing site {} to mass {:.4}, mass {:.4} would run out of sites",
                    entry.site,
                    entry.mass.mass(),
                    starved.mass()
                );
                continue;
            }
            state.claim(entry);
        }

        for (mass, required) in to_select.iter() {
            let selected = state
                .representatives
                .get(mass)
                .map(|s| s.len())
                .unwrap_or_default();
            if selected != *required {
                return Err(InconsistencyError::InsufficientRepresentativeSites {
                    mass: mass.mass(),
                    required: *required,
                    selected,
                });
            }
        }

        Ok(self.build_groups(&state))
    }

    fn build_groups(&self, state: &SelectionState) -> RepresentativeSites {
        let mut result = RepresentativeSites::new();
        for entry in self.pool.iter() {
            let Some(representatives) = state.representatives.get(&entry.mass) else {
                continue;
            };
            let representative = if representatives.contains(&entry.site) {
                entry.site
            } else {
                match state.claimed.get(&entry.site) {
                    Some(owner) if *owner != entry.mass => continue,
                    _ => {}
                }
                match representatives
                    .iter()
                    .min_by_key(|rep| (rep.abs_diff(entry.site), **rep))
                {
                    Some(rep) => *rep,
                    None => continue,
                }
            };
            let names = result
                .entry(entry.mass)
                .or_default()
                .entry(representative)
                .or_default()
                .entry(entry.site)
                .or_default();
            for name in entry.modifications.iter() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        result
    }
}

struct SelectionState {
    possible: BTreeMap<MassKey, BTreeSet<usize>>,
    remaining: BTreeMap<MassKey, usize>,
    representatives: BTreeMap<MassKey, BTreeSet<usize>>,
    claimed: BTreeMap<usize, MassKey>,
}

impl SelectionState {
    fn new(pool: &[ScoredSite], to_select: &BTreeMap<MassKey, usize>) -> Self {
        let mut possible: BTreeMap<MassKey, BTreeSet<usize>> = BTreeMap::new();
        for entry in pool {
            possible.entry(entry.mass).or_default().insert(entry.site);
        }
        Self {
            possible,
            remaining: to_select.clone(),
            representatives: BTreeMap::new(),
            claimed: BTreeMap::new(),
        }
    }

    fn can_claim(&self, entry: &ScoredSite) -> bool {
        self.remaining.get(&entry.mass).copied().unwrap_or_default() > 0
            && !self.claimed.contains_key(&entry.site)
            && self
                .possible
                .get(&entry.mass)
                .is_some_and(|sites| sites.contains(&entry.site))
    }

    /// The first other mass that would be left with fewer unclaimed sites than it needs
    fn starved_by(&self, entry: &ScoredSite) -> Option<MassKey> {
        self.possible
            .iter()
            .filter(|(mass, sites)| **mass != entry.mass && sites.contains(&entry.site))
            .find(|(mass, sites)| {
                let needed = self.remaining.get(*mass).copied().unwrap_or_default();
                if needed == 0 {
                    return false;
                }
                let available = match self.representatives.get(*mass) {
                    Some(chosen) => sites.difference(chosen).count(),
                    None => sites.len(),
                };
                available.saturating_sub(1) < needed
            })
            .map(|(mass, _)| *mass)
    }

    fn claim(&mut self, entry: &ScoredSite) {
        self.representatives
            .entry(entry.mass)
            .or_default()
            .insert(entry.site);
        if let Some(quota) = self.remaining.get_mut(&entry.mass) {
            *quota = quota.saturating_sub(1);
        }
        self.claimed.insert(entry.site, entry.mass);
        for (mass, sites) in self.possible.iter_mut() {
            if *mass != entry.mass {
                sites.remove(&entry.site);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mass_a() -> MassKey {
        MassKey::from_mass(79.966331)
    }

    fn mass_b() -> MassKey {
        MassKey::from_mass(42.010565)
    }

    fn site(site: usize, mass: MassKey, p: f64, d: f64) -> ScoredSite {
        ScoredSite::new(site, mass, p, d, vec![format!("mod{}", mass.mass())])
    }

    /// A small deterministic generator so that pools vary without a random number crate
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    #[test]
    fn test_selects_best_and_assigns_secondary() {
        let pool = vec![
            site(2, mass_a(), 10.0, 0.0),
            site(5, mass_a(), 60.0, 0.0),
            site(8, mass_a(), 30.0, 0.0),
            site(11, mass_a(), 5.0, 0.0),
        ];
        let selector = RepresentativeSiteSelector::new(pool);
        let result = selector
            .select(&BTreeMap::from([(mass_a(), 2)]))
            .unwrap();
        let groups = &result[&mass_a()];
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![5, 8]);
        assert!(groups[&5].contains_key(&2));
        assert!(groups[&8].contains_key(&11));
    }

    #[test]
    fn test_secondary_ties_go_to_lower_representative() {
        let pool = vec![
            site(2, mass_a(), 50.0, 0.0),
            site(6, mass_a(), 50.0, 0.0),
            site(4, mass_a(), 1.0, 0.0),
        ];
        let result = RepresentativeSiteSelector::new(pool)
            .select(&BTreeMap::from([(mass_a(), 2)]))
            .unwrap();
        assert!(result[&mass_a()][&2].contains_key(&4));
        assert!(!result[&mass_a()][&6].contains_key(&4));
    }

    #[test]
    fn test_starvation_guard() {
        // mass B ranks highest at site 5 but mass A has nowhere else to go
        let pool = vec![
            site(5, mass_b(), 99.0, 0.0),
            site(5, mass_a(), 20.0, 0.0),
            site(3, mass_b(), 10.0, 0.0),
        ];
        let to_select = BTreeMap::from([(mass_a(), 1), (mass_b(), 1)]);
        let result = RepresentativeSiteSelector::new(pool)
            .select(&to_select)
            .unwrap();
        assert!(result[&mass_a()].contains_key(&5));
        assert!(result[&mass_b()].contains_key(&3));
        assert!(!result[&mass_b()].values().any(|g| g.contains_key(&5)));
    }

    #[test]
    fn test_preferential_sites_first() {
        let pool = vec![
            site(2, mass_a(), 90.0, 0.0),
            site(7, mass_a(), 1.0, 0.0),
        ];
        let result = RepresentativeSiteSelector::new(pool)
            .with_preferential_sites(BTreeMap::from([(mass_a(), BTreeSet::from([7]))]))
            .select(&BTreeMap::from([(mass_a(), 1)]))
            .unwrap();
        let groups = &result[&mass_a()];
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![7]);
        assert!(groups[&7].contains_key(&2));
    }

    #[test]
    fn test_insufficient_sites() {
        let pool = vec![site(5, mass_a(), 10.0, 0.0), site(5, mass_b(), 20.0, 0.0)];
        let to_select = BTreeMap::from([(mass_a(), 1), (mass_b(), 1)]);
        let err = RepresentativeSiteSelector::new(pool)
            .select(&to_select)
            .unwrap_err();
        assert!(matches!(
            err,
            InconsistencyError::InsufficientRepresentativeSites { selected: 0, .. }
        ));
    }

    #[test]
    fn test_quota_conservation_without_preferential_sites() {
        let mut rng = Lcg(17);
        for _ in 0..200 {
            let n_sites = 2 + rng.next(10) as usize;
            let mut pool = Vec::new();
            for s in 1..=n_sites {
                pool.push(site(s, mass_a(), rng.next(100) as f64, rng.next(100) as f64));
                if rng.next(2) == 0 {
                    pool.push(site(s, mass_b(), rng.next(100) as f64, rng.next(100) as f64));
                }
            }
            let b_sites = pool.iter().filter(|e| e.mass == mass_b()).count();
            let want_b = (rng.next(3) as usize).min(b_sites);
            let want_a = (rng.next(3) as usize + 1).min(n_sites - want_b);
            let to_select = BTreeMap::from([(mass_a(), want_a), (mass_b(), want_b)]);

            let selector = RepresentativeSiteSelector::new(pool.clone());
            match selector.select(&to_select) {
                Ok(result) => {
                    for (mass, wanted) in to_select.iter() {
                        let got = result.get(mass).map(|g| g.len()).unwrap_or_default();
                        assert_eq!(got, *wanted);
                    }
                    let mut seen = BTreeSet::new();
                    for groups in result.values() {
                        for rep in groups.keys() {
                            assert!(seen.insert(*rep), "site {rep} represents two masses");
                        }
                    }
                }
                Err(InconsistencyError::InsufficientRepresentativeSites { .. }) => {
                    // only masses whose sites were exhausted can fail
                    assert!(want_b > 0);
                }
                Err(e) => panic!("unexpected error {e}"),
            }

            pool.reverse();
            let reversed = RepresentativeSiteSelector::new(pool).select(&to_select);
            assert_eq!(reversed, selector.select(&to_select));
        }
    }

    #[test]
    fn test_single_mass_always_meets_quota() {
        let mut rng = Lcg(3);
        for _ in 0..100 {
            let n_sites = 1 + rng.next(12) as usize;
            let pool: Vec<_> = (1..=n_sites)
                .map(|s| site(s, mass_a(), rng.next(4) as f64, rng.next(4) as f64))
                .collect();
            let want = 1 + rng.next(n_sites as u64) as usize;
            let result = RepresentativeSiteSelector::new(pool)
                .select(&BTreeMap::from([(mass_a(), want)]))
                .unwrap();
            assert_eq!(result[&mass_a()].len(), want);
            let covered: usize = result[&mass_a()].values().map(|g| g.len()).sum();
            assert_eq!(covered, n_sites);
        }
    }
}
