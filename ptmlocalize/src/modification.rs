use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use identity_hash::IdentityHashable;
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};

use crate::error::InconsistencyError;

/// Masses are compared by value to the fourth decimal place when used as keys
const MASS_KEY_SCALE: f64 = 1e4;

/// An integer key standing in for a modification mass so it can be
/// ordered, hashed and used to group modifications sharing a mass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MassKey(i64);

impl MassKey {
    pub fn from_mass(mass: f64) -> Self {
        Self((mass * MASS_KEY_SCALE).round() as i64)
    }

    pub fn mass(&self) -> f64 {
        self.0 as f64 / MASS_KEY_SCALE
    }
}

impl Hash for MassKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_i64(self.0);
    }
}

impl IdentityHashable for MassKey {}

pub type BuildIdentityHasherMassKey = identity_hash::BuildIdentityHasher<MassKey>;

/// Where on a peptide a modification may be placed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationPosition {
    #[default]
    Anywhere,
    NTerm,
    CTerm,
}

/// A modification definition as known to the search parameters.
///
/// An empty `residues` list means the modification may sit on any residue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub name: String,
    pub mass: f64,
    #[serde(default)]
    pub position: ModificationPosition,
    #[serde(default)]
    pub residues: Vec<char>,
}

impl Modification {
    pub fn new(
        name: impl Into<String>,
        mass: f64,
        position: ModificationPosition,
        residues: Vec<char>,
    ) -> Self {
        Self {
            name: name.into(),
            mass,
            position,
            residues,
        }
    }

    pub fn is_n_term(&self) -> bool {
        matches!(self.position, ModificationPosition::NTerm)
    }

    pub fn is_c_term(&self) -> bool {
        matches!(self.position, ModificationPosition::CTerm)
    }

    /// Whether the modification targets a residue rather than a terminus
    pub fn is_residue_specific(&self) -> bool {
        matches!(self.position, ModificationPosition::Anywhere)
    }

    fn accepts(&self, residue: Option<char>) -> bool {
        if self.residues.is_empty() {
            return true;
        }
        match residue {
            Some(aa) => self.residues.contains(&aa),
            None => false,
        }
    }
}

/// A source of modification definitions and their chemically possible sites.
///
/// Sites are 1-based residue indices, 0 is the N-terminus and `length + 1` the C-terminus.
pub trait ModificationRegistry: Send + Sync {
    fn get_modification(&self, name: &str) -> Option<&Modification>;

    fn potential_sites(&self, sequence: &str, modification: &Modification) -> Vec<usize> {
        let residues: Vec<char> = sequence.chars().collect();
        match modification.position {
            ModificationPosition::NTerm => {
                if modification.accepts(residues.first().copied()) {
                    vec![0]
                } else {
                    Vec::new()
                }
            }
            ModificationPosition::CTerm => {
                if modification.accepts(residues.last().copied()) {
                    vec![residues.len() + 1]
                } else {
                    Vec::new()
                }
            }
            ModificationPosition::Anywhere => residues
                .iter()
                .enumerate()
                .filter(|(_, aa)| modification.accepts(Some(**aa)))
                .map(|(i, _)| i + 1)
                .collect(),
        }
    }

    fn modification_mass(&self, name: &str) -> Result<f64, InconsistencyError> {
        self.get_modification(name)
            .map(|m| m.mass)
            .ok_or_else(|| InconsistencyError::UnknownModification(name.to_string()))
    }
}

/// A simple name-indexed [`ModificationRegistry`]
#[derive(Debug, Default, Clone)]
pub struct ModificationTable {
    modifications: HashMap<String, Modification>,
}

impl ModificationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, modification: Modification) {
        self.modifications
            .insert(modification.name.clone(), modification);
    }

    pub fn len(&self) -> usize {
        self.modifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }
}

impl FromIterator<Modification> for ModificationTable {
    fn from_iter<T: IntoIterator<Item = Modification>>(iter: T) -> Self {
        let mut table = Self::new();
        for m in iter {
            table.add(m);
        }
        table
    }
}

impl ModificationRegistry for ModificationTable {
    fn get_modification(&self, name: &str) -> Option<&Modification> {
        self.modifications.get(name)
    }
}

/// One occurrence of a modification on a peptide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationMatch {
    pub name: String,
    pub site: usize,
    pub variable: bool,
    #[serde(default)]
    pub confident: bool,
    #[serde(default)]
    pub inferred: bool,
}

impl ModificationMatch {
    pub fn new(name: impl Into<String>, site: usize, variable: bool) -> Self {
        Self {
            name: name.into(),
            site,
            variable,
            confident: false,
            inferred: false,
        }
    }

    pub fn variable(name: impl Into<String>, site: usize) -> Self {
        Self::new(name, site, true)
    }

    pub fn fixed(name: impl Into<String>, site: usize) -> Self {
        Self::new(name, site, false)
    }
}

/// The variable modifications of `profile` whose mass matches `mass`, in profile order
pub fn similar_modifications<'a, R: ModificationRegistry + ?Sized>(
    registry: &'a R,
    profile: &[String],
    mass: f64,
    tolerance: Tolerance,
) -> Vec<&'a Modification> {
    profile
        .iter()
        .filter_map(|name| registry.get_modification(name))
        .filter(|m| tolerance.test(m.mass, mass))
        .collect()
}

/// The mass modifications of `mass` are grouped under.
///
/// This is the mass of the first modification of `profile` within `tolerance` of `mass`,
/// followed from modification to modification until it settles, so every mass within
/// `tolerance` of a profile modification lands on the same group no matter how close it
/// is to a [`MassKey`] rounding boundary. Masses matching nothing in `profile` stand for
/// themselves.
pub fn grouping_mass<R: ModificationRegistry + ?Sized>(
    registry: &R,
    profile: &[String],
    mass: f64,
    tolerance: Tolerance,
) -> f64 {
    let mut current = mass;
    loop {
        let Some(next) = profile
            .iter()
            .filter_map(|name| registry.get_modification(name))
            .find(|m| tolerance.test(m.mass, current))
            .map(|m| m.mass)
        else {
            return current;
        };
        if MassKey::from_mass(next) == MassKey::from_mass(current) {
            return next;
        }
        current = next;
    }
}

/// Map each site of `sequence` that can carry any of `modifications` to the names
/// of the modifications possible there, preserving the order of `modifications`.
pub fn possible_sites<R: ModificationRegistry + ?Sized>(
    registry: &R,
    sequence: &str,
    modifications: &[&Modification],
) -> BTreeMap<usize, Vec<String>> {
    let mut sites: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for modification in modifications {
        for site in registry.potential_sites(sequence, modification) {
            let names = sites.entry(site).or_default();
            if !names.contains(&modification.name) {
                names.push(modification.name.clone());
            }
        }
    }
    sites
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> ModificationTable {
        ModificationTable::from_iter([
            Modification::new(
                "Phospho",
                79.966331,
                ModificationPosition::Anywhere,
                vec!['S', 'T', 'Y'],
            ),
            Modification::new(
                "Phospho-NTerm",
                79.966331,
                ModificationPosition::NTerm,
                Vec::new(),
            ),
            Modification::new(
                "Oxidation",
                15.994915,
                ModificationPosition::Anywhere,
                vec!['M'],
            ),
            Modification::new("Amidated", -0.984016, ModificationPosition::CTerm, Vec::new()),
        ])
    }

    #[test]
    fn test_potential_sites() {
        let registry = table();
        let phospho = registry.get_modification("Phospho").unwrap();
        assert_eq!(registry.potential_sites("PSTYK", phospho), vec![2, 3, 4]);
        let nterm = registry.get_modification("Phospho-NTerm").unwrap();
        assert_eq!(registry.potential_sites("PSTYK", nterm), vec![0]);
        let cterm = registry.get_modification("Amidated").unwrap();
        assert_eq!(registry.potential_sites("PSTYK", cterm), vec![6]);
    }

    #[test]
    fn test_similar_modifications() {
        let registry = table();
        let profile = vec![
            "Oxidation".to_string(),
            "Phospho-NTerm".to_string(),
            "Phospho".to_string(),
        ];
        let similar = similar_modifications(&registry, &profile, 79.9663, Tolerance::Da(0.001));
        let names: Vec<_> = similar.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Phospho-NTerm", "Phospho"]);

        let sites = possible_sites(&registry, "SAMS", &similar);
        assert_eq!(sites.keys().copied().collect::<Vec<_>>(), vec![0, 1, 4]);
        assert_eq!(sites[&0], vec!["Phospho-NTerm".to_string()]);
    }

    #[test]
    fn test_mass_key() {
        let a = MassKey::from_mass(79.966331);
        let b = MassKey::from_mass(79.96629);
        assert_eq!(a, b);
        assert!(MassKey::from_mass(15.994915) < a);
        assert!((a.mass() - 79.9663).abs() < 1e-9);
        assert!(registry_unknown().is_err());
    }

    #[test]
    fn test_grouping_mass_follows_tolerance() {
        // 1e-4 apart and rounding to different keys, but within the tolerance
        let registry = ModificationTable::from_iter([
            Modification::new("Acetyl", 42.01057, ModificationPosition::Anywhere, vec!['K']),
            Modification::new("Acetyl-alt", 42.01047, ModificationPosition::Anywhere, vec!['K']),
            Modification::new("Trimethyl", 42.04695, ModificationPosition::Anywhere, vec!['K']),
        ]);
        assert_ne!(MassKey::from_mass(42.01057), MassKey::from_mass(42.01047));
        let profile = vec![
            "Acetyl".to_string(),
            "Acetyl-alt".to_string(),
            "Trimethyl".to_string(),
        ];
        let tolerance = Tolerance::Da(0.001);
        let acetyl = grouping_mass(&registry, &profile, 42.01057, tolerance);
        let alt = grouping_mass(&registry, &profile, 42.01047, tolerance);
        assert_eq!(MassKey::from_mass(acetyl), MassKey::from_mass(alt));
        assert_eq!(acetyl, 42.01057);
        assert_eq!(grouping_mass(&registry, &profile, 42.04695, tolerance), 42.04695);
        assert_eq!(grouping_mass(&registry, &profile, 100.0, tolerance), 100.0);
    }

    fn registry_unknown() -> Result<f64, InconsistencyError> {
        table().modification_mass("Deamidation")
    }
}
