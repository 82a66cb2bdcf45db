//! The entry points of the localization engine.
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use crate::aggregation::AggregationEngine;
use crate::classifier::SiteClassifier;
use crate::error::{InconsistencyError, PtmLocalizationError};
use crate::flr::PsmPtmMap;
use crate::inference::PeptideInferenceEngine;
use crate::matches::SpectrumMatch;
use crate::modification::ModificationRegistry;
use crate::params::PtmScoringParams;
use crate::progress::{ProgressRecord, WaitingHandler};
use crate::scheduler::ParallelScoringScheduler;
use crate::scoring::{ScoreAttacher, SiteProbabilityScorer};
use crate::store::MatchStore;

/// Localizes the modifications of every match in a [`MatchStore`].
///
/// The stages are meant to run in order: [`PtmLocalizationEngine::score_psm_ptms`],
/// [`PtmLocalizationEngine::peptide_inference`], then, once the peptide and protein matches
/// exist, [`PtmLocalizationEngine::score_peptide_ptms`] and
/// [`PtmLocalizationEngine::score_protein_ptms`]. Every stage reports its progress to a
/// [`WaitingHandler`] and stops when it is cancelled.
pub struct PtmLocalizationEngine<R: ModificationRegistry, S: SiteProbabilityScorer> {
    registry: R,
    scorer: S,
    params: PtmScoringParams,
    psm_ptm_map: Mutex<PsmPtmMap>,
}

fn log_elapsed(stage: &str, start: Instant, count: usize, unit: &str) {
    let elapsed = start.elapsed();
    let rate = count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!("{stage} Elapsed Time: {:0.3?} ({:0.2} {unit}/sec)", elapsed, rate);
}

impl<R: ModificationRegistry, S: SiteProbabilityScorer> PtmLocalizationEngine<R, S> {
    pub fn new(registry: R, scorer: S, params: PtmScoringParams) -> Self {
        Self {
            registry,
            scorer,
            params,
            psm_ptm_map: Mutex::new(PsmPtmMap::new()),
        }
    }

    pub fn params(&self) -> &PtmScoringParams {
        &self.params
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// A copy of the false localization rate map collected so far
    pub fn psm_ptm_map(&self) -> PsmPtmMap {
        self.psm_ptm_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the false localization rate map, e.g. with one saved by an earlier run
    pub fn set_psm_ptm_map(&self, map: PsmPtmMap) {
        *self
            .psm_ptm_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = map;
    }

    fn finalized_map(&self) -> Option<PsmPtmMap> {
        if !self.params.estimate_flr {
            return None;
        }
        let map = self.psm_ptm_map();
        map.is_finalized().then_some(map)
    }

    fn attacher(&self) -> ScoreAttacher<'_, R, S> {
        ScoreAttacher::new(&self.registry, &self.scorer, &self.params)
    }

    fn classify(
        &self,
        spectrum_match: &mut SpectrumMatch,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<ProgressRecord, InconsistencyError> {
        let summary =
            SiteClassifier::new(&self.registry, &self.params).classify(spectrum_match, flr_map)?;
        Ok(ProgressRecord {
            psms_scored: 1,
            confident_sites: summary.confident_sites,
            ambiguous_sites: summary.ambiguous_sites,
            ..Default::default()
        })
    }

    /// Attach scores to a single spectrum match and classify its sites
    pub fn score_psm(
        &self,
        spectrum_match: &mut SpectrumMatch,
        flr_map: Option<&PsmPtmMap>,
    ) -> Result<ProgressRecord, InconsistencyError> {
        self.attacher().attach_scores(spectrum_match)?;
        self.classify(spectrum_match, flr_map)
    }

    fn collect_evidence(
        &self,
        spectrum_match: &mut SpectrumMatch,
    ) -> Result<ProgressRecord, InconsistencyError> {
        let attacher = self.attacher();
        attacher.attach_scores(spectrum_match)?;
        let evidence = attacher.localization_evidence(spectrum_match)?;
        if !evidence.is_empty() {
            let mut map = self
                .psm_ptm_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for point in evidence {
                map.add_point(point.mass, point.score, spectrum_match, point.is_conflict);
            }
        }
        Ok(ProgressRecord::default())
    }

    /// Score and classify every spectrum match of `store` on the worker pool.
    ///
    /// When false localization rate thresholds are estimated this runs twice over the
    /// store: once to attach scores and collect localization points, and once more to
    /// classify with the thresholds derived from them.
    pub fn score_psm_ptms<M: MatchStore + ?Sized>(
        &self,
        store: &M,
        handler: &dyn WaitingHandler,
    ) -> Result<ProgressRecord, PtmLocalizationError> {
        let start = Instant::now();
        let scheduler = ParallelScoringScheduler::from_params(&self.params);
        let count = store.spectrum_match_count();
        info!(
            "Scoring PTM sites of {count} spectrum matches with {} threads",
            scheduler.threads()
        );

        let record = if self.params.estimate_flr {
            handler.set_max_progress(count);
            scheduler.run(store, handler, |sm| self.collect_evidence(sm))?;
            if handler.is_cancelled() {
                return Ok(ProgressRecord::default());
            }
            let map = {
                let mut map = self
                    .psm_ptm_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                map.finalize(self.params.flr, self.params.flr_min_points);
                map.clone()
            };
            debug!(
                "Estimated localization thresholds from {} points",
                map.point_count()
            );
            handler.set_max_progress(count);
            scheduler.run(store, handler, |sm| self.classify(sm, Some(&map)))?
        } else {
            handler.set_max_progress(count);
            scheduler.run(store, handler, |sm| self.score_psm(sm, None))?
        };

        info!(
            "Scored {} spectrum matches: {} confident sites, {} ambiguous sites",
            record.psms_scored, record.confident_sites, record.ambiguous_sites
        );
        log_elapsed("PSM scoring", start, record.psms_scored, "PSMs");
        Ok(record)
    }

    /// Infer the unresolved sites of spectrum matches from related confident ones
    pub fn peptide_inference<M: MatchStore + ?Sized>(
        &self,
        store: &M,
        handler: &dyn WaitingHandler,
    ) -> Result<ProgressRecord, PtmLocalizationError> {
        if !self.params.peptide_inference {
            debug!("Peptide inference is disabled");
            return Ok(ProgressRecord::default());
        }
        let start = Instant::now();
        let map = self.finalized_map();
        let engine = PeptideInferenceEngine::new(&self.registry, &self.params, store);
        let record = engine.run(handler, map.as_ref()).map_err(|e| {
            handler.report_error(&e);
            e
        })?;
        info!("Inferred sites for {} spectrum matches", record.psms_inferred);
        log_elapsed(
            "Peptide inference",
            start,
            store.spectrum_match_count(),
            "PSMs",
        );
        Ok(record)
    }

    fn aggregate<F>(
        &self,
        stage: &str,
        keys: Vec<String>,
        handler: &dyn WaitingHandler,
        score: F,
    ) -> Result<ProgressRecord, PtmLocalizationError>
    where
        F: Fn(&str) -> Result<ProgressRecord, InconsistencyError>,
    {
        let start = Instant::now();
        handler.set_max_progress(keys.len());
        let mut total = ProgressRecord::default();
        for key in keys.iter() {
            if handler.is_cancelled() {
                info!("{stage} cancelled");
                break;
            }
            match score(key) {
                Ok(record) => total += record,
                Err(e) => {
                    handler.report_error(&e);
                    return Err(e.into());
                }
            }
            handler.increase_progress();
        }
        info!(
            "{stage}: {} confident sites, {} ambiguous sites",
            total.confident_sites, total.ambiguous_sites
        );
        log_elapsed(stage, start, keys.len(), "matches");
        Ok(total)
    }

    /// Merge spectrum level localizations into every peptide match of `store`
    pub fn score_peptide_ptms<M: MatchStore + ?Sized>(
        &self,
        store: &M,
        handler: &dyn WaitingHandler,
    ) -> Result<ProgressRecord, PtmLocalizationError> {
        let engine = AggregationEngine::new(&self.registry, &self.params, store);
        self.aggregate(
            "Peptide scoring",
            store.peptide_match_keys(),
            handler,
            |key| engine.score_peptide(key),
        )
    }

    /// Translate peptide level localizations onto every protein match of `store`
    pub fn score_protein_ptms<M: MatchStore + ?Sized>(
        &self,
        store: &M,
        handler: &dyn WaitingHandler,
    ) -> Result<ProgressRecord, PtmLocalizationError> {
        let engine = AggregationEngine::new(&self.registry, &self.params, store);
        self.aggregate(
            "Protein scoring",
            store.protein_match_keys(),
            handler,
            |key| engine.score_protein(key),
        )
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fixtures::{params, psm, registry, TitleScorer};
    use crate::modification::ModificationTable;
    use crate::progress::CancellationToken;
    use crate::site::SiteConfidence;
    use crate::store::InMemoryMatchStore;

    fn scorer(scores: &[(&str, &[(usize, f64)])]) -> TitleScorer {
        TitleScorer(
            scores
                .iter()
                .map(|(title, sites)| (title.to_string(), sites.iter().copied().collect()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn store_with(titles: &[&str]) -> InMemoryMatchStore {
        let store = InMemoryMatchStore::new();
        store.add_protein_sequence("PROT1", "MKPESAAASKR");
        for title in titles {
            store.insert_spectrum_match(psm(
                "run",
                title,
                "PESAAASK",
                &[(&[("Phospho", 3)], 0.01)],
            ));
        }
        store
    }

    fn tier_at(store: &InMemoryMatchStore, title: &str) -> (usize, SiteConfidence) {
        let sm = store.spectrum_match(&format!("run:{title}")).unwrap();
        let m = sm.best_peptide().unwrap().variable_modifications().next().unwrap().clone();
        let tier = sm
            .ptm_scores
            .as_ref()
            .unwrap()
            .scoring(&m.name)
            .unwrap()
            .confidence(m.site)
            .unwrap();
        (m.site, tier)
    }

    fn engine(
        scores: &[(&str, &[(usize, f64)])],
        params: PtmScoringParams,
    ) -> PtmLocalizationEngine<ModificationTable, TitleScorer> {
        PtmLocalizationEngine::new(registry(), scorer(scores), params)
    }

    #[test_log::test]
    fn test_full_pipeline() {
        let store = store_with(&["1", "2", "3"]);
        let engine = engine(
            &[
                ("1", &[(3, 99.0), (7, 1.0)]),
                ("2", &[(3, 98.0), (7, 2.0)]),
                ("3", &[(3, 40.0), (7, 60.0)]),
            ],
            params(),
        );
        let handler = CancellationToken::new();

        let psms = engine.score_psm_ptms(&store, &handler).unwrap();
        assert_eq!(psms.psms_scored, 3);
        assert_eq!(psms.confident_sites, 2);
        assert_eq!(tier_at(&store, "3"), (7, SiteConfidence::Doubtful));

        let inferred = engine.peptide_inference(&store, &handler).unwrap();
        assert_eq!(inferred.psms_inferred, 1);
        let sm = store.spectrum_match("run:3").unwrap();
        let m = sm.best_peptide().unwrap().variable_modifications().next().unwrap();
        // moved from S7, so inferred without becoming confident
        assert_eq!((m.site, m.confident, m.inferred), (3, false, true));

        assert_eq!(store.group_matches(), (2, 1));
        let peptides = engine.score_peptide_ptms(&store, &handler).unwrap();
        assert_eq!(peptides.peptides_scored, 2);
        assert_eq!(peptides.confident_sites, 1);
        assert_eq!(peptides.ambiguous_sites, 1);
        let ambiguous = store.peptide_match("PESAAASK_Phospho").unwrap();
        let group = ambiguous.ptm_scores.as_ref().unwrap().ambiguous_group(3).unwrap();
        assert!(group.contains_key(&7));

        let proteins = engine.score_protein_ptms(&store, &handler).unwrap();
        assert_eq!(proteins.proteins_scored, 1);
        let scores = store.protein_match("PROT1").unwrap().ptm_scores.unwrap();
        assert_eq!(scores.confident_sites().map(|(s, _)| *s).collect::<Vec<_>>(), vec![5]);
        assert_eq!(scores.ambiguous_groups().count(), 0);
        assert!(handler.errors().is_empty());
    }

    #[test_log::test]
    fn test_site_inferred_in_place_joins_confident_peptide() {
        let store = store_with(&["1", "2"]);
        let engine = engine(
            &[("1", &[(3, 99.0), (7, 1.0)]), ("2", &[(3, 60.0), (7, 40.0)])],
            params(),
        );
        let handler = CancellationToken::new();

        let psms = engine.score_psm_ptms(&store, &handler).unwrap();
        assert_eq!(psms.confident_sites, 1);
        assert_eq!(tier_at(&store, "2"), (3, SiteConfidence::Doubtful));

        let inferred = engine.peptide_inference(&store, &handler).unwrap();
        assert_eq!(inferred.psms_inferred, 1);
        let sm = store.spectrum_match("run:2").unwrap();
        let m = sm.best_peptide().unwrap().variable_modifications().next().unwrap();
        assert_eq!((m.site, m.confident, m.inferred), (3, true, true));
        assert_eq!(tier_at(&store, "2"), (3, SiteConfidence::Confident));

        assert_eq!(store.group_matches(), (1, 1));
        let peptides = engine.score_peptide_ptms(&store, &handler).unwrap();
        assert_eq!(peptides.peptides_scored, 1);
        assert_eq!(peptides.confident_sites, 1);
        assert_eq!(peptides.ambiguous_sites, 0);
        let peptide = store.peptide_match("PESAAASK_Phospho@3").unwrap();
        assert_eq!(peptide.spectrum_match_keys.len(), 2);
    }

    #[test_log::test]
    fn test_estimated_thresholds() {
        let scores: &[(&str, &[(usize, f64)])] = &[
            ("1", &[(3, 90.0), (7, 10.0)]),
            ("2", &[(3, 85.0), (7, 15.0)]),
            ("3", &[(3, 20.0), (7, 80.0)]),
        ];

        let store = store_with(&["1", "2", "3"]);
        let fixed = engine(scores, params());
        fixed
            .score_psm_ptms(&store, &CancellationToken::new())
            .unwrap();
        assert_eq!(tier_at(&store, "1"), (3, SiteConfidence::Doubtful));
        assert!(fixed.psm_ptm_map().is_empty());

        let store = store_with(&["1", "2", "3"]);
        let estimated = engine(
            scores,
            PtmScoringParams {
                estimate_flr: true,
                flr_min_points: 1,
                ..params()
            },
        );
        let record = estimated
            .score_psm_ptms(&store, &CancellationToken::new())
            .unwrap();
        assert_eq!(record.psms_scored, 3);
        let map = estimated.psm_ptm_map();
        assert!(map.is_finalized());
        assert_eq!(map.point_count(), 3);
        assert_eq!(map.score_limit(crate::fixtures::PHOSPHO, 2), Some(-85.0));

        assert_eq!(tier_at(&store, "1"), (3, SiteConfidence::VeryConfident));
        assert_eq!(tier_at(&store, "2"), (3, SiteConfidence::Doubtful));
        assert_eq!(tier_at(&store, "3"), (7, SiteConfidence::Doubtful));

        let restored = engine(scores, params());
        restored.set_psm_ptm_map(map.clone());
        assert_eq!(restored.psm_ptm_map(), map);
    }

    #[test]
    fn test_inconsistency_is_reported() {
        let store = InMemoryMatchStore::new();
        store.insert_spectrum_match(psm(
            "run",
            "1",
            "PESAAASK",
            &[(&[("Phospho", 3), ("Phospho", 3)], 0.01)],
        ));
        let engine = engine(&[], params());
        let handler = CancellationToken::new();
        let err = engine.score_psm_ptms(&store, &handler).unwrap_err();
        assert!(matches!(
            err,
            PtmLocalizationError::Inconsistency(InconsistencyError::DuplicateSiteScore {
                site: 3,
                ..
            })
        ));
        assert_eq!(handler.errors().len(), 1);
    }
}
