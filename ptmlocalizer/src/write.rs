use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use serde::Serialize;

use ptmlocalize::flr::PsmPtmMap;
use ptmlocalize::{
    MatchStore, ModificationMatch, ProgressRecord, PtmScores, PtmScoringParams,
};

use crate::driver::PtmLocalizerError;

#[derive(Debug, Clone, Serialize)]
pub struct SpectrumMatchReport {
    pub key: String,
    pub spectrum_file: String,
    pub spectrum_title: String,
    pub charge: i32,
    pub validated: bool,
    pub sequence: Option<String>,
    pub modifications: Vec<ModificationMatch>,
    pub ptm_scores: Option<PtmScores>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeptideReport {
    pub key: String,
    pub sequence: String,
    pub modifications: Vec<ModificationMatch>,
    pub spectrum_match_keys: Vec<String>,
    pub ptm_scores: Option<PtmScores>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProteinReport {
    pub accession: String,
    pub peptide_match_keys: Vec<String>,
    pub confident_sites: Vec<usize>,
    pub ptm_scores: Option<PtmScores>,
}

/// Everything a localization run produced, ready to be written out
#[derive(Debug, Clone, Serialize)]
pub struct LocalizationReport {
    pub version: String,
    pub parameters: PtmScoringParams,
    pub summary: ProgressRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization_thresholds: Option<PsmPtmMap>,
    pub spectrum_matches: Vec<SpectrumMatchReport>,
    pub peptides: Vec<PeptideReport>,
    pub proteins: Vec<ProteinReport>,
}

impl LocalizationReport {
    pub fn collect<M: MatchStore + ?Sized>(
        store: &M,
        parameters: &PtmScoringParams,
        summary: ProgressRecord,
        localization_thresholds: Option<PsmPtmMap>,
    ) -> Self {
        let spectrum_matches = store
            .spectrum_files()
            .iter()
            .flat_map(|file| store.spectrum_match_keys(file))
            .filter_map(|key| store.spectrum_match(&key))
            .map(|sm| {
                let (sequence, modifications) = match sm.best_peptide() {
                    Some(peptide) => (
                        Some(peptide.sequence.clone()),
                        peptide.modification_matches.clone(),
                    ),
                    None => (None, Vec::new()),
                };
                SpectrumMatchReport {
                    key: sm.key,
                    spectrum_file: sm.spectrum_file,
                    spectrum_title: sm.spectrum_title,
                    charge: sm.charge,
                    validated: sm.validated,
                    sequence,
                    modifications,
                    ptm_scores: sm.ptm_scores,
                }
            })
            .collect_vec();

        let peptides = store
            .peptide_match_keys()
            .iter()
            .filter_map(|key| store.peptide_match(key))
            .map(|pm| PeptideReport {
                key: pm.key,
                sequence: pm.peptide.sequence,
                modifications: pm.peptide.modification_matches,
                spectrum_match_keys: pm.spectrum_match_keys,
                ptm_scores: pm.ptm_scores,
            })
            .collect_vec();

        let proteins = store
            .protein_match_keys()
            .iter()
            .filter_map(|key| store.protein_match(key))
            .map(|pm| ProteinReport {
                confident_sites: pm
                    .ptm_scores
                    .as_ref()
                    .map(|s| s.confident_sites().map(|(site, _)| *site).collect_vec())
                    .unwrap_or_default(),
                accession: pm.accession,
                peptide_match_keys: pm.peptide_match_keys,
                ptm_scores: pm.ptm_scores,
            })
            .collect_vec();

        Self {
            version: option_env!("CARGO_PKG_VERSION")
                .unwrap_or("unknown")
                .to_string(),
            parameters: parameters.clone(),
            summary,
            localization_thresholds,
            spectrum_matches,
            peptides,
            proteins,
        }
    }
}

fn open_output(path: &Path) -> io::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::BufWriter::new(io::stdout().lock())));
    }
    let handle = io::BufWriter::new(fs::File::create(path)?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(GzEncoder::new(handle, Compression::best())))
    } else {
        Ok(Box::new(handle))
    }
}

/// Write `value` as JSON to `path`, `-` meaning STDOUT
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), PtmLocalizerError> {
    let mut writer = open_output(path)?;
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}
