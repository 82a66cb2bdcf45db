use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::InconsistencyError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub psms_scored: usize,
    pub confident_sites: usize,
    pub ambiguous_sites: usize,
    pub psms_inferred: usize,
    pub peptides_scored: usize,
    pub proteins_scored: usize,
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.psms_scored += rhs.psms_scored;
        self.confident_sites += rhs.confident_sites;
        self.ambiguous_sites += rhs.ambiguous_sites;
        self.psms_inferred += rhs.psms_inferred;
        self.peptides_scored += rhs.peptides_scored;
        self.proteins_scored += rhs.proteins_scored;
    }
}

impl Sum for ProgressRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, x| acc + x)
    }
}

/// Receives progress from long running operations and tells them when to stop
pub trait WaitingHandler: Send + Sync {
    fn set_max_progress(&self, max_progress: usize);
    fn increase_progress(&self);
    fn is_cancelled(&self) -> bool;
    fn cancel(&self);
    /// Called once for every inconsistency that halts a batch
    fn report_error(&self, error: &InconsistencyError);
}

/// A [`WaitingHandler`] that logs progress every tenth of the way and keeps the errors it is given
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    progress: AtomicUsize,
    max_progress: AtomicUsize,
    errors: Mutex<Vec<InconsistencyError>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> Vec<InconsistencyError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl WaitingHandler for CancellationToken {
    fn set_max_progress(&self, max_progress: usize) {
        self.progress.store(0, Ordering::Relaxed);
        self.max_progress.store(max_progress, Ordering::Relaxed);
    }

    fn increase_progress(&self) {
        let done = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.max_progress.load(Ordering::Relaxed);
        if total >= 10 && done % (total / 10) == 0 && done <= total {
            info!("{}% ({done}/{total})", done * 100 / total);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn report_error(&self, error: &InconsistencyError) {
        error!("{error}");
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.clone());
    }
}
