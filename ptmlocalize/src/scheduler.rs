//! Score spectrum matches concurrently, one spectrum file at a time.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, debug_span, warn};

use crate::error::{InconsistencyError, PtmLocalizationError};
use crate::matches::SpectrumMatch;
use crate::params::PtmScoringParams;
use crate::progress::{ProgressRecord, WaitingHandler};
use crate::store::{MatchStore, PsmIterator};

type TaskOutcome = Result<ProgressRecord, InconsistencyError>;

/// Runs a per-match task over every spectrum match of a [`MatchStore`] with a fixed
/// number of worker threads.
///
/// Workers pull keys from a shared [`PsmIterator`], run the task on their own copy of the
/// match and write it back before taking the next one. The calling thread gathers their
/// outcomes. The first inconsistency is reported to the [`WaitingHandler`] and stops the
/// remaining work, as does cancellation, but matches already written stay written.
#[derive(Debug, Clone)]
pub struct ParallelScoringScheduler {
    threads: usize,
    timeout: Duration,
    buffer_size: usize,
}

impl ParallelScoringScheduler {
    pub fn new(threads: usize, timeout: Duration, buffer_size: usize) -> Self {
        Self {
            threads: threads.max(1),
            timeout,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn from_params(params: &PtmScoringParams) -> Self {
        Self::new(
            params.thread_count(),
            params.pool_timeout(),
            params.channel_buffer_size,
        )
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, PtmLocalizationError> {
        debug!("Using {} cores", self.threads);
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?)
    }

    pub fn run<M, F>(
        &self,
        store: &M,
        handler: &dyn WaitingHandler,
        task: F,
    ) -> Result<ProgressRecord, PtmLocalizationError>
    where
        M: MatchStore + ?Sized,
        F: Fn(&mut SpectrumMatch) -> TaskOutcome + Sync,
    {
        let pool = self.create_threadpool()?;
        let halt = AtomicBool::new(false);
        let mut total = ProgressRecord::default();
        let mut first_error: Option<InconsistencyError> = None;

        for spectrum_file in store.spectrum_files() {
            if handler.is_cancelled() {
                debug!("Cancelled before {spectrum_file}");
                break;
            }
            let span = debug_span!("score_file", file = %spectrum_file);
            let _entered = span.enter();

            let psms = store.psm_iterator(&spectrum_file);
            debug!("Scoring {} spectrum matches", psms.len());
            let deadline = Instant::now() + self.timeout;
            let (sender, receiver) = bounded::<TaskOutcome>(self.buffer_size);

            let timed_out = thread::scope(|scope| {
                scope.spawn(|| {
                    pool.scope(|pool_scope| {
                        for _ in 0..self.threads {
                            let sender = sender.clone();
                            let (psms, halt, task) = (&psms, &halt, &task);
                            pool_scope.spawn(move |_| {
                                worker(store, handler, psms, halt, task, sender)
                            });
                        }
                    });
                    drop(sender);
                });

                let mut timed_out = false;
                loop {
                    match receiver.recv_deadline(deadline) {
                        Ok(Ok(record)) => {
                            total += record;
                            handler.increase_progress();
                        }
                        Ok(Err(e)) => {
                            halt.store(true, Ordering::SeqCst);
                            if first_error.is_none() {
                                handler.report_error(&e);
                                first_error = Some(e);
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!("Scoring {spectrum_file} exceeded {:?}", self.timeout);
                            halt.store(true, Ordering::SeqCst);
                            timed_out = true;
                            // let in-flight workers finish their current match
                            for _ in receiver.iter() {}
                            break;
                        }
                    }
                }
                timed_out
            });

            if timed_out {
                return Err(PtmLocalizationError::Timeout(self.timeout));
            }
            if let Some(e) = first_error.take() {
                return Err(e.into());
            }
        }
        Ok(total)
    }
}

fn worker<M, F>(
    store: &M,
    handler: &dyn WaitingHandler,
    psms: &PsmIterator,
    halt: &AtomicBool,
    task: &F,
    sender: Sender<TaskOutcome>,
) where
    M: MatchStore + ?Sized,
    F: Fn(&mut SpectrumMatch) -> TaskOutcome + Sync,
{
    while !halt.load(Ordering::SeqCst) && !handler.is_cancelled() {
        let Some(key) = psms.next_key() else {
            break;
        };
        let outcome = match store.spectrum_match(&key) {
            Some(mut spectrum_match) => {
                let outcome = task(&mut spectrum_match);
                if outcome.is_ok() {
                    store.update_spectrum_match(spectrum_match);
                }
                outcome
            }
            None => Err(InconsistencyError::MissingMatch {
                kind: "spectrum match",
                key,
            }),
        };
        if outcome.is_err() {
            halt.store(true, Ordering::SeqCst);
        }
        if sender.send(outcome).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::psm;
    use crate::progress::CancellationToken;
    use crate::store::InMemoryMatchStore;

    fn store(n_files: usize, n_psms: usize) -> InMemoryMatchStore {
        let store = InMemoryMatchStore::new();
        for f in 0..n_files {
            for i in 0..n_psms {
                store.insert_spectrum_match(psm(
                    &format!("run{f}"),
                    &format!("scan={i}"),
                    "PEPTSK",
                    &[(&[("Phospho", 4)], 0.01)],
                ));
            }
        }
        store
    }

    #[test_log::test]
    fn test_scores_every_match() {
        let store = store(2, 50);
        let handler = CancellationToken::new();
        let scheduler = ParallelScoringScheduler::new(4, Duration::from_secs(60), 8);
        let total = scheduler
            .run(&store, &handler, |sm| {
                sm.validated = false;
                Ok(ProgressRecord {
                    psms_scored: 1,
                    ..Default::default()
                })
            })
            .unwrap();
        assert_eq!(total.psms_scored, 100);
        assert_eq!(handler.progress(), 100);
        for f in store.spectrum_files() {
            for key in store.spectrum_match_keys(&f) {
                assert!(!store.spectrum_match(&key).unwrap().validated);
            }
        }
    }

    #[test_log::test]
    fn test_error_halts() {
        let store = store(2, 40);
        let handler = CancellationToken::new();
        let scheduler = ParallelScoringScheduler::new(2, Duration::from_secs(60), 4);
        let err = scheduler
            .run(&store, &handler, |sm| {
                if sm.spectrum_title == "scan=5" {
                    Err(InconsistencyError::DuplicatePeptideKey(sm.key.clone()))
                } else {
                    sm.validated = false;
                    Ok(ProgressRecord {
                        psms_scored: 1,
                        ..Default::default()
                    })
                }
            })
            .unwrap_err();
        assert!(matches!(err, PtmLocalizationError::Inconsistency(_)));
        assert_eq!(handler.errors().len(), 1);
        // the failed match is not written back and the second file is never started
        assert!(store.spectrum_match("run0:scan=5").unwrap().validated);
        for key in store.spectrum_match_keys("run1") {
            assert!(store.spectrum_match(&key).unwrap().validated);
        }
    }

    #[test]
    fn test_cancellation() {
        let store = store(3, 10);
        let handler = CancellationToken::new();
        let scheduler = ParallelScoringScheduler::new(1, Duration::from_secs(60), 1);
        let total = scheduler
            .run(&store, &handler, |sm| {
                if sm.spectrum_title == "scan=2" {
                    handler.cancel();
                }
                Ok(ProgressRecord {
                    psms_scored: 1,
                    ..Default::default()
                })
            })
            .unwrap();
        assert_eq!(total.psms_scored, 3);
    }

    #[test]
    fn test_timeout() {
        let store = store(1, 4);
        let handler = CancellationToken::new();
        let scheduler = ParallelScoringScheduler::new(1, Duration::from_millis(10), 1);
        let err = scheduler
            .run(&store, &handler, |_| {
                thread::sleep(Duration::from_millis(50));
                Ok(ProgressRecord::default())
            })
            .unwrap_err();
        assert!(matches!(err, PtmLocalizationError::Timeout(_)));
    }
}
