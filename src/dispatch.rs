//! Fan-out of pair scoring across a worker pool.
//!
//! Pairs are split into fixed-size chunks, several per worker, and the
//! cancellation token is checked before each chunk starts. Workers only read
//! the shared cache; each writes into its own result buffer. Buffers are merged in
//! ascending `(from, to)` order and then committed to the cache by the
//! dispatching thread, so results do not depend on worker scheduling.
//!
//! A chunk whose worker fails (error or panic) is retried once on the
//! dispatching thread. If the retry fails as well, its pairs are reported
//! as partial results without a score; other chunks are unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;

use crate::item_id::ItemId;
use crate::semantic::{PairScore, PairScorer, SimilarityCache};

/// Default minimum number of uncached pairs before fanning out
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 200;

/// Pairs per chunk; cancellation is observed at chunk boundaries.
pub const CHUNK_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker failed on chunk {chunk}: {reason}")]
    WorkerFailure { chunk: usize, reason: String },
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredPair {
    pub from: ItemId,
    pub to: ItemId,
    pub score: PairScore,
}

/// A pair whose chunk failed twice; `score` is always `None`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PartialResult {
    pub from: ItemId,
    pub to: ItemId,
    pub score: Option<PairScore>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Every scored pair, ascending `(from, to)`.
    pub scores: Vec<ScoredPair>,
    pub failures: Vec<PartialResult>,
    /// Pairs left unscored because the run was cancelled.
    pub pending: Vec<(ItemId, ItemId)>,
    pub cancelled: bool,
    pub workers: usize,
    pub cache_hits: usize,
    pub computed: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Dispatcher {
    workers: usize,
    parallel_threshold: usize,
}

enum ChunkOutcome {
    Done(Vec<ScoredPair>),
    Failed(DispatchError),
    Cancelled,
}

impl Dispatcher {
    pub fn new(workers: usize, parallel_threshold: usize) -> Self {
        Self {
            workers: workers.max(1),
            parallel_threshold,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Score `pairs`, reusing and then extending `cache`.
    pub fn run<S: PairScorer>(
        &self,
        scorer: &S,
        pairs: &[(ItemId, ItemId)],
        cache: &SimilarityCache,
        method_version: u64,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut misses = Vec::new();

        for (from, to) in pairs {
            match cache.get(from, to, method_version) {
                Some(score) => report.scores.push(ScoredPair {
                    from: from.clone(),
                    to: to.clone(),
                    score,
                }),
                None => misses.push((from.clone(), to.clone())),
            }
        }
        report.cache_hits = report.scores.len();

        let parallel = self.workers > 1 && misses.len() >= self.parallel_threshold;
        let chunks: Vec<Vec<(ItemId, ItemId)>> =
            misses.chunks(CHUNK_SIZE).map(|chunk| chunk.to_vec()).collect();
        report.workers = if parallel { self.workers } else { 1 };

        log::debug!(
            "dispatch pairs={} cached={} chunks={} parallel={}",
            pairs.len(),
            report.cache_hits,
            chunks.len(),
            parallel
        );

        let outcomes = if parallel {
            self.run_parallel(scorer, &chunks, cancel)
        } else {
            chunks
                .iter()
                .enumerate()
                .map(|(idx, chunk)| run_guarded(scorer, idx, chunk, cancel))
                .collect()
        };

        let mut computed = Vec::new();
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            let chunk = &chunks[idx];
            match outcome {
                ChunkOutcome::Done(scores) => computed.extend(scores),
                ChunkOutcome::Cancelled => {
                    report.cancelled = true;
                    report.pending.extend(chunk.iter().cloned());
                }
                ChunkOutcome::Failed(err) => {
                    log::warn!("{err}; retrying sequentially");
                    match run_chunk(scorer, idx, chunk) {
                        Ok(scores) => computed.extend(scores),
                        Err(retry_err) => {
                            log::error!("chunk {idx} failed after retry: {retry_err}");
                            report.failures.extend(chunk.iter().map(|(from, to)| PartialResult {
                                from: from.clone(),
                                to: to.clone(),
                                score: None,
                                reason: retry_err.to_string(),
                            }));
                        }
                    }
                }
            }
        }

        report.cancelled |= cancel.is_cancelled();
        if report.cancelled {
            log::info!(
                "dispatch cancelled: {} pairs left unscored",
                report.pending.len()
            );
        }

        computed.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        let batch: Vec<(ItemId, ItemId, PairScore)> = computed
            .iter()
            .map(|pair| (pair.from.clone(), pair.to.clone(), pair.score))
            .collect();
        cache.count_computations(batch.len() as u64);
        cache.commit(method_version, &batch);
        report.computed = computed.len();

        report.scores.extend(computed);
        report
            .scores
            .sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        report
            .failures
            .sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        report
    }

    fn run_parallel<S: PairScorer>(
        &self,
        scorer: &S,
        chunks: &[Vec<(ItemId, ItemId)>],
        cancel: &CancellationToken,
    ) -> Vec<ChunkOutcome> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("vocablink-worker-{i}"))
            .build();

        match pool {
            Ok(pool) => pool.install(|| {
                chunks
                    .par_iter()
                    .enumerate()
                    .map(|(idx, chunk)| run_guarded(scorer, idx, chunk, cancel))
                    .collect()
            }),
            Err(err) => {
                log::warn!("thread pool unavailable ({err}), scoring sequentially");
                chunks
                    .iter()
                    .enumerate()
                    .map(|(idx, chunk)| run_guarded(scorer, idx, chunk, cancel))
                    .collect()
            }
        }
    }
}

fn run_guarded<S: PairScorer>(
    scorer: &S,
    idx: usize,
    chunk: &[(ItemId, ItemId)],
    cancel: &CancellationToken,
) -> ChunkOutcome {
    if cancel.is_cancelled() {
        return ChunkOutcome::Cancelled;
    }
    match run_chunk(scorer, idx, chunk) {
        Ok(scores) => ChunkOutcome::Done(scores),
        Err(err) => ChunkOutcome::Failed(err),
    }
}

/// Score one chunk into a local buffer. Panics are contained.
fn run_chunk<S: PairScorer>(
    scorer: &S,
    idx: usize,
    chunk: &[(ItemId, ItemId)],
) -> Result<Vec<ScoredPair>, DispatchError> {
    let result = catch_unwind(AssertUnwindSafe(|| {
        chunk
            .iter()
            .map(|(from, to)| {
                scorer.score_pair(from, to).map(|score| ScoredPair {
                    from: from.clone(),
                    to: to.clone(),
                    score,
                })
            })
            .collect::<Result<Vec<_>, _>>()
    }));

    match result {
        Ok(Ok(scores)) => Ok(scores),
        Ok(Err(err)) => Err(DispatchError::WorkerFailure {
            chunk: idx,
            reason: err.to_string(),
        }),
        Err(panic) => Err(DispatchError::WorkerFailure {
            chunk: idx,
            reason: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}
