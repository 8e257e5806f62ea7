//! Drives one track to completion over as many runs as it takes.
//!
//! Work proceeds in waves. Each wave looks every pending chunk up in the cache first:
//! complete chunks are merged without a call, chunks with a recorded failure are split
//! straight away, and the rest are executed on a bounded pool. Failed chunks are re-planned
//! into smaller chunks for the next wave until they succeed or can shrink no further, at
//! which point the track is aborted.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::cache::{ChunkCache, Lookup};
use super::executor::ChunkExecutor;
use super::planner::{next_chunk_size, ChunkKey, ChunkPlanner, PlannedChunk, SourceRow};
use crate::config::TranslateConfig;
use crate::error::{Result, SubweaveError};
use crate::subtitle::CueId;
use crate::tracks::TrackType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub chunk_size: usize,
    pub min_chunk_size: usize,
    pub max_retries: u32,
    pub workers: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &TranslateConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            min_chunk_size: config.min_chunk_size.max(1),
            max_retries: config.max_retries,
            workers: config.workers.max(1),
        }
    }

    fn can_split(&self, chunk: &PlannedChunk) -> bool {
        chunk.depth < self.max_retries && next_chunk_size(chunk.key.len(), self.min_chunk_size).is_some()
    }
}

/// Rows of one track for one episode.
#[derive(Debug, Clone)]
pub struct TrackJob {
    pub track: TrackType,
    pub episode_id: String,
    pub rows: Vec<SourceRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Done,
    Aborted,
}

/// A chunk that ran out of retries.
#[derive(Debug, Clone)]
pub struct AbortedChunk {
    pub key: ChunkKey,
    pub missing: Vec<CueId>,
    pub diagnostic: Option<PathBuf>,
    pub reason: String,
}

/// One executed chunk, in completion order.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub key: ChunkKey,
    pub depth: u32,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct TrackReport {
    pub track: TrackType,
    pub episode_id: String,
    pub status: TrackStatus,
    pub outputs: BTreeMap<CueId, String>,
    pub cache_hits: usize,
    pub external_calls: usize,
    pub waves: u32,
    pub attempts: Vec<Attempt>,
    pub aborted: Vec<AbortedChunk>,
}

impl TrackReport {
    fn new(job: &TrackJob) -> Self {
        Self {
            track: job.track,
            episode_id: job.episode_id.clone(),
            status: TrackStatus::Done,
            outputs: BTreeMap::new(),
            cache_hits: 0,
            external_calls: 0,
            waves: 0,
            attempts: Vec::new(),
            aborted: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == TrackStatus::Done
    }

    /// Error describing why the track was aborted.
    pub fn abort_error(&self) -> SubweaveError {
        let reason = self
            .aborted
            .first()
            .map(|a| {
                format!(
                    "chunk {} failed with {} rows missing: {}",
                    a.key.file_stem(),
                    a.missing.len(),
                    a.reason
                )
            })
            .unwrap_or_else(|| "incomplete output".to_string());
        SubweaveError::TrackAborted {
            track: self.track.to_string(),
            episode: self.episode_id.clone(),
            reason,
        }
    }

    fn merge(&mut self, outputs: &BTreeMap<CueId, String>, allowed: &BTreeSet<CueId>) {
        for (id, text) in outputs {
            if allowed.contains(id) {
                self.outputs.entry(*id).or_insert_with(|| text.clone());
            }
        }
    }
}

pub struct ResumeController {
    executor: Arc<ChunkExecutor>,
    cache: Arc<ChunkCache>,
    policy: RetryPolicy,
}

impl ResumeController {
    pub fn new(executor: Arc<ChunkExecutor>, cache: Arc<ChunkCache>, policy: RetryPolicy) -> Self {
        Self { executor, cache, policy }
    }

    pub async fn run(&self, job: &TrackJob) -> Result<TrackReport> {
        let planner = ChunkPlanner::new(job.track, &job.episode_id);
        let expected: BTreeSet<CueId> = job.rows.iter().map(|r| r.id).collect();
        if expected.len() != job.rows.len() {
            return Err(SubweaveError::Subtitle(format!(
                "Duplicate cue ids in {} rows of episode {}",
                job.track, job.episode_id
            )));
        }

        let mut report = TrackReport::new(job);
        let mut pending = planner.plan(&job.rows, self.policy.chunk_size);
        info!(
            "Track {} of {}: {} rows in {} chunks",
            job.track,
            job.episode_id,
            job.rows.len(),
            pending.len()
        );

        while !pending.is_empty() {
            report.waves += 1;
            let mut next = Vec::new();
            let mut to_execute = Vec::new();

            for chunk in pending.drain(..) {
                match self.cache.lookup(&chunk.key).await? {
                    Lookup::Satisfied(record) => {
                        report.cache_hits += 1;
                        report.merge(&record.outputs, &expected);
                    }
                    Lookup::Failed(_) if self.policy.can_split(&chunk) => {
                        debug!("Chunk {} failed before, splitting without a call", chunk.key.file_stem());
                        if let Some(children) = planner.replan(&job.rows, &chunk, self.policy.min_chunk_size) {
                            next.extend(children);
                        }
                    }
                    _ => to_execute.push(chunk),
                }
            }

            if !to_execute.is_empty() {
                self.execute_wave(&planner, job, to_execute, &expected, &mut report, &mut next)
                    .await?;
            }

            if !report.aborted.is_empty() {
                report.status = TrackStatus::Aborted;
                error!(
                    "Track {} of {} aborted after {} waves ({} chunks out of retries)",
                    job.track,
                    job.episode_id,
                    report.waves,
                    report.aborted.len()
                );
                return Ok(report);
            }
            pending = next;
        }

        let covered: BTreeSet<CueId> = report.outputs.keys().copied().collect();
        if covered != expected {
            report.status = TrackStatus::Aborted;
            warn!(
                "Track {} of {} finished with {} of {} ids covered",
                job.track,
                job.episode_id,
                covered.len(),
                expected.len()
            );
            return Ok(report);
        }

        info!(
            "Track {} of {} complete: {} calls, {} cache hits, {} waves",
            job.track, job.episode_id, report.external_calls, report.cache_hits, report.waves
        );
        Ok(report)
    }

    /// Execute chunks on the worker pool, handling outcomes as they complete. Once a chunk
    /// runs out of retries no further chunk is started, and results still in flight are
    /// dropped without being merged.
    async fn execute_wave(
        &self,
        planner: &ChunkPlanner,
        job: &TrackJob,
        chunks: Vec<PlannedChunk>,
        expected: &BTreeSet<CueId>,
        report: &mut TrackReport,
        next: &mut Vec<PlannedChunk>,
    ) -> Result<()> {
        let abort = AtomicBool::new(false);
        let abort = &abort;
        let executor = &self.executor;
        let cache = &self.cache;

        let mut results = stream::iter(chunks)
            .map(move |chunk| async move {
                if abort.load(Ordering::SeqCst) {
                    return (chunk, None);
                }
                let outcome = match cache.ensure_planned(&chunk).await {
                    Ok(()) => executor.execute(&chunk).await,
                    Err(e) => Err(e),
                };
                (chunk, Some(outcome))
            })
            .buffer_unordered(self.policy.workers);

        while let Some((chunk, outcome)) = results.next().await {
            let Some(outcome) = outcome else {
                debug!("Skipped chunk {} after abort", chunk.key.file_stem());
                continue;
            };
            let outcome = outcome?;
            report.external_calls += 1;
            report.attempts.push(Attempt {
                key: chunk.key.clone(),
                depth: chunk.depth,
                success: outcome.success,
            });

            if abort.load(Ordering::SeqCst) {
                continue;
            }

            if outcome.success {
                report.merge(&outcome.outputs, expected);
                continue;
            }

            match self
                .policy
                .can_split(&chunk)
                .then(|| planner.replan(&job.rows, &chunk, self.policy.min_chunk_size))
                .flatten()
            {
                Some(children) => {
                    debug!(
                        "Re-planning chunk {} into {} chunks of at most {}",
                        chunk.key.file_stem(),
                        children.len(),
                        children.first().map(|c| c.key.chunk_size).unwrap_or(0)
                    );
                    next.extend(children);
                }
                None => {
                    abort.store(true, Ordering::SeqCst);
                    report.aborted.push(AbortedChunk {
                        key: chunk.key.clone(),
                        missing: outcome.missing.clone(),
                        diagnostic: outcome.diagnostic.clone(),
                        reason: outcome.failure_reason(),
                    });
                }
            }
        }
        Ok(())
    }
}
