use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::cache::{ChunkCache, ChunkRecord, PutOutcome};
use super::payload::{self, ParsedResponse};
use super::planner::{ChunkKey, PlannedChunk};
use super::{BatchRequest, TranslationBackend};
use crate::error::Result;
use crate::quality::ContentPolicy;
use crate::subtitle::CueId;

/// Result of executing one chunk. Backend trouble is reported here, not as an error.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub key: ChunkKey,
    pub success: bool,
    pub outputs: BTreeMap<CueId, String>,
    pub missing: Vec<CueId>,
    /// Rows that came back but failed the content check
    pub rejected: Vec<(CueId, String)>,
    pub error: Option<String>,
    pub diagnostic: Option<PathBuf>,
    pub elapsed: Duration,
}

impl ChunkOutcome {
    /// Most specific explanation available for a failed chunk.
    pub fn failure_reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match self.rejected.first() {
            Some((id, reason)) => format!("cue {} rejected: {}", id, reason),
            None => "incomplete response".to_string(),
        }
    }
}

pub struct ChunkExecutor {
    backend: Arc<dyn TranslationBackend>,
    cache: Arc<ChunkCache>,
    timeout: Duration,
    source_language: String,
}

impl ChunkExecutor {
    pub fn new(
        backend: Arc<dyn TranslationBackend>,
        cache: Arc<ChunkCache>,
        timeout: Duration,
        source_language: &str,
    ) -> Self {
        Self {
            backend,
            cache,
            timeout,
            source_language: source_language.to_string(),
        }
    }

    /// Send one chunk, validate the answer row by row, and record the result. A chunk
    /// succeeds only when every input id came back with acceptable output.
    pub async fn execute(&self, chunk: &PlannedChunk) -> Result<ChunkOutcome> {
        let track = chunk.key.track;
        let rows = payload::build_rows(&chunk.rows);
        let request = BatchRequest {
            track,
            chunk: chunk.key.file_stem(),
            prompt: payload::render_prompt(track, &self.source_language, &rows),
            rows,
        };

        let started = Instant::now();
        let response = match tokio::time::timeout(self.timeout, self.backend.complete(&request)).await {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("backend call timed out after {}s", self.timeout.as_secs())),
        };
        let elapsed = started.elapsed();

        let (raw, parsed, error) = match response {
            Ok(raw) => {
                let parsed = payload::parse_response(&raw, &request.rows);
                (raw, parsed, None)
            }
            Err(error) => (String::new(), ParsedResponse::default(), Some(error)),
        };

        let policy = ContentPolicy::for_track(track);
        let mut outputs = BTreeMap::new();
        let mut rejected = Vec::new();
        for row in &chunk.rows {
            if let Some(text) = parsed.outputs.get(&row.id) {
                match policy.check(&row.text, text) {
                    Ok(()) => {
                        outputs.insert(row.id, text.clone());
                    }
                    Err(violation) => rejected.push((row.id, violation.to_string())),
                }
            }
        }

        let triples: Vec<(CueId, &str, &str)> = chunk
            .rows
            .iter()
            .filter_map(|r| outputs.get(&r.id).map(|o| (r.id, r.text.as_str(), o.as_str())))
            .collect();
        let repetitive = policy.repetitive_ids(&triples);
        for id in repetitive {
            outputs.remove(&id);
            rejected.push((id, "same output for unrelated cues".to_string()));
        }

        let missing: Vec<CueId> = chunk.ids().into_iter().filter(|id| !outputs.contains_key(id)).collect();
        let success = error.is_none() && missing.is_empty();

        let mut record = ChunkRecord::planned(chunk);
        record.attempted = true;
        record.success = success;
        record.outputs = outputs.clone();
        record.missing = missing.clone();
        record.error = error.clone();
        record.updated_at = Utc::now();

        let mut diagnostic = None;
        if !success {
            let body = diagnostic_body(chunk, &raw, &parsed, &missing, &rejected, error.as_deref());
            diagnostic = Some(self.cache.write_diagnostic(&chunk.key, &body).await?);
            record.diagnostic = diagnostic.clone();
            warn!(
                "Chunk {} [{}] failed: {} of {} rows missing{}",
                chunk.key.file_stem(),
                track,
                missing.len(),
                chunk.rows.len(),
                error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default()
            );
        } else {
            info!(
                "Chunk {} [{}] done: {} rows in {:.1}s",
                chunk.key.file_stem(),
                track,
                chunk.rows.len(),
                elapsed.as_secs_f64()
            );
        }

        if self.cache.put(&record).await? == PutOutcome::Refused {
            debug!("Chunk {} was completed concurrently", chunk.key.file_stem());
        }

        Ok(ChunkOutcome {
            key: chunk.key.clone(),
            success,
            outputs,
            missing,
            rejected,
            error,
            diagnostic,
            elapsed,
        })
    }
}

fn diagnostic_body(
    chunk: &PlannedChunk,
    raw: &str,
    parsed: &ParsedResponse,
    missing: &[CueId],
    rejected: &[(CueId, String)],
    error: Option<&str>,
) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "chunk: {}", chunk.key.file_stem());
    let _ = writeln!(body, "track: {}", chunk.key.track);
    let _ = writeln!(body, "episode: {}", chunk.key.episode_id);
    let _ = writeln!(body, "rows: {}", chunk.rows.len());
    if let Some(error) = error {
        let _ = writeln!(body, "error: {}", error);
    }
    let _ = writeln!(
        body,
        "unknown ids: {}, echo mismatches: {}, duplicates: {}",
        parsed.unknown, parsed.echo_mismatch, parsed.duplicates
    );
    let ids: Vec<String> = missing.iter().map(|id| id.to_string()).collect();
    let _ = writeln!(body, "missing: {}", ids.join(","));
    for (id, reason) in rejected {
        let _ = writeln!(body, "rejected {}: {}", id, reason);
    }
    let _ = writeln!(body, "\n--- response ---\n{}", raw);
    body
}
