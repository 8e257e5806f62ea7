//! Persistent per-chunk records.
//!
//! Each chunk owns one JSON record under the chunk directory of its track layer, named
//! after the chunk size and row range. Records are replaced atomically, so a crash leaves
//! either the previous record or the new one. A failed chunk additionally gets a `.log`
//! file with the raw response and what was missing from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::planner::{ChunkKey, PlannedChunk};
use crate::error::{Result, SubweaveError};
use crate::layers::ArtifactStore;
use crate::quality::ContentPolicy;
use crate::subtitle::CueId;
use crate::tracks::TrackType;

/// Bumped whenever the record layout changes; older records are ignored.
pub const RECORD_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInput {
    pub id: CueId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub format: u32,
    pub key: ChunkKey,
    pub inputs: Vec<RecordInput>,
    #[serde(default)]
    pub outputs: BTreeMap<CueId, String>,
    pub success: bool,
    /// Whether a backend call was ever made for this chunk
    #[serde(default)]
    pub attempted: bool,
    #[serde(default)]
    pub missing: Vec<CueId>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub diagnostic: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// Record written at plan time, before any call is made.
    pub fn planned(chunk: &PlannedChunk) -> Self {
        Self {
            format: RECORD_FORMAT,
            key: chunk.key.clone(),
            inputs: chunk
                .rows
                .iter()
                .map(|r| RecordInput { id: r.id, text: r.text.clone() })
                .collect(),
            outputs: BTreeMap::new(),
            success: false,
            attempted: false,
            missing: Vec::new(),
            error: None,
            diagnostic: None,
            updated_at: Utc::now(),
        }
    }

    /// True when the record succeeded and holds policy-valid output for every input.
    pub fn is_complete(&self) -> bool {
        if !self.success || self.format != RECORD_FORMAT {
            return false;
        }
        let policy = ContentPolicy::for_track(self.key.track);
        self.inputs.iter().all(|input| {
            self.outputs
                .get(&input.id)
                .map(|out| policy.check(&input.text, out).is_ok())
                .unwrap_or(false)
        })
    }
}

/// State of a chunk as seen by the cache.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Complete record; its outputs can be used as is
    Satisfied(ChunkRecord),
    /// A call was made and did not produce a complete result
    Failed(ChunkRecord),
    /// Planned but never attempted
    Planned,
    /// No usable record
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// A complete record with the same key already exists and was kept
    Refused,
}

pub struct ChunkCache {
    store: ArtifactStore,
    write_lock: Mutex<()>,
}

impl ChunkCache {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn record_path(&self, key: &ChunkKey) -> PathBuf {
        self.chunk_dir(&key.episode_id, key.track)
            .join(format!("{}.json", key.file_stem()))
    }

    pub fn diagnostic_path(&self, key: &ChunkKey) -> PathBuf {
        self.chunk_dir(&key.episode_id, key.track)
            .join(format!("{}.log", key.file_stem()))
    }

    fn chunk_dir(&self, episode_id: &str, track: TrackType) -> PathBuf {
        self.store.episode(episode_id).chunk_dir(track.layer())
    }

    /// Record for `key`, or `None` when it is missing, unreadable, or was made for
    /// different input text.
    pub async fn get(&self, key: &ChunkKey) -> Result<Option<ChunkRecord>> {
        let path = self.record_path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: ChunkRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable chunk record {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        if record.format != RECORD_FORMAT || record.key != *key {
            debug!("Chunk record {} does not match its key, treating as absent", path.display());
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn lookup(&self, key: &ChunkKey) -> Result<Lookup> {
        Ok(match self.get(key).await? {
            Some(record) if record.is_complete() => Lookup::Satisfied(record),
            Some(record) if record.attempted => Lookup::Failed(record),
            Some(_) => Lookup::Planned,
            None => Lookup::Absent,
        })
    }

    pub async fn is_satisfied(&self, key: &ChunkKey) -> Result<bool> {
        Ok(matches!(self.lookup(key).await?, Lookup::Satisfied(_)))
    }

    /// Store `record`, unless a complete record for the same key is already there.
    pub async fn put(&self, record: &ChunkRecord) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock().await;
        if self.is_satisfied(&record.key).await? {
            debug!("Chunk {} already satisfied, keeping existing record", record.key.file_stem());
            return Ok(PutOutcome::Refused);
        }
        let path = self.record_path(&record.key);
        write_atomic(&path, serde_json::to_string_pretty(record)?.as_bytes())?;
        Ok(PutOutcome::Written)
    }

    /// Write a planned record for `chunk` if no record exists for its key yet.
    pub async fn ensure_planned(&self, chunk: &PlannedChunk) -> Result<()> {
        if self.get(&chunk.key).await?.is_some() {
            return Ok(());
        }
        self.put(&ChunkRecord::planned(chunk)).await.map(|_| ())
    }

    pub async fn write_diagnostic(&self, key: &ChunkKey, body: &str) -> Result<PathBuf> {
        let path = self.diagnostic_path(key);
        write_atomic(&path, body.as_bytes())?;
        Ok(path)
    }

    /// Every readable record of one track, ordered by range then size.
    pub fn list(&self, episode_id: &str, track: TrackType) -> Result<Vec<ChunkRecord>> {
        let dir = self.chunk_dir(episode_id, track);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records: Vec<ChunkRecord> = WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str::<ChunkRecord>(&content).ok()
            })
            .collect();

        records.sort_by_key(|r| (r.key.start, r.key.end, r.key.chunk_size));
        Ok(records)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SubweaveError::Cache(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SubweaveError::Cache(format!("Failed to persist {}: {}", path.display(), e)))?;
    Ok(())
}
