use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;

use crate::subtitle::{Cue, CueId};
use crate::tracks::TrackType;

/// One cue as submitted for translation, with optional neighbouring context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: CueId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Rows for every cue that has text, in cue order. Context comes from the neighbouring rows.
pub fn source_rows(cues: &[Cue], with_context: bool) -> Vec<SourceRow> {
    let texts: Vec<(CueId, String)> = cues
        .iter()
        .filter(|c| c.has_text())
        .map(|c| (c.id, c.text.trim().to_string()))
        .collect();

    texts
        .iter()
        .enumerate()
        .map(|(i, (id, text))| SourceRow {
            id: *id,
            text: text.clone(),
            prev: with_context.then(|| i.checked_sub(1).map(|p| texts[p].1.clone())).flatten(),
            next: with_context.then(|| texts.get(i + 1).map(|n| n.1.clone())).flatten(),
        })
        .collect()
}

/// Identity of a chunk: track, episode, the size it was planned at, and the half-open row
/// range it covers. The fingerprint ties the key to the exact input text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub track: TrackType,
    pub episode_id: String,
    pub chunk_size: usize,
    pub start: usize,
    pub end: usize,
    pub fingerprint: String,
}

impl ChunkKey {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// File stem of the cache record; unique per (size, range).
    pub fn file_stem(&self) -> String {
        format!("c{:04}.{:06}-{:06}", self.chunk_size, self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub key: ChunkKey,
    pub rows: Vec<SourceRow>,
    /// Number of re-plans between the first pass and this chunk
    pub depth: u32,
}

impl PlannedChunk {
    pub fn ids(&self) -> Vec<CueId> {
        self.rows.iter().map(|r| r.id).collect()
    }
}

/// Size for re-planning a failed chunk of `len` rows, or `None` when it cannot shrink.
pub fn next_chunk_size(len: usize, min_size: usize) -> Option<usize> {
    let next = (len / 2).max(min_size).max(1);
    (next < len).then_some(next)
}

/// Deterministic partitioning of an ordered row sequence. Identical inputs always produce
/// identical boundaries, so cache keys stay stable across runs.
pub struct ChunkPlanner {
    track: TrackType,
    episode_id: String,
}

impl ChunkPlanner {
    pub fn new(track: TrackType, episode_id: &str) -> Self {
        Self {
            track,
            episode_id: episode_id.to_string(),
        }
    }

    /// First-pass plan over the whole sequence.
    pub fn plan(&self, rows: &[SourceRow], size: usize) -> Vec<PlannedChunk> {
        self.plan_range(rows, 0..rows.len(), size, 0)
    }

    /// Chunks of at most `size` rows over `range`; the last chunk takes the remainder.
    pub fn plan_range(&self, rows: &[SourceRow], range: Range<usize>, size: usize, depth: u32) -> Vec<PlannedChunk> {
        let size = size.max(1);
        let mut chunks = Vec::new();
        let mut start = range.start;
        while start < range.end {
            let end = (start + size).min(range.end);
            let part = &rows[start..end];
            chunks.push(PlannedChunk {
                key: ChunkKey {
                    track: self.track,
                    episode_id: self.episode_id.clone(),
                    chunk_size: size,
                    start,
                    end,
                    fingerprint: fingerprint(part),
                },
                rows: part.to_vec(),
                depth,
            });
            start = end;
        }
        chunks
    }

    /// Split a failed chunk into strictly smaller chunks over the same range.
    pub fn replan(&self, rows: &[SourceRow], failed: &PlannedChunk, min_size: usize) -> Option<Vec<PlannedChunk>> {
        let size = next_chunk_size(failed.key.len(), min_size)?;
        Some(self.plan_range(rows, failed.key.start..failed.key.end, size, failed.depth + 1))
    }
}

fn fingerprint(rows: &[SourceRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.id.0.to_le_bytes());
        hasher.update(row.text.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<SourceRow> {
        (0..n)
            .map(|i| SourceRow {
                id: CueId(i as u32),
                text: format!("línea {}", i),
                prev: None,
                next: None,
            })
            .collect()
    }

    #[test]
    fn test_plan_1203_rows_at_500() {
        let planner = ChunkPlanner::new(TrackType::Ru, "E1");
        let chunks = planner.plan(&rows(1203), 500);
        let lens: Vec<usize> = chunks.iter().map(|c| c.key.len()).collect();
        assert_eq!(lens, vec![500, 500, 203]);
        assert_eq!(chunks[1].key.start, 500);
        assert_eq!(chunks[1].key.end, 1000);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let planner = ChunkPlanner::new(TrackType::En, "E1");
        let data = rows(77);
        let a: Vec<ChunkKey> = planner.plan(&data, 10).into_iter().map(|c| c.key).collect();
        let b: Vec<ChunkKey> = planner.plan(&data, 10).into_iter().map(|c| c.key).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_follows_text() {
        let planner = ChunkPlanner::new(TrackType::En, "E1");
        let mut data = rows(4);
        let before = planner.plan(&data, 4)[0].key.clone();
        data[2].text = "otra cosa".into();
        let after = planner.plan(&data, 4)[0].key.clone();
        assert_eq!(before.file_stem(), after.file_stem());
        assert_ne!(before.fingerprint, after.fingerprint);
    }

    #[test]
    fn test_replan_covers_failed_range_with_smaller_chunks() {
        let planner = ChunkPlanner::new(TrackType::Ru, "E1");
        let data = rows(1203);
        let chunks = planner.plan(&data, 500);
        let children = planner.replan(&data, &chunks[1], 10).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.key.len() <= 250 && c.depth == 1));
        assert_eq!(children[0].key.start, 500);
        assert_eq!(children[1].key.end, 1000);
    }

    #[test]
    fn test_next_chunk_size_respects_minimum() {
        assert_eq!(next_chunk_size(500, 10), Some(250));
        assert_eq!(next_chunk_size(15, 10), Some(10));
        assert_eq!(next_chunk_size(10, 10), None);
        assert_eq!(next_chunk_size(1, 1), None);
        assert_eq!(next_chunk_size(3, 1), Some(1));
    }

    #[test]
    fn test_source_rows_skip_empty_and_link_context() {
        let cues = vec![
            Cue { id: CueId(0), start_ms: 0, end_ms: 1, text: "Uno".into() },
            Cue { id: CueId(1), start_ms: 1, end_ms: 2, text: "  ".into() },
            Cue { id: CueId(2), start_ms: 2, end_ms: 3, text: "Dos".into() },
        ];
        let rows = source_rows(&cues, true);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id, CueId(2));
        assert_eq!(rows[1].prev.as_deref(), Some("Uno"));
        assert_eq!(rows[0].next.as_deref(), Some("Dos"));
        assert!(source_rows(&cues, false)[0].next.is_none());
    }
}
