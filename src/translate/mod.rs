// Chunked translation pipeline
//
// - planner: deterministic partitioning of a track's rows into keyed chunks
// - cache: persistent per-chunk records and failure diagnostics
// - payload: request rows, prompt and strict response parsing
// - executor: one backend call per chunk, validated and committed
// - controller: waves of cache lookups, pooled execution and re-planning
// - backend: Ollama and external command backends

pub mod backend;
pub mod cache;
pub mod controller;
pub mod executor;
pub mod payload;
pub mod planner;

use async_trait::async_trait;
use std::sync::Arc;

pub use backend::{check_ollama_availability, CommandBackend, OllamaBackend};
pub use cache::{ChunkCache, ChunkRecord, Lookup, PutOutcome};
pub use controller::{AbortedChunk, ResumeController, RetryPolicy, TrackJob, TrackReport, TrackStatus};
pub use executor::{ChunkExecutor, ChunkOutcome};
pub use payload::PayloadRow;
pub use planner::{ChunkKey, ChunkPlanner, PlannedChunk, SourceRow};

use crate::config::{BackendKind, TranslateConfig};
use crate::error::Result;
use crate::tracks::TrackType;

/// One chunk as handed to a backend.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub track: TrackType,
    /// File stem of the chunk, for logging
    pub chunk: String,
    pub prompt: String,
    pub rows: Vec<PayloadRow>,
}

/// Text-generation backend: one prompt in, raw text out.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn complete(&self, request: &BatchRequest) -> Result<String>;
}

/// Factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    pub fn create_backend(config: &TranslateConfig) -> Result<Arc<dyn TranslationBackend>> {
        match config.backend {
            BackendKind::Ollama => Ok(Arc::new(OllamaBackend::new(config)?)),
            BackendKind::Command => Ok(Arc::new(CommandBackend::new(config))),
        }
    }
}
