// Speech recognition backends
//
// Only whisper.cpp is wired up. The delay estimator is the single consumer and needs
// nothing beyond timed text segments.

pub mod whisper_cpp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::AsrConfig;
use crate::error::Result;

/// Timed text recognized in an audio clip, relative to the clip start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsrSegment {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AsrBackend: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, language: &str) -> Result<Vec<AsrSegment>>;
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    pub fn create_transcriber(config: &AsrConfig) -> Arc<dyn AsrBackend> {
        Arc::new(whisper_cpp::WhisperCppTranscriber::new(config.clone()))
    }
}
