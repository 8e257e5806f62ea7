// Media toolchain
//
// - commands: ffmpeg/ffprobe command builders
// - processor: the ffmpeg-backed toolchain

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub video: PathBuf,
    pub tracks: Vec<MuxTrack>,
    /// Global subtitle delay; cue timing is already corrected, so callers pass 0
    pub subtitle_delay_ms: i64,
    pub output: PathBuf,
}

/// Audio extraction, probing and muxing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaToolchain: Send + Sync {
    async fn probe_duration_ms(&self, media: &Path) -> Result<i64>;

    /// Absolute amplitude of the mono track, one value per `bin_ms`
    async fn audio_envelope(&self, media: &Path, bin_ms: u32) -> Result<Vec<u32>>;

    async fn extract_clip(&self, media: &Path, start_ms: i64, duration_ms: i64, output: &Path) -> Result<()>;

    async fn mux(&self, request: &MuxRequest) -> Result<()>;

    async fn check_availability(&self) -> Result<()>;
}

/// Factory for creating media toolchain instances
pub struct MediaToolchainFactory;

impl MediaToolchainFactory {
    pub fn create_toolchain(config: &MediaConfig) -> Arc<dyn MediaToolchain> {
        Arc::new(processor::FfmpegToolchain::new(config))
    }
}
