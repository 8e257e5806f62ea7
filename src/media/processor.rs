use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use super::{MediaCommandBuilder, MediaToolchain, MuxRequest};
use crate::config::MediaConfig;
use crate::error::{Result, SubweaveError};

/// ffmpeg/ffprobe implementation of the media toolchain
pub struct FfmpegToolchain {
    command_builder: MediaCommandBuilder,
}

impl FfmpegToolchain {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            command_builder: MediaCommandBuilder::new(&config.binary_path, &config.probe_path),
        }
    }
}

#[async_trait]
impl MediaToolchain for FfmpegToolchain {
    async fn probe_duration_ms(&self, media: &Path) -> Result<i64> {
        let stdout = self.command_builder.probe_duration(media).execute_capture().await?;
        let text = String::from_utf8_lossy(&stdout);
        let seconds: f64 = text
            .trim()
            .parse()
            .map_err(|_| SubweaveError::Media(format!("Unexpected duration {:?} for {}", text.trim(), media.display())))?;
        Ok((seconds * 1000.0).round() as i64)
    }

    async fn audio_envelope(&self, media: &Path, bin_ms: u32) -> Result<Vec<u32>> {
        debug!("Extracting audio envelope of {} at {}ms bins", media.display(), bin_ms);
        let raw = self.command_builder.audio_envelope(media, bin_ms).execute_capture().await?;
        Ok(raw
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).unsigned_abs() as u32)
            .collect())
    }

    async fn extract_clip(&self, media: &Path, start_ms: i64, duration_ms: i64, output: &Path) -> Result<()> {
        info!(
            "Extracting {}s clip at {}s from {}",
            duration_ms / 1000,
            start_ms / 1000,
            media.display()
        );
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.command_builder
            .extract_clip(media, start_ms, duration_ms, output)
            .execute()
            .await
    }

    async fn mux(&self, request: &MuxRequest) -> Result<()> {
        info!(
            "Muxing {} subtitle tracks into {}",
            request.tracks.len(),
            request.output.display()
        );
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write next to the target, then move into place
        let partial = request.output.with_extension("partial.mkv");
        self.command_builder
            .mux(
                request.video.as_path(),
                &request.tracks,
                request.subtitle_delay_ms,
                partial.as_path(),
            )
            .execute()
            .await?;
        tokio::fs::rename(&partial, &request.output).await?;
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        let stdout = self
            .command_builder
            .version_check()
            .execute_capture()
            .await
            .map_err(|e| SubweaveError::Media(format!("Media processor not found: {}", e)))?;
        let version = String::from_utf8_lossy(&stdout);
        info!("Media processor is available: {}", version.lines().next().unwrap_or("unknown version"));
        Ok(())
    }
}
