use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use super::{AsrBackend, AsrSegment};
use crate::config::AsrConfig;
use crate::error::{Result, SubweaveError};

// Structs for parsing whisper.cpp JSON output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperCppOutput {
    pub transcription: Vec<WhisperCppSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperCppSegment {
    pub offsets: WhisperCppOffsets,
    pub text: String,
}

/// Segment bounds in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperCppOffsets {
    pub from: i64,
    pub to: i64,
}

impl From<WhisperCppOutput> for Vec<AsrSegment> {
    fn from(output: WhisperCppOutput) -> Self {
        output
            .transcription
            .into_iter()
            .map(|seg| AsrSegment {
                start_ms: seg.offsets.from,
                end_ms: seg.offsets.to,
                text: seg.text.trim().to_string(),
            })
            .filter(|seg| !seg.text.is_empty())
            .collect()
    }
}

/// whisper.cpp CLI (`whisper-cli`)
pub struct WhisperCppTranscriber {
    config: AsrConfig,
}

impl WhisperCppTranscriber {
    pub fn new(config: AsrConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AsrBackend for WhisperCppTranscriber {
    async fn transcribe(&self, audio_path: &Path, language: &str) -> Result<Vec<AsrSegment>> {
        let temp_dir = tempfile::tempdir()
            .map_err(|e| SubweaveError::Asr(format!("Failed to create temp dir: {}", e)))?;
        let output_base = temp_dir.path().join("transcript");
        let output_path = temp_dir.path().join("transcript.json");

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.arg("-oj")
            .arg("-of")
            .arg(&output_base)
            .arg("-m")
            .arg(&self.config.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-l")
            .arg(language)
            .kill_on_drop(true);

        debug!("Executing whisper command: {:?}", cmd);
        let output = cmd
            .output()
            .await
            .map_err(|e| SubweaveError::Asr(format!("Failed to execute whisper: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubweaveError::Asr(format!("Whisper failed: {}", stderr.trim())));
        }

        let json_content = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|e| SubweaveError::Asr(format!("Failed to read transcription: {}", e)))?;
        parse_output(&json_content)
    }
}

pub fn parse_output(json_content: &str) -> Result<Vec<AsrSegment>> {
    let whisper_output: WhisperCppOutput = serde_json::from_str(json_content)
        .map_err(|e| SubweaveError::Asr(format!("Failed to parse transcription JSON: {}", e)))?;
    Ok(whisper_output.into())
}
