use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{Result, SubweaveError};
use crate::tracks::TrackType;

// Defaults for fields older config files may not carry
fn default_min_chunk_size() -> usize {
    10
}

fn default_use_context() -> bool {
    true
}

fn default_episode_workers() -> usize {
    2
}

fn default_es_mode() -> TrackMode {
    TrackMode::Off
}

fn default_subtitle() -> TrackType {
    TrackType::Es
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub translate: TranslateConfig,
    pub tracks: TracksConfig,
    pub delay: DelayConfig,
    pub asr: AsrConfig,
    pub media: MediaConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one namespace per episode plus the catalog
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateConfig {
    /// Which text-generation backend to drive
    pub backend: BackendKind,
    /// Ollama endpoint URL
    pub endpoint: String,
    /// Model name passed to the backend
    pub model: String,
    /// Program spawned by the command backend
    pub command: String,
    /// Extra arguments for the command backend
    pub args: Vec<String>,
    /// Cues per chunk on the first pass
    pub chunk_size: usize,
    /// Smallest chunk a failed range may be re-planned into
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    /// Maximum number of re-plan levels below the first pass
    pub max_retries: u32,
    /// Concurrent chunk executions per track
    pub workers: usize,
    /// Bounded wait per backend call (seconds)
    pub timeout_secs: u64,
    /// Send previous/next cue text as context columns
    #[serde(default = "default_use_context")]
    pub use_context: bool,
    /// Language of the base captions, used in prompts
    pub source_language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Ollama HTTP API
    Ollama,
    /// External CLI reading the prompt on stdin and answering on stdout
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMode {
    /// Track is not built
    Off,
    /// Track is built; failure is reported and the track is left out of the mux
    On,
    /// Track is built; failure fails the episode
    Require,
}

impl TrackMode {
    pub fn enabled(self) -> bool {
        self != TrackMode::Off
    }

    pub fn required(self) -> bool {
        self == TrackMode::Require
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracksConfig {
    /// Cleaned base-language track; costs one backend pass per episode
    #[serde(default = "default_es_mode")]
    pub es: TrackMode,
    pub en: TrackMode,
    pub ru: TrackMode,
    pub refs: TrackMode,
    pub dual: TrackMode,
    /// Track flagged as default in the mux; `es` falls back to the base captions
    #[serde(default = "default_subtitle")]
    pub default_subtitle: TrackType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Estimate and apply a caption delay when base captions are first built
    pub enabled: bool,
    /// Envelope bin width in milliseconds
    pub bin_ms: u32,
    /// Largest offset searched or accepted, in milliseconds
    pub max_offset_ms: i64,
    /// Correlation confidence below which the ASR fallback runs
    pub confidence_threshold: f64,
    /// Length of the midpoint clip transcribed by the fallback (seconds)
    pub clip_secs: u64,
    /// Minimum matched cues for the ASR estimate to be trusted
    pub min_asr_matches: usize,
    /// Minimum text similarity for a caption/ASR pair to count as a match
    pub min_similarity: f64,
    /// Offset used when no estimate can be produced
    pub default_offset_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Path to the whisper.cpp CLI
    pub binary_path: String,
    /// Path to the ggml model file
    pub model_path: String,
    /// Spoken language of the episodes
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary
    pub probe_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Episodes processed in parallel in a group run
    #[serde(default = "default_episode_workers")]
    pub episode_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                root: PathBuf::from(".subweave/data"),
            },
            translate: TranslateConfig {
                backend: BackendKind::Ollama,
                endpoint: "http://localhost:11434".to_string(),
                model: "llama3.2:3b".to_string(),
                command: "claude".to_string(),
                args: vec!["-p".to_string(), "--print".to_string()],
                chunk_size: 400,
                min_chunk_size: default_min_chunk_size(),
                max_retries: 4,
                workers: 4,
                timeout_secs: 600,
                use_context: true,
                source_language: "Spanish".to_string(),
            },
            tracks: TracksConfig {
                es: default_es_mode(),
                en: TrackMode::On,
                ru: TrackMode::Require,
                refs: TrackMode::On,
                dual: TrackMode::On,
                default_subtitle: default_subtitle(),
            },
            delay: DelayConfig {
                enabled: true,
                bin_ms: 100,
                max_offset_ms: 10_000,
                confidence_threshold: 0.6,
                clip_secs: 300,
                min_asr_matches: 5,
                min_similarity: 0.58,
                default_offset_ms: 0,
            },
            asr: AsrConfig {
                binary_path: "whisper-cli".to_string(),
                model_path: ".subweave/models/ggml-small.bin".to_string(),
                language: "es".to_string(),
            },
            media: MediaConfig {
                binary_path: "ffmpeg".to_string(),
                probe_path: "ffprobe".to_string(),
            },
            run: RunConfig {
                episode_workers: default_episode_workers(),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SubweaveError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| SubweaveError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SubweaveError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SubweaveError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.translate;
        if t.chunk_size == 0 || t.min_chunk_size == 0 {
            return Err(SubweaveError::Config("chunk sizes must be positive".to_string()));
        }
        if t.min_chunk_size > t.chunk_size {
            return Err(SubweaveError::Config(format!(
                "min_chunk_size ({}) exceeds chunk_size ({})",
                t.min_chunk_size, t.chunk_size
            )));
        }
        if t.workers == 0 || self.run.episode_workers == 0 {
            return Err(SubweaveError::Config("worker counts must be positive".to_string()));
        }
        if self.delay.bin_ms == 0 || self.delay.bin_ms > 1000 {
            return Err(SubweaveError::Config("delay.bin_ms must be within 1..=1000".to_string()));
        }
        let default = self.tracks.default_subtitle;
        if default != TrackType::Es && !default.mode(&self.effective_tracks()).enabled() {
            return Err(SubweaveError::Config(format!(
                "default subtitle '{}' is switched off",
                default
            )));
        }
        Ok(())
    }

    /// Track modes after applying the bilingual track's dependency on `ru`.
    pub fn effective_tracks(&self) -> TracksConfig {
        let mut tracks = self.tracks.clone();
        if tracks.dual.enabled() && !tracks.ru.enabled() {
            tracks.ru = if tracks.dual.required() { TrackMode::Require } else { TrackMode::On };
        }
        tracks
    }
}
