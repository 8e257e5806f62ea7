use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubweaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Subtitle parsing error: {0}")]
    Subtitle(String),

    #[error("Translation backend error: {0}")]
    Backend(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("ASR error: {0}")]
    Asr(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalidation of layer '{layer}' failed: {reason}")]
    Invalidation { layer: String, reason: String },

    #[error("Track '{track}' aborted for episode {episode}: {reason}")]
    TrackAborted {
        track: String,
        episode: String,
        reason: String,
    },

    #[error("Default subtitle '{0}' is not available in the produced tracks")]
    DefaultSubtitleUnavailable(String),

    #[error("Episode {0} failed: {1}")]
    EpisodeFailed(String, String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

pub type Result<T> = std::result::Result<T, SubweaveError>;
