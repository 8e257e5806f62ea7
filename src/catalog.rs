//! Episode manifest.
//!
//! The manifest is produced by the external catalog/episode resolver: it names each
//! episode and points at the downloaded video and the provided captions. The
//! `catalog` layer caches a normalized copy of it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, SubweaveError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub series: String,
    #[serde(default)]
    pub episodes: Vec<EpisodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSpec {
    /// Stable episode identifier, used as the artifact namespace
    pub id: String,
    /// Video produced by the downloader
    pub video: PathBuf,
    /// Base-language captions (SRT or WebVTT)
    pub captions: PathBuf,
    /// English captions provided by the source platform, if any
    #[serde(default)]
    pub english_captions: Option<PathBuf>,
}

/// Which episodes a run or an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    Episode(String),
    Group,
}

impl Manifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SubweaveError::Config(format!("Failed to read manifest {}: {}", path.display(), e)))?;
        let manifest: Manifest = toml::from_str(&content)
            .map_err(|e| SubweaveError::Config(format!("Failed to parse manifest: {}", e)))?;
        manifest.validate()?;
        debug!("Manifest for '{}' lists {} episodes", manifest.series, manifest.episodes.len());
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for episode in &self.episodes {
            if episode.id.is_empty()
                || episode.id.starts_with('_')
                || episode.id.contains(['/', '\\'])
                || episode.id.starts_with('.')
            {
                return Err(SubweaveError::Config(format!("Invalid episode id: {:?}", episode.id)));
            }
            if !seen.insert(episode.id.as_str()) {
                return Err(SubweaveError::Config(format!("Duplicate episode id: {}", episode.id)));
            }
        }
        Ok(())
    }

    /// Episodes selected by `scope`, in manifest order.
    pub fn select(&self, scope: &RunScope) -> Result<Vec<EpisodeSpec>> {
        match scope {
            RunScope::Group => Ok(self.episodes.clone()),
            RunScope::Episode(id) => self
                .episodes
                .iter()
                .find(|e| &e.id == id)
                .cloned()
                .map(|e| vec![e])
                .ok_or_else(|| SubweaveError::Config(format!("Episode {} not in manifest", id))),
        }
    }

    /// Write `catalog.json` into `dir` unless it already exists. Returns true when written.
    pub async fn materialize(&self, dir: &Path) -> Result<bool> {
        let path = dir.join("catalog.json");
        if path.exists() {
            return Ok(false);
        }
        tokio::fs::create_dir_all(dir).await?;
        let content = serde_json::to_string_pretty(self)?;
        let tmp = dir.join("catalog.json.partial");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!("Catalog written: {}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
series = "cuentame"

[[episodes]]
id = "S07E05"
video = "/media/s07e05.mp4"
captions = "/media/s07e05.es.vtt"

[[episodes]]
id = "S07E06"
video = "/media/s07e06.mp4"
captions = "/media/s07e06.es.srt"
english_captions = "/media/s07e06.en.srt"
"#;

    #[test]
    fn test_select_single_episode() {
        let manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        manifest.validate().unwrap();
        let picked = manifest.select(&RunScope::Episode("S07E06".into())).unwrap();
        assert_eq!(picked.len(), 1);
        assert!(picked[0].english_captions.is_some());
        assert_eq!(manifest.select(&RunScope::Group).unwrap().len(), 2);
        assert!(manifest.select(&RunScope::Episode("S01E01".into())).is_err());
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        manifest.episodes[1].id = "S07E05".into();
        assert!(manifest.validate().is_err());
    }

    #[tokio::test]
    async fn test_materialize_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        assert!(manifest.materialize(dir.path()).await.unwrap());
        assert!(!manifest.materialize(dir.path()).await.unwrap());
    }
}
