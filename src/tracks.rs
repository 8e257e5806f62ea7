//! Derived subtitle tracks: what each one is, whether a run builds it, and how its
//! cue sequence is assembled from the base captions and backend output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;

use crate::config::{TrackMode, TracksConfig};
use crate::error::{Result, SubweaveError};
use crate::layers::{EpisodeLayout, Layer};
use crate::subtitle::{self, Cue, CueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    /// Base text after a light editorial cleanup
    Es,
    /// English, from provided captions or machine translation
    En,
    /// Full Russian translation
    Ru,
    /// Base text with vocabulary glosses
    Refs,
    /// Base text with the Russian translation underneath
    Dual,
}

impl TrackType {
    pub const ALL: [TrackType; 5] = [TrackType::Es, TrackType::En, TrackType::Ru, TrackType::Refs, TrackType::Dual];

    pub fn name(self) -> &'static str {
        match self {
            TrackType::Es => "es",
            TrackType::En => "en",
            TrackType::Ru => "ru",
            TrackType::Refs => "refs",
            TrackType::Dual => "dual",
        }
    }

    pub fn layer(self) -> Layer {
        match self {
            TrackType::Es => Layer::SubsEs,
            TrackType::En => Layer::SubsEn,
            TrackType::Ru => Layer::SubsRu,
            TrackType::Refs => Layer::SubsRefs,
            TrackType::Dual => Layer::SubsDual,
        }
    }

    pub fn mode(self, tracks: &TracksConfig) -> TrackMode {
        match self {
            TrackType::Es => tracks.es,
            TrackType::En => tracks.en,
            TrackType::Ru => tracks.ru,
            TrackType::Refs => tracks.refs,
            TrackType::Dual => tracks.dual,
        }
    }

    /// Whether building the track sends chunks to the text-generation backend.
    pub fn uses_backend(self) -> bool {
        self != TrackType::Dual
    }

    /// Target named in the prompt.
    pub fn target_language(self) -> &'static str {
        match self {
            TrackType::Es => "Spanish",
            TrackType::En => "English",
            TrackType::Ru | TrackType::Dual => "Russian",
            TrackType::Refs => "Russian (glosses)",
        }
    }

    /// ISO 639-2 tag and display title used when muxing.
    pub fn mux_metadata(self, source_tag: &str) -> (String, String) {
        match self {
            TrackType::Es => (source_tag.to_string(), "Base (clean)".to_string()),
            TrackType::En => ("eng".to_string(), "English".to_string()),
            TrackType::Ru => ("rus".to_string(), "Russian MT".to_string()),
            TrackType::Refs => (source_tag.to_string(), "Base + RU refs".to_string()),
            TrackType::Dual => ("rus".to_string(), "Base + RU".to_string()),
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackType {
    type Err = SubweaveError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        let wanted = if wanted == "ru-dual" { "dual" } else { wanted.as_str() };
        TrackType::ALL
            .iter()
            .copied()
            .find(|track| track.name() == wanted)
            .ok_or_else(|| SubweaveError::Config(format!("unknown subtitle track '{}'", s)))
    }
}

/// Position of the stream that gets the default disposition in a mux.
///
/// `produced` lists the mux streams in order; `None` stands for the base captions. An `es`
/// default prefers the cleaned track and falls back to the base captions. Any other default
/// must have been produced.
pub fn resolve_default(requested: TrackType, produced: &[Option<TrackType>]) -> Result<usize> {
    let wanted = produced.iter().position(|t| *t == Some(requested));
    let fallback = || {
        (requested == TrackType::Es)
            .then(|| produced.iter().position(Option::is_none))
            .flatten()
    };
    wanted
        .or_else(fallback)
        .ok_or_else(|| SubweaveError::DefaultSubtitleUnavailable(requested.to_string()))
}

/// Cues whose text is replaced by the per-id output; cues without output are dropped.
pub fn build_translated(base: &[Cue], outputs: &BTreeMap<CueId, String>) -> Vec<Cue> {
    base.iter()
        .filter_map(|cue| {
            outputs.get(&cue.id).map(|text| Cue {
                id: cue.id,
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                text: text.trim().to_string(),
            })
        })
        .collect()
}

/// Base text, followed by the companion text when there is one.
pub fn build_stacked(base: &[Cue], companion: &BTreeMap<CueId, String>) -> Vec<Cue> {
    base.iter()
        .filter(|cue| cue.has_text())
        .map(|cue| {
            let extra = companion
                .get(&cue.id)
                .map(|t| t.trim())
                .filter(|t| !t.is_empty() && *t != "-");
            let text = match extra {
                Some(extra) => format!("{}\n{}", cue.text.trim(), extra),
                None => cue.text.trim().to_string(),
            };
            Cue {
                id: cue.id,
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
                text,
            }
        })
        .collect()
}

/// Assemble the final cue sequence for `track`.
pub fn assemble(track: TrackType, base: &[Cue], outputs: &BTreeMap<CueId, String>) -> Vec<Cue> {
    match track {
        TrackType::Es | TrackType::En | TrackType::Ru => build_translated(base, outputs),
        TrackType::Refs | TrackType::Dual => build_stacked(base, outputs),
    }
}

/// Write `track.srt` plus the per-id outputs other tracks may be derived from.
pub async fn write_track(
    layout: &EpisodeLayout,
    track: TrackType,
    cues: &[Cue],
    outputs: &BTreeMap<CueId, String>,
) -> Result<()> {
    let dir = layout.layer_dir(track.layer());
    fs::create_dir_all(&dir).await?;

    let outputs_path = dir.join("outputs.json");
    let tmp = dir.join("outputs.json.partial");
    fs::write(&tmp, serde_json::to_string(outputs)?).await?;
    fs::rename(&tmp, &outputs_path).await?;

    // track.srt goes last: its presence marks the track as built
    subtitle::write_srt(cues, layout.track_file(track.layer())).await
}

/// Per-id outputs of a previously built track.
pub async fn load_outputs(layout: &EpisodeLayout, track: TrackType) -> Result<Option<BTreeMap<CueId, String>>> {
    let path = layout.layer_dir(track.layer()).join("outputs.json");
    if !is_nonempty_file(&layout.track_file(track.layer())) || !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).await?;
    Ok(serde_json::from_str(&content).ok())
}

pub fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<Cue> {
        vec![
            Cue { id: CueId(0), start_ms: 0, end_ms: 900, text: "Hola".into() },
            Cue { id: CueId(1), start_ms: 1000, end_ms: 1500, text: "".into() },
            Cue { id: CueId(2), start_ms: 2000, end_ms: 2900, text: "Vale".into() },
        ]
    }

    #[test]
    fn test_translated_track_keeps_ids_and_timing() {
        let outputs = BTreeMap::from([(CueId(0), "Привет".to_string()), (CueId(2), "Ладно".to_string())]);
        let cues = assemble(TrackType::Ru, &base(), &outputs);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[1].id, CueId(2));
        assert_eq!(cues[1].start_ms, 2000);
        assert_eq!(cues[1].text, "Ладно");
    }

    #[test]
    fn test_stacked_track_skips_placeholder_glosses() {
        let outputs = BTreeMap::from([(CueId(0), "hola — привет".to_string()), (CueId(2), "-".to_string())]);
        let cues = assemble(TrackType::Refs, &base(), &outputs);
        assert_eq!(cues[0].text, "Hola\nhola — привет");
        assert_eq!(cues[1].text, "Vale");
    }

    #[test]
    fn test_track_layers_are_distinct() {
        let layers: std::collections::HashSet<_> = TrackType::ALL.iter().map(|t| t.layer()).collect();
        assert_eq!(layers.len(), TrackType::ALL.len());
        assert!(!TrackType::Dual.uses_backend());
    }

    #[test]
    fn test_track_names_parse() {
        assert_eq!("ru-dual".parse::<TrackType>().unwrap(), TrackType::Dual);
        assert_eq!(" ES ".parse::<TrackType>().unwrap(), TrackType::Es);
        assert!("fr".parse::<TrackType>().is_err());
    }

    #[test]
    fn test_default_resolves_to_produced_track() {
        let produced = [None, Some(TrackType::Ru), Some(TrackType::Refs)];
        assert_eq!(resolve_default(TrackType::Refs, &produced).unwrap(), 2);
        assert_eq!(resolve_default(TrackType::Es, &produced).unwrap(), 0);

        let with_clean = [None, Some(TrackType::Es), Some(TrackType::Ru)];
        assert_eq!(resolve_default(TrackType::Es, &with_clean).unwrap(), 1);
    }

    #[test]
    fn test_missing_default_fails_hard() {
        let produced = [None, Some(TrackType::Dual)];
        assert!(matches!(
            resolve_default(TrackType::Refs, &produced),
            Err(SubweaveError::DefaultSubtitleUnavailable(t)) if t == "refs"
        ));
        assert!(resolve_default(TrackType::Es, &[Some(TrackType::Ru)]).is_err());
    }

    #[tokio::test]
    async fn test_outputs_round_trip_through_layer_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = crate::layers::ArtifactStore::new(dir.path()).episode("E1");
        let outputs = BTreeMap::from([(CueId(0), "Привет".to_string())]);
        let cues = build_translated(&base(), &outputs);
        write_track(&layout, TrackType::Ru, &cues, &outputs).await.unwrap();
        let loaded = load_outputs(&layout, TrackType::Ru).await.unwrap().unwrap();
        assert_eq!(loaded, outputs);
        assert!(load_outputs(&layout, TrackType::En).await.unwrap().is_none());
    }
}
