//! Shared fixtures: scripted collaborators and on-disk episode inputs.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use subweave::error::{Result, SubweaveError};
use subweave::media::{MediaToolchain, MuxRequest};
use subweave::subtitle::CueId;
use subweave::tracks::TrackType;
use subweave::transcribe::{AsrBackend, AsrSegment};
use subweave::translate::{BatchRequest, TranslationBackend};

mockall::mock! {
    pub Media {}

    #[async_trait]
    impl MediaToolchain for Media {
        async fn probe_duration_ms(&self, media: &Path) -> Result<i64>;
        async fn audio_envelope(&self, media: &Path, bin_ms: u32) -> Result<Vec<u32>>;
        async fn extract_clip(&self, media: &Path, start_ms: i64, duration_ms: i64, output: &Path) -> Result<()>;
        async fn mux(&self, request: &MuxRequest) -> Result<()>;
        async fn check_availability(&self) -> Result<()>;
    }
}

mockall::mock! {
    pub Asr {}

    #[async_trait]
    impl AsrBackend for Asr {
        async fn transcribe(&self, audio_path: &Path, language: &str) -> Result<Vec<AsrSegment>>;
    }
}

/// Media mock whose mux writes the output file, as ffmpeg would.
pub fn muxing_media(times: usize) -> MockMedia {
    let mut media = MockMedia::new();
    media.expect_mux().times(times).returning(|request| {
        std::fs::write(&request.output, b"matroska")?;
        Ok(())
    });
    media
}

/// Answers `<track> <text>` for every row, except where told to misbehave.
#[derive(Default)]
pub struct ScriptedBackend {
    pub calls: AtomicUsize,
    /// Requests for these tracks fail outright
    pub failing_tracks: Vec<TrackType>,
    /// Rows with these ids are dropped while a request holds more than `poison_above` rows
    pub poison: Vec<CueId>,
    pub poison_above: usize,
    pub seen: Mutex<Vec<(TrackType, usize)>>,
}

impl ScriptedBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, track: TrackType) -> usize {
        self.seen.lock().unwrap().iter().filter(|(t, _)| *t == track).count()
    }
}

#[async_trait]
impl TranslationBackend for ScriptedBackend {
    async fn complete(&self, request: &BatchRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((request.track, request.rows.len()));
        if self.failing_tracks.contains(&request.track) {
            return Err(SubweaveError::Backend(format!("{} backend unavailable", request.track)));
        }

        let big = request.rows.len() > self.poison_above;
        Ok(request
            .rows
            .iter()
            .filter(|r| !(big && self.poison.contains(&r.id)))
            .map(|r| format!("{}\t{} {}\t{}", r.token, request.track.name().to_uppercase(), r.text, r.echo))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

pub const LINES: [&str; 6] = [
    "¿Dónde estabas anoche?",
    "En casa de mi madre.",
    "No me lo creo.",
    "Pues pregúntale a ella.",
    "Vale, no te enfades.",
    "Mañana hablamos.",
];

/// SRT with `count` two-second cues, one every three seconds.
pub fn srt(count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        let start = 1000 + i as i64 * 3000;
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            subweave::subtitle::format_srt_time(start),
            subweave::subtitle::format_srt_time(start + 2000),
            LINES[i % LINES.len()]
        ));
    }
    out
}

/// Video placeholder and base captions for one episode, under `dir/inputs`.
pub fn episode_inputs(dir: &Path, id: &str, cues: usize) -> (PathBuf, PathBuf) {
    let inputs = dir.join("inputs");
    std::fs::create_dir_all(&inputs).unwrap();
    let video = inputs.join(format!("{}.mp4", id));
    let captions = inputs.join(format!("{}.es.srt", id));
    std::fs::write(&video, b"not really a video").unwrap();
    std::fs::write(&captions, srt(cues)).unwrap();
    (video, captions)
}
