use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{EpisodeSpec, Manifest, RunScope};
use crate::config::{BackendKind, Config, TracksConfig};
use crate::delay::{DelayEstimate, DelayEstimator};
use crate::error::{Result, SubweaveError};
use crate::layers::{join_layers, ArtifactStore, EpisodeLayout, Invalidation, Layer};
use crate::media::{MediaToolchain, MediaToolchainFactory, MuxRequest, MuxTrack};
use crate::subtitle::{self, Cue, CueId};
use crate::tracks::{self, TrackType};
use crate::transcribe::{AsrBackend, TranscriberFactory};
use crate::translate::planner::source_rows;
use crate::translate::{
    check_ollama_availability, BackendFactory, ChunkCache, ChunkExecutor, ResumeController, RetryPolicy,
    TrackJob, TranslationBackend,
};

/// Per-episode state of one run.
#[derive(Debug, Clone)]
pub struct EpisodeRunState {
    pub run_id: Uuid,
    pub episode_id: String,
    /// Whether `captions/base.srt` was already present when the run started
    pub base_existed: bool,
    /// Layers whose artifacts were (re)built during this run
    pub rebuilt: BTreeSet<Layer>,
}

impl EpisodeRunState {
    fn new(run_id: Uuid, episode_id: &str) -> Self {
        Self {
            run_id,
            episode_id: episode_id.to_string(),
            base_existed: false,
            rebuilt: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Off,
    /// Artifact from an earlier run was kept
    Reused,
    Built { external_calls: usize, cache_hits: usize },
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeReport {
    pub episode_id: String,
    pub run_id: Uuid,
    pub delay: Option<DelayEstimate>,
    pub tracks: BTreeMap<TrackType, TrackState>,
    pub rebuilt: BTreeSet<Layer>,
    pub muxed: bool,
    /// Set when a required track failed or the default subtitle is missing; no mux was built
    pub failure: Option<String>,
}

impl EpisodeReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn external_calls(&self) -> usize {
        self.tracks
            .values()
            .map(|s| match s {
                TrackState::Built { external_calls, .. } => *external_calls,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub invalidation: Invalidation,
    pub reports: Vec<EpisodeReport>,
    /// Episodes that could not be processed at all
    pub errors: Vec<(String, String)>,
}

impl RunSummary {
    /// One error per failed episode, whether it failed outright or on a required track.
    pub fn failures(&self) -> Vec<SubweaveError> {
        self.errors
            .iter()
            .map(|(id, e)| SubweaveError::EpisodeFailed(id.clone(), e.clone()))
            .chain(self.reports.iter().filter_map(|r| {
                r.failure
                    .as_ref()
                    .map(|f| SubweaveError::EpisodeFailed(r.episode_id.clone(), f.clone()))
            }))
            .collect()
    }

    pub fn failed_episodes(&self) -> usize {
        self.failures().len()
    }
}

/// Chunk-record counts of one track, for `status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkCounts {
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeStatus {
    pub episode_id: String,
    pub layers: BTreeMap<Layer, bool>,
    pub chunks: BTreeMap<TrackType, ChunkCounts>,
}

pub struct Workflow {
    config: Config,
    tracks: TracksConfig,
    store: ArtifactStore,
    cache: Arc<ChunkCache>,
    controller: ResumeController,
    media: Arc<dyn MediaToolchain>,
    delay: DelayEstimator,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        let backend = BackendFactory::create_backend(&config.translate)?;
        let media = MediaToolchainFactory::create_toolchain(&config.media);
        let asr = TranscriberFactory::create_transcriber(&config.asr);
        Ok(Self::with_collaborators(config, backend, media, asr))
    }

    pub fn with_collaborators(
        config: Config,
        backend: Arc<dyn TranslationBackend>,
        media: Arc<dyn MediaToolchain>,
        asr: Arc<dyn AsrBackend>,
    ) -> Self {
        let store = ArtifactStore::new(&config.storage.root);
        let cache = Arc::new(ChunkCache::new(store.clone()));
        let executor = Arc::new(ChunkExecutor::new(
            backend,
            cache.clone(),
            Duration::from_secs(config.translate.timeout_secs),
            &config.translate.source_language,
        ));
        let controller = ResumeController::new(executor, cache.clone(), RetryPolicy::from_config(&config.translate));
        let delay = DelayEstimator::new(media.clone(), asr, config.delay.clone(), &config.asr.language);

        Self {
            tracks: config.effective_tracks(),
            config,
            store,
            cache,
            controller,
            media,
            delay,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Check external tools before a run
    pub async fn check_collaborators(&self) -> Result<()> {
        self.media.check_availability().await?;
        if self.config.translate.backend == BackendKind::Ollama {
            check_ollama_availability(&self.config.translate.endpoint, &self.config.translate.model).await?;
        }
        Ok(())
    }

    /// Sweep stale tombstones and invalidate `layers` (plus everything downstream) for the
    /// selected episodes. Runs once, before any episode worker starts.
    pub async fn preflight(&self, manifest: &Manifest, scope: &RunScope, layers: &[Layer]) -> Result<Invalidation> {
        let ids: Vec<String> = manifest.select(scope)?.into_iter().map(|e| e.id).collect();
        self.store.sweep_tombstones(&ids).await?;
        self.store.invalidate(layers, &ids).await
    }

    /// Process every selected episode on the episode worker pool. One failing episode does
    /// not stop the others.
    pub async fn run(&self, manifest: &Manifest, scope: &RunScope, invalidate: &[Layer]) -> Result<RunSummary> {
        let episodes = manifest.select(scope)?;
        let invalidation = self.preflight(manifest, scope, invalidate).await?;
        if let Some((layer, reason)) = invalidation.first_failure() {
            return Err(SubweaveError::Invalidation { layer: layer.to_string(), reason });
        }
        if !invalidation.closure.is_empty() {
            info!("Invalidated layers: {}", join_layers(&invalidation.closure));
        }

        if manifest.materialize(&self.store.catalog_dir()).await? {
            info!("Catalog for '{}' materialized", manifest.series);
        }

        let run_id = Uuid::new_v4();
        info!("Run {} over {} episodes", run_id, episodes.len());

        let progress = ProgressBar::new(episodes.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} episodes {msg}")
                .map_err(|e| SubweaveError::Config(format!("Invalid progress template: {}", e)))?
                .progress_chars("#>-"),
        );

        let invalidation_ref = &invalidation;
        let progress_ref = &progress;
        let results: Vec<(String, Result<EpisodeReport>)> = stream::iter(episodes)
            .map(move |episode| async move {
                let result = self.run_episode_with_id(run_id, &episode, invalidation_ref).await;
                progress_ref.inc(1);
                progress_ref.set_message(episode.id.clone());
                (episode.id, result)
            })
            .buffer_unordered(self.config.run.episode_workers.max(1))
            .collect()
            .await;
        progress.finish_and_clear();

        let mut summary = RunSummary {
            run_id,
            invalidation,
            reports: Vec::new(),
            errors: Vec::new(),
        };
        for (episode_id, result) in results {
            match result {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    error!("Episode {} failed: {}", episode_id, e);
                    summary.errors.push((episode_id, e.to_string()));
                }
            }
        }
        summary.reports.sort_by(|a, b| a.episode_id.cmp(&b.episode_id));
        Ok(summary)
    }

    /// Process one episode. `invalidation` must come from the preflight of this run.
    pub async fn run_episode(&self, episode: &EpisodeSpec, invalidation: &Invalidation) -> Result<EpisodeReport> {
        self.run_episode_with_id(Uuid::new_v4(), episode, invalidation).await
    }

    async fn run_episode_with_id(
        &self,
        run_id: Uuid,
        episode: &EpisodeSpec,
        invalidation: &Invalidation,
    ) -> Result<EpisodeReport> {
        if let Some((layer, reason)) = invalidation.first_failure() {
            return Err(SubweaveError::Invalidation { layer: layer.to_string(), reason });
        }
        let span = info_span!("episode", id = %episode.id);
        self.process_episode(run_id, episode).instrument(span).await
    }

    async fn process_episode(&self, run_id: Uuid, episode: &EpisodeSpec) -> Result<EpisodeReport> {
        let layout = self.store.episode(&episode.id);
        layout.ensure_dirs().await?;
        let mut state = EpisodeRunState::new(run_id, &episode.id);

        let video = self.import_video(episode, &layout, &mut state).await?;
        let (base, delay) = self.prepare_captions(episode, &layout, &video, &mut state).await?;

        let mut report = EpisodeReport {
            episode_id: episode.id.clone(),
            run_id,
            delay,
            tracks: BTreeMap::new(),
            rebuilt: BTreeSet::new(),
            muxed: false,
            failure: None,
        };

        let mut ru_outputs: Option<BTreeMap<CueId, String>> = None;
        for track in TrackType::ALL {
            let track_state = self
                .build_track(track, episode, &layout, &base, &mut ru_outputs, &mut state)
                .await?;
            if let TrackState::Failed(reason) = &track_state {
                if track.mode(&self.tracks).required() {
                    error!("Required track {} failed: {}", track, reason);
                    report.failure.get_or_insert_with(|| format!("required track {} failed: {}", track, reason));
                } else {
                    warn!("Track {} failed and will be left out of the mux: {}", track, reason);
                }
            }
            report.tracks.insert(track, track_state);
        }

        if report.failure.is_none() {
            match self.mux_if_needed(episode, &layout, &video, &report.tracks, &mut state).await {
                Ok(muxed) => report.muxed = muxed,
                Err(e @ SubweaveError::DefaultSubtitleUnavailable(_)) => {
                    error!("Mux skipped for {}: {}", episode.id, e);
                    report.failure = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        } else {
            warn!("Mux skipped for {}", episode.id);
        }

        report.rebuilt = state.rebuilt;
        info!(
            "Episode {} finished: rebuilt [{}], {} backend calls{}",
            episode.id,
            join_layers(&report.rebuilt),
            report.external_calls(),
            report.failure.as_deref().map(|f| format!(", failed: {}", f)).unwrap_or_default()
        );
        Ok(report)
    }

    async fn import_video(&self, episode: &EpisodeSpec, layout: &EpisodeLayout, state: &mut EpisodeRunState) -> Result<PathBuf> {
        if let Some(existing) = layout.existing_video() {
            return Ok(existing);
        }
        if !episode.video.exists() {
            return Err(SubweaveError::FileNotFound(episode.video.display().to_string()));
        }

        let extension = episode
            .video
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        let target = layout.video_file(&extension);
        let partial = target.with_extension(format!("{}.partial", extension));
        if fs::hard_link(&episode.video, &partial).await.is_err() {
            fs::copy(&episode.video, &partial).await?;
        }
        fs::rename(&partial, &target).await?;
        info!("Imported video {}", target.display());
        state.rebuilt.insert(Layer::Video);
        Ok(target)
    }

    /// Base cues for the episode. Built at most once: the delay estimate only runs when
    /// `base.srt` did not exist at the start of the run.
    async fn prepare_captions(
        &self,
        episode: &EpisodeSpec,
        layout: &EpisodeLayout,
        video: &Path,
        state: &mut EpisodeRunState,
    ) -> Result<(Vec<Cue>, Option<DelayEstimate>)> {
        let base_path = layout.base_captions();
        state.base_existed = tracks::is_nonempty_file(&base_path);
        if state.base_existed {
            let cues = subtitle::load_captions(&base_path).await?;
            return Ok((cues, read_delay(&layout.delay_file()).await));
        }

        let raw = subtitle::load_captions(&episode.captions).await?;
        let cues = renumber(raw.into_iter().filter(|c| c.has_text()).collect());
        if cues.is_empty() {
            return Err(SubweaveError::Subtitle(format!("No cues in {}", episode.captions.display())));
        }

        let delay = if self.config.delay.enabled {
            let estimate = self
                .delay
                .estimate(&episode.id, video, &cues, &layout.scratch_dir())
                .await?;
            let tmp = layout.delay_file().with_extension("json.partial");
            fs::write(&tmp, serde_json::to_string_pretty(&estimate)?).await?;
            fs::rename(&tmp, layout.delay_file()).await?;
            Some(estimate)
        } else {
            None
        };

        let offset = delay.as_ref().map(|d| d.offset_ms).unwrap_or(0);
        let shifted = subtitle::shift_cues(&cues, offset);
        subtitle::write_srt(&shifted, &base_path).await?;
        state.rebuilt.insert(Layer::Captions);
        Ok((shifted, delay))
    }

    async fn build_track(
        &self,
        track: TrackType,
        episode: &EpisodeSpec,
        layout: &EpisodeLayout,
        base: &[Cue],
        ru_outputs: &mut Option<BTreeMap<CueId, String>>,
        state: &mut EpisodeRunState,
    ) -> Result<TrackState> {
        if !track.mode(&self.tracks).enabled() {
            return Ok(TrackState::Off);
        }
        if tracks::is_nonempty_file(&layout.track_file(track.layer())) {
            if track == TrackType::Ru {
                *ru_outputs = tracks::load_outputs(layout, track).await?;
            }
            return Ok(TrackState::Reused);
        }

        let track_state = match track {
            TrackType::En if episode.english_captions.is_some() => {
                self.import_english(episode, layout).await?;
                TrackState::Built { external_calls: 0, cache_hits: 0 }
            }
            TrackType::Dual => {
                let outputs = match ru_outputs.clone() {
                    Some(outputs) => Some(outputs),
                    None => tracks::load_outputs(layout, TrackType::Ru).await?,
                };
                match outputs {
                    Some(outputs) => {
                        let cues = tracks::assemble(track, base, &outputs);
                        tracks::write_track(layout, track, &cues, &outputs).await?;
                        TrackState::Built { external_calls: 0, cache_hits: 0 }
                    }
                    None => TrackState::Failed("ru track unavailable".to_string()),
                }
            }
            _ => {
                let job = TrackJob {
                    track,
                    episode_id: episode.id.clone(),
                    rows: source_rows(base, self.config.translate.use_context),
                };
                let run = self.controller.run(&job).await?;
                if run.is_done() {
                    let cues = tracks::assemble(track, base, &run.outputs);
                    tracks::write_track(layout, track, &cues, &run.outputs).await?;
                    if track == TrackType::Ru {
                        *ru_outputs = Some(run.outputs.clone());
                    }
                    TrackState::Built {
                        external_calls: run.external_calls,
                        cache_hits: run.cache_hits,
                    }
                } else {
                    TrackState::Failed(run.abort_error().to_string())
                }
            }
        };

        if matches!(track_state, TrackState::Built { .. }) {
            state.rebuilt.insert(track.layer());
        }
        Ok(track_state)
    }

    async fn import_english(&self, episode: &EpisodeSpec, layout: &EpisodeLayout) -> Result<()> {
        let Some(path) = &episode.english_captions else {
            return Ok(());
        };
        let offset = read_delay(&layout.delay_file()).await.map(|d| d.offset_ms).unwrap_or(0);
        let cues = subtitle::load_captions(path).await?;
        let cues = subtitle::shift_cues(&renumber(cues.into_iter().filter(|c| c.has_text()).collect()), offset);
        info!("Using provided English captions ({} cues)", cues.len());
        tracks::write_track(layout, TrackType::En, &cues, &BTreeMap::new()).await
    }

    /// Mux streams in order: base captions first, then every produced track. Exactly one
    /// stream carries the default disposition.
    fn mux_tracks(&self, layout: &EpisodeLayout, track_states: &BTreeMap<TrackType, TrackState>) -> Result<Vec<MuxTrack>> {
        let source_tag = language_tag(&self.config.asr.language);
        let mut produced: Vec<Option<TrackType>> = vec![None];
        let mut mux_tracks = vec![MuxTrack {
            path: layout.base_captions(),
            language: source_tag.clone(),
            title: self.config.translate.source_language.clone(),
            default: false,
        }];
        for (track, track_state) in track_states {
            if matches!(track_state, TrackState::Reused | TrackState::Built { .. }) {
                let (language, title) = track.mux_metadata(&source_tag);
                produced.push(Some(*track));
                mux_tracks.push(MuxTrack {
                    path: layout.track_file(track.layer()),
                    language,
                    title,
                    default: false,
                });
            }
        }

        let default = tracks::resolve_default(self.tracks.default_subtitle, &produced)?;
        mux_tracks[default].default = true;
        Ok(mux_tracks)
    }

    async fn mux_if_needed(
        &self,
        episode: &EpisodeSpec,
        layout: &EpisodeLayout,
        video: &Path,
        track_states: &BTreeMap<TrackType, TrackState>,
        state: &mut EpisodeRunState,
    ) -> Result<bool> {
        // an unavailable default fails the episode even when the mux is up to date
        let mux_tracks = self.mux_tracks(layout, track_states)?;

        let inputs_rebuilt = state.rebuilt.iter().any(|l| *l != Layer::Catalog && *l != Layer::Mux);
        if layout.mux_file().exists() && !inputs_rebuilt {
            info!("Mux for {} is up to date", episode.id);
            return Ok(false);
        }

        self.media
            .mux(&MuxRequest {
                video: video.to_path_buf(),
                tracks: mux_tracks,
                subtitle_delay_ms: 0,
                output: layout.mux_file(),
            })
            .await?;
        state.rebuilt.insert(Layer::Mux);
        Ok(true)
    }

    /// Which layers exist per episode, and chunk-record counts per track.
    pub fn status(&self, manifest: &Manifest, scope: &RunScope) -> Result<Vec<EpisodeStatus>> {
        let mut out = Vec::new();
        for episode in manifest.select(scope)? {
            let layout = self.store.episode(&episode.id);
            let mut layers = BTreeMap::new();
            for layer in Layer::ALL {
                let present = match layer {
                    Layer::Catalog => self.store.catalog_dir().join("catalog.json").exists(),
                    Layer::Video => layout.existing_video().is_some(),
                    Layer::Captions => tracks::is_nonempty_file(&layout.base_captions()),
                    Layer::Mux => layout.mux_file().exists(),
                    other => tracks::is_nonempty_file(&layout.track_file(other)),
                };
                layers.insert(layer, present);
            }

            let mut chunks = BTreeMap::new();
            for track in TrackType::ALL.into_iter().filter(|t| t.uses_backend()) {
                let records = self.cache.list(&episode.id, track)?;
                chunks.insert(
                    track,
                    ChunkCounts {
                        total: records.len(),
                        complete: records.iter().filter(|r| r.is_complete()).count(),
                        failed: records.iter().filter(|r| r.attempted && !r.is_complete()).count(),
                    },
                );
            }
            out.push(EpisodeStatus { episode_id: episode.id, layers, chunks });
        }
        Ok(out)
    }
}

fn renumber(cues: Vec<Cue>) -> Vec<Cue> {
    cues.into_iter()
        .enumerate()
        .map(|(i, cue)| Cue { id: CueId(i as u32), ..cue })
        .collect()
}

async fn read_delay(path: &Path) -> Option<DelayEstimate> {
    let content = fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&content).ok()
}

/// ISO 639-2 tag for the languages the pipeline deals with.
fn language_tag(code: &str) -> String {
    match code.to_lowercase().as_str() {
        "es" => "spa".to_string(),
        "en" => "eng".to_string(),
        "ru" => "rus".to_string(),
        "ca" => "cat".to_string(),
        "gl" => "glg".to_string(),
        "eu" => "eus".to_string(),
        other => other.to_string(),
    }
}
