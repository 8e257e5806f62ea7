//! Episode runs end to end: scripted backend, mocked media toolchain, real artifact store.

mod common;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use common::{episode_inputs, muxing_media, MockAsr, MockMedia, ScriptedBackend};
use subweave::catalog::{EpisodeSpec, Manifest, RunScope};
use subweave::config::{Config, TrackMode};
use subweave::delay::DelayMethod;
use subweave::error::SubweaveError;
use subweave::layers::Layer;
use subweave::tracks::TrackType;
use subweave::workflow::{TrackState, Workflow};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = dir.join("data");
    config.translate.chunk_size = 5;
    config.translate.min_chunk_size = 1;
    config.translate.max_retries = 2;
    config.translate.workers = 2;
    config.translate.timeout_secs = 5;
    config.delay.enabled = false;
    config
}

fn manifest(dir: &Path, ids: &[&str], cues: usize) -> Manifest {
    let episodes = ids
        .iter()
        .map(|id| {
            let (video, captions) = episode_inputs(dir, id, cues);
            EpisodeSpec { id: id.to_string(), video, captions, english_captions: None }
        })
        .collect();
    Manifest { series: "cuentame".into(), episodes }
}

fn workflow(config: Config, backend: Arc<ScriptedBackend>, media: MockMedia) -> Workflow {
    Workflow::with_collaborators(config, backend, Arc::new(media), Arc::new(MockAsr::new()))
}

#[tokio::test]
async fn test_first_run_builds_everything_and_rerun_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E05"], 12);
    let backend = Arc::new(ScriptedBackend::default());
    let mut config = config(dir.path());
    config.tracks.es = TrackMode::On;
    let wf = workflow(config, backend.clone(), muxing_media(1));
    let scope = RunScope::Episode("S07E05".into());

    let first = wf.run(&manifest, &scope, &[]).await.unwrap();
    assert_eq!(first.failed_episodes(), 0);
    let report = &first.reports[0];
    assert!(report.muxed);
    let everything: BTreeSet<Layer> = Layer::ALL.into_iter().filter(|l| *l != Layer::Catalog).collect();
    assert_eq!(report.rebuilt, everything);
    // three chunks of 5, 5 and 2 cues for each of the four backend tracks
    assert_eq!(backend.calls(), 12);
    assert_eq!(report.external_calls(), 12);

    let layout = wf.store().episode("S07E05");
    assert!(layout.mux_file().exists());
    let dual = std::fs::read_to_string(layout.track_file(Layer::SubsDual)).unwrap();
    assert!(dual.contains("¿Dónde estabas anoche?\nRU ¿Dónde estabas anoche?"));
    let clean = std::fs::read_to_string(layout.track_file(Layer::SubsEs)).unwrap();
    assert!(clean.contains("ES Mañana hablamos."));

    let second = wf.run(&manifest, &scope, &[]).await.unwrap();
    let report = &second.reports[0];
    assert!(!report.muxed);
    assert!(report.rebuilt.is_empty());
    assert!(report.tracks.values().all(|s| *s == TrackState::Reused));
    assert_eq!(backend.calls(), 12);

    let status = wf.status(&manifest, &scope).unwrap();
    assert!(status[0].layers.values().all(|present| *present));
    assert_eq!(status[0].chunks[&TrackType::Ru].complete, 3);
}

#[tokio::test]
async fn test_invalidating_ru_rebuilds_its_dependents_only() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E05"], 12);
    let backend = Arc::new(ScriptedBackend::default());
    let wf = workflow(config(dir.path()), backend.clone(), muxing_media(2));

    wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    let summary = wf.run(&manifest, &RunScope::Group, &[Layer::SubsRu]).await.unwrap();

    let closure: BTreeSet<Layer> = [Layer::SubsRu, Layer::SubsDual, Layer::Mux].into_iter().collect();
    assert_eq!(summary.invalidation.closure, closure);
    let report = &summary.reports[0];
    assert_eq!(report.rebuilt, closure);
    assert_eq!(report.tracks[&TrackType::En], TrackState::Reused);
    assert_eq!(backend.calls_for(TrackType::Ru), 6);
    assert_eq!(backend.calls_for(TrackType::En), 3);
    assert_eq!(backend.calls_for(TrackType::Refs), 3);
    assert_eq!(backend.calls_for(TrackType::Es), 0);
    assert_eq!(report.tracks[&TrackType::Es], TrackState::Off);
}

#[tokio::test]
async fn test_required_track_failure_blocks_mux() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E06"], 12);
    let backend = Arc::new(ScriptedBackend { failing_tracks: vec![TrackType::Ru], ..Default::default() });
    let wf = workflow(config(dir.path()), backend, muxing_media(0));

    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    assert_eq!(summary.failed_episodes(), 1);
    let report = &summary.reports[0];
    assert!(!report.muxed);
    assert!(report.failure.as_deref().unwrap().contains("ru"));
    assert!(matches!(report.tracks[&TrackType::Ru], TrackState::Failed(_)));
    assert!(matches!(report.tracks[&TrackType::Dual], TrackState::Failed(_)));
    assert!(matches!(report.tracks[&TrackType::Refs], TrackState::Built { .. }));
    assert!(!wf.store().episode("S07E06").mux_file().exists());
}

#[tokio::test]
async fn test_optional_track_failure_is_left_out_of_mux() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E07"], 6);
    let backend = Arc::new(ScriptedBackend { failing_tracks: vec![TrackType::Refs], ..Default::default() });

    let mut media = MockMedia::new();
    media
        .expect_mux()
        .withf(|request| {
            request.subtitle_delay_ms == 0
                && request.tracks.len() == 4
                && request.tracks[0].language == "spa"
                && request.tracks[0].default
                && request.tracks.iter().filter(|t| t.default).count() == 1
                && request.tracks.iter().all(|t| !t.path.to_string_lossy().contains("subs_refs"))
        })
        .times(1)
        .returning(|request| {
            std::fs::write(&request.output, b"matroska")?;
            Ok(())
        });
    let wf = workflow(config(dir.path()), backend, media);

    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    let report = &summary.reports[0];
    assert!(report.is_success());
    assert!(report.muxed);
    assert!(matches!(report.tracks[&TrackType::Refs], TrackState::Failed(_)));
}

#[tokio::test]
async fn test_delay_is_estimated_only_when_base_captions_are_built() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E08"], 6);
    let mut config = config(dir.path());
    config.delay.enabled = true;
    config.tracks.refs = TrackMode::Off;

    let mut media = muxing_media(3);
    media
        .expect_audio_envelope()
        .times(2)
        .returning(|_, _| Err(SubweaveError::Media("no audio stream".into())));
    media
        .expect_probe_duration_ms()
        .times(2)
        .returning(|_| Err(SubweaveError::Media("no duration".into())));
    let wf = workflow(config, Arc::new(ScriptedBackend::default()), media);

    let first = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    let delay = first.reports[0].delay.clone().unwrap();
    assert_eq!(delay.method, DelayMethod::Default);
    assert!(wf.store().episode("S07E08").delay_file().exists());

    // base captions survive, so no new estimate
    let second = wf.run(&manifest, &RunScope::Group, &[Layer::SubsEn]).await.unwrap();
    assert!(!second.reports[0].rebuilt.contains(&Layer::Captions));
    assert!(second.reports[0].muxed);

    let third = wf.run(&manifest, &RunScope::Group, &[Layer::Captions]).await.unwrap();
    assert!(third.reports[0].rebuilt.contains(&Layer::Captions));
    assert_eq!(third.reports[0].tracks[&TrackType::Refs], TrackState::Off);
}

#[tokio::test]
async fn test_provided_english_captions_skip_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = manifest(dir.path(), &["S07E09"], 12);
    let english = dir.path().join("inputs").join("S07E09.en.srt");
    std::fs::write(
        &english,
        "1\n00:00:01,000 --> 00:00:03,000\nWhere were you last night?\n\n2\n00:00:04,000 --> 00:00:06,000\nAt my mother's.\n",
    )
    .unwrap();
    manifest.episodes[0].english_captions = Some(english);

    let backend = Arc::new(ScriptedBackend::default());
    let wf = workflow(config(dir.path()), backend.clone(), muxing_media(1));
    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();

    assert!(summary.reports[0].is_success());
    assert_eq!(backend.calls_for(TrackType::En), 0);
    assert_eq!(backend.calls(), 6);
    let en = std::fs::read_to_string(wf.store().episode("S07E09").track_file(Layer::SubsEn)).unwrap();
    assert!(en.contains("At my mother's."));
}

#[tokio::test]
async fn test_failing_episode_does_not_stop_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = manifest(dir.path(), &["S07E10", "S07E11"], 6);
    manifest.episodes[1].video = dir.path().join("inputs").join("missing.mp4");

    let wf = workflow(config(dir.path()), Arc::new(ScriptedBackend::default()), muxing_media(1));
    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].episode_id, "S07E10");
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].0, "S07E11");
    assert!(wf.store().catalog_dir().join("catalog.json").exists());
}

#[tokio::test]
async fn test_requested_default_subtitle_is_flagged_in_mux() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E12"], 6);
    let mut config = config(dir.path());
    config.tracks.default_subtitle = TrackType::Dual;

    let mut media = MockMedia::new();
    media
        .expect_mux()
        .withf(|request| {
            let defaults: Vec<_> = request.tracks.iter().filter(|t| t.default).collect();
            defaults.len() == 1 && defaults[0].path.to_string_lossy().contains("subs_dual")
        })
        .times(1)
        .returning(|request| {
            std::fs::write(&request.output, b"matroska")?;
            Ok(())
        });
    let wf = workflow(config, Arc::new(ScriptedBackend::default()), media);

    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    assert!(summary.reports[0].is_success());
    assert!(summary.reports[0].muxed);
}

#[tokio::test]
async fn test_unavailable_default_subtitle_fails_the_episode() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path(), &["S07E13"], 6);
    let mut config = config(dir.path());
    config.tracks.default_subtitle = TrackType::Refs;
    let backend = Arc::new(ScriptedBackend { failing_tracks: vec![TrackType::Refs], ..Default::default() });
    let wf = workflow(config, backend, muxing_media(0));

    let summary = wf.run(&manifest, &RunScope::Group, &[]).await.unwrap();
    assert_eq!(summary.failed_episodes(), 1);
    let report = &summary.reports[0];
    assert!(!report.muxed);
    assert!(matches!(report.tracks[&TrackType::Refs], TrackState::Failed(_)));
    assert!(report.failure.as_deref().unwrap().contains("Default subtitle 'refs'"));
    assert!(!wf.store().episode("S07E13").mux_file().exists());
}
