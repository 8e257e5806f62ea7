// Caption delay estimation
//
// - correlation: caption activity against the audio energy envelope
// - alignment: caption cues against ASR segments of a midpoint clip

pub mod alignment;
pub mod correlation;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use correlation::CorrelationEstimate;

use crate::config::DelayConfig;
use crate::error::Result;
use crate::media::MediaToolchain;
use crate::subtitle::Cue;
use crate::transcribe::AsrBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMethod {
    Correlation,
    AsrFallback,
    /// No usable estimate; the configured default was applied
    Default,
}

/// Offset to add to every caption timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayEstimate {
    pub episode_id: String,
    pub offset_ms: i64,
    pub method: DelayMethod,
    pub confidence: f64,
    /// Matched cues for the ASR method
    #[serde(default)]
    pub matched: usize,
}

pub struct DelayEstimator {
    media: Arc<dyn MediaToolchain>,
    asr: Arc<dyn AsrBackend>,
    config: DelayConfig,
    language: String,
}

impl DelayEstimator {
    pub fn new(media: Arc<dyn MediaToolchain>, asr: Arc<dyn AsrBackend>, config: DelayConfig, language: &str) -> Self {
        Self {
            media,
            asr,
            config,
            language: language.to_string(),
        }
    }

    /// Estimate the caption offset for one episode. Collaborator failures degrade to the
    /// next method; only I/O on `scratch_dir` is an error.
    pub async fn estimate(&self, episode_id: &str, video: &Path, cues: &[Cue], scratch_dir: &Path) -> Result<DelayEstimate> {
        let correlation = match self.media.audio_envelope(video, self.config.bin_ms).await {
            Ok(envelope) => correlation::estimate(cues, &envelope, self.config.bin_ms, self.config.max_offset_ms),
            Err(e) => {
                warn!("Audio envelope unavailable for {}: {}", episode_id, e);
                None
            }
        };

        if let Some(est) = correlation {
            debug!(
                "Correlation for {}: offset {}ms, confidence {:.2}",
                episode_id, est.offset_ms, est.confidence
            );
            if est.confidence >= self.config.confidence_threshold {
                return Ok(self.finish(episode_id, est.offset_ms, DelayMethod::Correlation, est.confidence, 0));
            }
            info!(
                "Correlation confidence {:.2} below {:.2} for {}, trying ASR",
                est.confidence, self.config.confidence_threshold, episode_id
            );
        }

        match self.estimate_by_asr(episode_id, video, cues, scratch_dir).await? {
            Some(estimate) => Ok(estimate),
            None => Ok(match correlation {
                Some(est) => self.finish(episode_id, est.offset_ms, DelayMethod::Correlation, est.confidence, 0),
                None => self.finish(episode_id, self.config.default_offset_ms, DelayMethod::Default, 0.0, 0),
            }),
        }
    }

    async fn estimate_by_asr(
        &self,
        episode_id: &str,
        video: &Path,
        cues: &[Cue],
        scratch_dir: &Path,
    ) -> Result<Option<DelayEstimate>> {
        let duration_ms = match self.media.probe_duration_ms(video).await {
            Ok(d) if d > 0 => d,
            Ok(_) => return Ok(None),
            Err(e) => {
                warn!("Duration probe failed for {}: {}", episode_id, e);
                return Ok(None);
            }
        };
        let clip_ms = (self.config.clip_secs as i64 * 1000).min(duration_ms);
        let clip_start = (duration_ms - clip_ms) / 2;

        tokio::fs::create_dir_all(scratch_dir).await?;
        let clip_path = scratch_dir.join("delay_clip.wav");
        if let Err(e) = self.media.extract_clip(video, clip_start, clip_ms, &clip_path).await {
            warn!("Clip extraction failed for {}: {}", episode_id, e);
            return Ok(None);
        }
        let segments = self.asr.transcribe(&clip_path, &self.language).await;
        if let Err(e) = tokio::fs::remove_file(&clip_path).await {
            debug!("Clip {} not removed: {}", clip_path.display(), e);
        }
        let mut segments = match segments {
            Ok(segments) => segments,
            Err(e) => {
                warn!("ASR failed for {}: {}", episode_id, e);
                return Ok(None);
            }
        };
        for seg in &mut segments {
            seg.start_ms += clip_start;
            seg.end_ms += clip_start;
        }

        let window_start = clip_start - self.config.max_offset_ms;
        let window_end = clip_start + clip_ms + self.config.max_offset_ms;
        let in_clip: Vec<Cue> = cues
            .iter()
            .filter(|c| c.start_ms >= window_start && c.start_ms <= window_end)
            .cloned()
            .collect();

        let matches = alignment::match_cues(&in_clip, &segments, self.config.min_similarity, self.config.max_offset_ms);
        if matches.len() < self.config.min_asr_matches.max(1) {
            info!(
                "Only {} ASR matches for {} (need {}), discarding ASR estimate",
                matches.len(),
                episode_id,
                self.config.min_asr_matches
            );
            return Ok(None);
        }

        let deltas: Vec<i64> = matches.iter().map(|m| m.delta_ms).collect();
        let Some(offset) = alignment::median(&deltas) else {
            return Ok(None);
        };
        let mean_similarity = matches.iter().map(|m| m.similarity).sum::<f64>() / matches.len() as f64;
        let confidence = (matches.len() as f64 / 40.0).min(1.0) * mean_similarity;
        Ok(Some(self.finish(episode_id, offset, DelayMethod::AsrFallback, confidence, matches.len())))
    }

    fn finish(&self, episode_id: &str, offset_ms: i64, method: DelayMethod, confidence: f64, matched: usize) -> DelayEstimate {
        let limit = self.config.max_offset_ms.abs();
        let estimate = DelayEstimate {
            episode_id: episode_id.to_string(),
            offset_ms: offset_ms.clamp(-limit, limit),
            method,
            confidence,
            matched,
        };
        info!(
            "Delay for {}: {}ms ({:?}, confidence {:.2})",
            episode_id, estimate.offset_ms, estimate.method, estimate.confidence
        );
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::SubweaveError;
    use crate::media::MockMediaToolchain;
    use crate::subtitle::CueId;
    use crate::transcribe::{AsrSegment, MockAsrBackend};

    const LINES: [&str; 5] = [
        "¿Dónde estabas anoche?",
        "En casa de mi madre, ya te lo dije.",
        "No me lo creo, Antonio.",
        "Pues pregúntale a ella si quieres.",
        "Vale, vale, no te enfades conmigo.",
    ];

    fn cues(starts: &[i64]) -> Vec<Cue> {
        starts
            .iter()
            .zip(LINES)
            .enumerate()
            .map(|(i, (&s, t))| Cue { id: CueId(i as u32), start_ms: s, end_ms: s + 2000, text: t.into() })
            .collect()
    }

    #[tokio::test]
    async fn test_no_envelope_and_no_asr_gives_default() {
        let mut media = MockMediaToolchain::new();
        media
            .expect_audio_envelope()
            .returning(|_, _| Err(SubweaveError::Media("no audio".into())));
        media
            .expect_probe_duration_ms()
            .returning(|_| Err(SubweaveError::Media("no probe".into())));
        let asr = MockAsrBackend::new();

        let dir = tempfile::tempdir().unwrap();
        let estimator = DelayEstimator::new(Arc::new(media), Arc::new(asr), Config::default().delay, "es");
        let est = estimator
            .estimate("E1", Path::new("v.mp4"), &cues(&[1000, 5000, 9000, 13000, 17000]), dir.path())
            .await
            .unwrap();
        assert_eq!(est.method, DelayMethod::Default);
        assert_eq!(est.offset_ms, 0);
    }

    #[tokio::test]
    async fn test_asr_fallback_uses_median_of_deltas() {
        // clip of 300s in the middle of a 900s episode starts at 300s
        let base = 300_000;
        let caption_starts = [base + 10_000, base + 20_000, base + 30_000, base + 40_000, base + 50_000];
        let deltas = [180, 210, 195, 4200, 205];

        let mut media = MockMediaToolchain::new();
        media.expect_audio_envelope().returning(|_, _| Ok(vec![0; 9000]));
        media.expect_probe_duration_ms().returning(|_| Ok(900_000));
        media
            .expect_extract_clip()
            .withf(|_, start, len, _| *start == 300_000 && *len == 300_000)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut asr = MockAsrBackend::new();
        asr.expect_transcribe().times(1).returning(move |_, _| {
            Ok(LINES
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let start = (i as i64 + 1) * 10_000 + deltas[i];
                    AsrSegment { start_ms: start, end_ms: start + 2000, text: t.to_lowercase() }
                })
                .collect())
        });

        let dir = tempfile::tempdir().unwrap();
        let estimator = DelayEstimator::new(Arc::new(media), Arc::new(asr), Config::default().delay, "es");
        let est = estimator
            .estimate("E1", Path::new("v.mp4"), &cues(&caption_starts), dir.path())
            .await
            .unwrap();
        assert_eq!(est.method, DelayMethod::AsrFallback);
        assert_eq!(est.offset_ms, 205);
        assert_eq!(est.matched, 5);
    }

    /// One long stretch of speech around the midpoint clip's captions: every lag that keeps
    /// the captions inside it scores the same, so correlation finds a peak with no sharpness.
    fn flat_speech_envelope() -> Vec<u32> {
        let mut env = vec![0; 9000];
        env[3150..3800].iter_mut().for_each(|v| *v = 1000);
        env
    }

    fn midpoint_cues() -> Vec<Cue> {
        let base = 300_000;
        cues(&[base + 10_000, base + 20_000, base + 30_000, base + 40_000, base + 50_000])
    }

    #[test]
    fn test_flat_speech_envelope_correlates_weakly() {
        let est = correlation::estimate(&midpoint_cues(), &flat_speech_envelope(), 100, 10_000).unwrap();
        assert_eq!(est.offset_ms, 5000);
        assert!(est.confidence < Config::default().delay.confidence_threshold);
    }

    #[tokio::test]
    async fn test_weak_correlation_falls_back_to_asr() {
        let deltas = [180, 210, 195, 4200, 205];

        let mut media = MockMediaToolchain::new();
        media.expect_audio_envelope().times(1).returning(|_, _| Ok(flat_speech_envelope()));
        media.expect_probe_duration_ms().times(1).returning(|_| Ok(900_000));
        media
            .expect_extract_clip()
            .withf(|_, start, len, _| *start == 300_000 && *len == 300_000)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut asr = MockAsrBackend::new();
        asr.expect_transcribe().times(1).returning(move |_, _| {
            Ok(LINES
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let start = (i as i64 + 1) * 10_000 + deltas[i];
                    AsrSegment { start_ms: start, end_ms: start + 2000, text: t.to_lowercase() }
                })
                .collect())
        });

        let dir = tempfile::tempdir().unwrap();
        let estimator = DelayEstimator::new(Arc::new(media), Arc::new(asr), Config::default().delay, "es");
        let est = estimator
            .estimate("E1", Path::new("v.mp4"), &midpoint_cues(), dir.path())
            .await
            .unwrap();
        assert_eq!(est.method, DelayMethod::AsrFallback);
        assert_eq!(est.offset_ms, 205);
        assert_eq!(est.matched, 5);
    }

    #[tokio::test]
    async fn test_weak_correlation_kept_when_asr_matches_too_few() {
        let mut media = MockMediaToolchain::new();
        media.expect_audio_envelope().times(1).returning(|_, _| Ok(flat_speech_envelope()));
        media.expect_probe_duration_ms().times(1).returning(|_| Ok(900_000));
        media.expect_extract_clip().times(1).returning(|_, _, _, _| Ok(()));
        let mut asr = MockAsrBackend::new();
        asr.expect_transcribe().times(1).returning(|_, _| {
            Ok(vec![
                AsrSegment { start_ms: 10_200, end_ms: 12_000, text: "dónde estabas anoche".into() },
                AsrSegment { start_ms: 20_200, end_ms: 22_000, text: "en casa de mi madre ya te lo dije".into() },
            ])
        });

        let dir = tempfile::tempdir().unwrap();
        let estimator = DelayEstimator::new(Arc::new(media), Arc::new(asr), Config::default().delay, "es");
        let est = estimator
            .estimate("E1", Path::new("v.mp4"), &midpoint_cues(), dir.path())
            .await
            .unwrap();
        assert_eq!(est.method, DelayMethod::Correlation);
        assert_eq!(est.offset_ms, 5000);
        assert_eq!(est.matched, 0);
    }

    #[tokio::test]
    async fn test_too_few_matches_discards_asr() {
        let mut media = MockMediaToolchain::new();
        media.expect_audio_envelope().returning(|_, _| Ok(vec![0; 100]));
        media.expect_probe_duration_ms().returning(|_| Ok(60_000));
        media.expect_extract_clip().returning(|_, _, _, _| Ok(()));
        let mut asr = MockAsrBackend::new();
        asr.expect_transcribe().returning(|_, _| {
            Ok(vec![AsrSegment { start_ms: 1_100, end_ms: 3_000, text: "dónde estabas anoche".into() }])
        });

        let dir = tempfile::tempdir().unwrap();
        let estimator = DelayEstimator::new(Arc::new(media), Arc::new(asr), Config::default().delay, "es");
        let est = estimator
            .estimate("E1", Path::new("v.mp4"), &cues(&[1000, 5000, 9000, 13000, 17000]), dir.path())
            .await
            .unwrap();
        assert_eq!(est.method, DelayMethod::Default);
    }
}
