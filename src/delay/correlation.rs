//! Caption activity against audio energy.

use crate::subtitle::Cue;

/// Half-open bin ranges `[start, end)`.
pub type Intervals = Vec<(usize, usize)>;

/// Lags closer than this to the peak count as the peak itself.
const PEAK_EXCLUSION_BINS: i64 = 3;
const ENERGY_FLOOR: u32 = 350;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationEstimate {
    pub offset_ms: i64,
    pub confidence: f64,
    pub best_score: usize,
}

pub fn merge(mut intervals: Intervals) -> Intervals {
    intervals.sort_unstable();
    let mut merged: Intervals = Vec::with_capacity(intervals.len());
    for (s, e) in intervals {
        match merged.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => merged.push((s, e)),
        }
    }
    merged
}

pub fn caption_intervals(cues: &[Cue], bin_ms: u32, n_bins: usize) -> Intervals {
    let bin = bin_ms.max(1) as i64;
    let intervals = cues
        .iter()
        .filter(|c| c.has_text())
        .filter_map(|c| {
            let s = (c.start_ms.max(0) / bin) as usize;
            let e = ((c.end_ms.max(0) + bin - 1) / bin) as usize;
            let (s, e) = (s.min(n_bins), e.min(n_bins));
            (e > s).then_some((s, e))
        })
        .collect();
    merge(intervals)
}

/// Runs of bins whose energy reaches the 65th percentile (and a fixed floor).
pub fn speech_intervals(envelope: &[u32]) -> Intervals {
    if envelope.is_empty() {
        return Vec::new();
    }
    let mut sorted = envelope.to_vec();
    sorted.sort_unstable();
    let idx = (0.65 * (sorted.len() - 1) as f64) as usize;
    let threshold = sorted[idx].max(ENERGY_FLOOR);

    let mut intervals = Vec::new();
    let mut run_start = None;
    for (i, &v) in envelope.iter().enumerate() {
        match (v >= threshold, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                intervals.push((s, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        intervals.push((s, envelope.len()));
    }
    intervals
}

fn overlap(a: &[(usize, usize)], b: &[(usize, usize)]) -> usize {
    let (mut i, mut j, mut total) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        let (s1, e1) = a[i];
        let (s2, e2) = b[j];
        let (s, e) = (s1.max(s2), e1.min(e2));
        if e > s {
            total += e - s;
        }
        if e1 <= e2 {
            i += 1;
        } else {
            j += 1;
        }
    }
    total
}

fn shift(intervals: &[(usize, usize)], lag: i64, n_bins: usize) -> Intervals {
    let n = n_bins as i64;
    intervals
        .iter()
        .filter_map(|&(s, e)| {
            let (s, e) = (s as i64 + lag, e as i64 + lag);
            (e > 0 && s < n).then(|| (s.max(0) as usize, e.min(n) as usize))
        })
        .collect()
}

/// Overlap score for every lag in `-max_bins..=max_bins`. A positive lag moves captions later.
pub fn lag_scores(captions: &[(usize, usize)], speech: &[(usize, usize)], n_bins: usize, max_bins: i64) -> Vec<(i64, usize)> {
    (-max_bins..=max_bins)
        .map(|lag| (lag, overlap(&shift(captions, lag, n_bins), speech)))
        .collect()
}

/// Best lag and its sharpness: how far the peak stands above the best lag outside its
/// immediate neighbourhood, relative to the peak.
pub fn estimate(cues: &[Cue], envelope: &[u32], bin_ms: u32, max_offset_ms: i64) -> Option<CorrelationEstimate> {
    let n_bins = envelope.len();
    let speech = speech_intervals(envelope);
    let captions = caption_intervals(cues, bin_ms, n_bins);
    if speech.is_empty() || captions.is_empty() {
        return None;
    }

    let max_bins = max_offset_ms.max(0) / bin_ms.max(1) as i64;
    let scores = lag_scores(&captions, &speech, n_bins, max_bins);

    // ties go to the smallest shift
    let &(best_lag, best_score) = scores
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.abs().cmp(&a.0.abs())))?;
    if best_score == 0 {
        return None;
    }
    let runner_up = scores
        .iter()
        .filter(|(lag, _)| (lag - best_lag).abs() >= PEAK_EXCLUSION_BINS)
        .map(|(_, score)| *score)
        .max()
        .unwrap_or(0);

    Some(CorrelationEstimate {
        offset_ms: best_lag * bin_ms as i64,
        confidence: (best_score - runner_up) as f64 / best_score as f64,
        best_score,
    })
}
