//! Caption cues against recognized speech.

use crate::subtitle::Cue;
use crate::transcribe::AsrSegment;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueMatch {
    /// Recognized start minus caption start
    pub delta_ms: i64,
    pub similarity: f64,
}

pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pair each caption cue with the most similar segment starting within `max_offset_ms` of
/// it. Segment times are absolute. Matches keep the segment order monotonic, so one
/// segment is never paired with an earlier cue than a previous match.
pub fn match_cues(cues: &[Cue], segments: &[AsrSegment], min_similarity: f64, max_offset_ms: i64) -> Vec<CueMatch> {
    let segments: Vec<(i64, String)> = segments
        .iter()
        .map(|s| (s.start_ms, normalize(&s.text)))
        .filter(|(_, t)| !t.is_empty())
        .collect();

    let mut matches = Vec::new();
    let mut cursor = 0;
    for cue in cues {
        let text = normalize(&cue.text);
        if text.is_empty() {
            continue;
        }

        let best = segments
            .iter()
            .enumerate()
            .skip(cursor)
            .filter(|(_, (start, _))| (start - cue.start_ms).abs() <= max_offset_ms)
            .map(|(i, (start, seg))| (i, *start, strsim::sorensen_dice(&text, seg)))
            .fold(None::<(usize, i64, f64)>, |best, cand| match best {
                Some(b) if b.2 >= cand.2 => Some(b),
                _ => Some(cand),
            });

        if let Some((i, start, similarity)) = best {
            if similarity >= min_similarity {
                matches.push(CueMatch { delta_ms: start - cue.start_ms, similarity });
                cursor = i + 1;
            }
        }
    }
    matches
}

/// Median; the two middle values are averaged for an even count.
pub fn median(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitle::CueId;

    fn cue(id: u32, start_ms: i64, text: &str) -> Cue {
        Cue { id: CueId(id), start_ms, end_ms: start_ms + 1500, text: text.into() }
    }

    fn seg(start_ms: i64, text: &str) -> AsrSegment {
        AsrSegment { start_ms, end_ms: start_ms + 1500, text: text.into() }
    }

    #[test]
    fn test_median_ignores_outlier() {
        assert_eq!(median(&[180, 210, 195, 4200, 205]), Some(205));
        assert_eq!(median(&[100, 300]), Some(200));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_matches_similar_text_near_in_time() {
        let cues = vec![
            cue(0, 10_000, "¿Dónde estabas anoche?"),
            cue(1, 15_000, "En casa de mi madre."),
            cue(2, 20_000, "No te creo nada."),
        ];
        let segments = vec![
            seg(10_200, "dónde estabas anoche"),
            seg(15_210, "en casa de mi madre"),
            seg(20_190, "algo completamente distinto aquí"),
        ];
        let matches = match_cues(&cues, &segments, 0.58, 10_000);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].delta_ms, 200);
        assert_eq!(matches[1].delta_ms, 210);
    }

    #[test]
    fn test_far_segments_are_ignored() {
        let cues = vec![cue(0, 10_000, "¿Dónde estabas anoche?")];
        let segments = vec![seg(40_000, "dónde estabas anoche")];
        assert!(match_cues(&cues, &segments, 0.58, 10_000).is_empty());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("¡Hola, María!\nVale."), "hola maría vale");
    }
}
