use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::subtitle::CueId;
use crate::tracks::TrackType;

/// Why a backend row was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    Empty,
    ControlCharacters,
    TooLong { chars: usize, limit: usize },
    TooManyLines(usize),
    Repetitive,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Empty => write!(f, "empty output"),
            Violation::ControlCharacters => write!(f, "control characters in output"),
            Violation::TooLong { chars, limit } => write!(f, "output too long ({} > {} chars)", chars, limit),
            Violation::TooManyLines(n) => write!(f, "too many lines ({})", n),
            Violation::Repetitive => write!(f, "same output for unrelated cues"),
        }
    }
}

/// Minimal per-track content check applied to every parsed row.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    max_length_ratio: f64,
    slack_chars: usize,
    max_lines: usize,
}

impl ContentPolicy {
    pub fn for_track(track: TrackType) -> Self {
        match track {
            TrackType::Es | TrackType::En | TrackType::Ru | TrackType::Dual => Self {
                max_length_ratio: 3.0,
                slack_chars: 40,
                max_lines: 4,
            },
            // Glosses list several terms per cue
            TrackType::Refs => Self {
                max_length_ratio: 5.0,
                slack_chars: 160,
                max_lines: 8,
            },
        }
    }

    pub fn check(&self, source: &str, output: &str) -> std::result::Result<(), Violation> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Err(Violation::Empty);
        }
        if trimmed.chars().any(|c| c.is_control() && c != '\n') {
            return Err(Violation::ControlCharacters);
        }

        let chars = trimmed.chars().count();
        let limit = (source.chars().count() as f64 * self.max_length_ratio) as usize + self.slack_chars;
        if chars > limit {
            return Err(Violation::TooLong { chars, limit });
        }

        let lines = trimmed.lines().count();
        if lines > self.max_lines {
            return Err(Violation::TooManyLines(lines));
        }

        Ok(())
    }

    /// Ids whose output is shared by three or more different sources, a sign of a looping backend.
    pub fn repetitive_ids(&self, rows: &[(CueId, &str, &str)]) -> Vec<CueId> {
        let mut groups: HashMap<String, Vec<(CueId, &str)>> = HashMap::new();
        for (id, source, output) in rows {
            let key = normalize(output);
            if key.chars().count() <= 10 {
                continue;
            }
            groups.entry(key).or_default().push((*id, *source));
        }

        let mut flagged = Vec::new();
        for members in groups.values() {
            let distinct: HashSet<String> = members.iter().map(|(_, s)| normalize(s)).collect();
            if distinct.len() >= 3 {
                flagged.extend(members.iter().map(|(id, _)| *id));
            }
        }
        flagged.sort();
        flagged
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_whitespace_rejected() {
        let policy = ContentPolicy::for_track(TrackType::Ru);
        assert_eq!(policy.check("Hola", "  "), Err(Violation::Empty));
        assert!(policy.check("Hola", "Привет").is_ok());
    }

    #[test]
    fn test_runaway_output_rejected() {
        let policy = ContentPolicy::for_track(TrackType::En);
        let long = "word ".repeat(60);
        assert!(matches!(policy.check("Sí.", &long), Err(Violation::TooLong { .. })));
    }

    #[test]
    fn test_output_equal_to_source_is_accepted() {
        // lyrics and names often stay as they are
        let source = "I will always love you, baby";
        for track in [TrackType::En, TrackType::Ru, TrackType::Es] {
            assert!(ContentPolicy::for_track(track).check(source, source).is_ok());
        }
    }

    #[test]
    fn test_control_characters_rejected() {
        let policy = ContentPolicy::for_track(TrackType::Es);
        assert_eq!(policy.check("Hola", "Ho\u{7}la"), Err(Violation::ControlCharacters));
        assert!(policy.check("Hola", "Hola,\nguapa").is_ok());
    }

    #[test]
    fn test_repetitive_outputs_flagged() {
        let policy = ContentPolicy::for_track(TrackType::Ru);
        let rows = vec![
            (CueId(1), "Uno dos", "Это повторяющийся ответ"),
            (CueId(2), "Tres cuatro", "Это повторяющийся ответ"),
            (CueId(3), "Cinco seis", "Это повторяющийся ответ"),
            (CueId(4), "Siete", "Семь"),
        ];
        assert_eq!(policy.repetitive_ids(&rows), vec![CueId(1), CueId(2), CueId(3)]);
    }

    #[test]
    fn test_same_source_same_output_is_not_repetitive() {
        let policy = ContentPolicy::for_track(TrackType::Ru);
        let rows = vec![
            (CueId(1), "¿Qué has dicho?", "Что ты сказал?"),
            (CueId(2), "¿Qué has dicho?", "Что ты сказал?"),
            (CueId(3), "¿Qué has dicho?", "Что ты сказал?"),
        ];
        assert!(policy.repetitive_ids(&rows).is_empty());
    }
}
