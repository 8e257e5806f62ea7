//! Request payload and response parsing.
//!
//! Rows go out as tab separated lines `token<TAB>text<TAB>prev<TAB>next<TAB>echo` and are
//! expected back as `token<TAB>output<TAB>echo`. The token is derived from the cue id and
//! text so that a row cannot be attributed to the wrong cue, and the echo (the start of the
//! source text) must come back unchanged for the row to be accepted.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use super::planner::SourceRow;
use crate::subtitle::CueId;
use crate::tracks::TrackType;

const ECHO_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRow {
    pub token: String,
    pub id: CueId,
    pub text: String,
    pub prev: Option<String>,
    pub next: Option<String>,
    pub echo: String,
}

pub fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\r', "")
        .replace('\n', "\\n")
}

pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Correlation token for one cue.
pub fn token_for(id: CueId, text: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", id, text).as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Leading characters of the normalized source text, without opening punctuation.
pub fn echo_for(text: &str) -> String {
    let normalized = normalize_quotes(text);
    let stripped = normalized.trim_start_matches(|c: char| {
        c.is_whitespace() || "-\u{2013}\u{2014}.,!?¡¿:;\"'()[]{}".contains(c)
    });
    stripped.chars().take(ECHO_CHARS).collect::<String>().trim().to_string()
}

fn normalize_quotes(text: &str) -> String {
    text.trim()
        .replace('\u{2026}', "...")
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{ab}' | '\u{bb}' => '"',
            other => other,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn build_rows(rows: &[SourceRow]) -> Vec<PayloadRow> {
    rows.iter()
        .map(|row| PayloadRow {
            token: token_for(row.id, &row.text),
            id: row.id,
            text: row.text.clone(),
            prev: row.prev.clone(),
            next: row.next.clone(),
            echo: echo_for(&row.text),
        })
        .collect()
}

pub fn render_payload(rows: &[PayloadRow]) -> String {
    rows.iter()
        .map(|row| {
            format!(
                "{}\t{}\t{}\t{}\t{}",
                row.token,
                escape(&row.text),
                escape(row.prev.as_deref().unwrap_or("")),
                escape(row.next.as_deref().unwrap_or("")),
                escape(&row.echo)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full prompt for one chunk.
pub fn render_prompt(track: TrackType, source_language: &str, rows: &[PayloadRow]) -> String {
    let task = match track {
        TrackType::Es => format!(
            "Lightly edit each subtitle line in {}: fix spelling, punctuation and obvious \
             transcription errors. Do not rephrase, shorten or translate; when a line needs no \
             change, return it as it is.",
            source_language
        ),
        TrackType::En | TrackType::Ru | TrackType::Dual => format!(
            "Translate each subtitle line from {} to {}. Keep the tone and register of spoken \
             dialogue and keep each line about as short as the original.",
            source_language,
            track.target_language()
        ),
        TrackType::Refs => format!(
            "For each subtitle line in {}, list the words or idioms an upper-intermediate learner \
             would not know, as `term - Russian gloss` separated by `; `. Write `-` when the line \
             needs no glosses.",
            source_language
        ),
    };

    format!(
        "You are a professional subtitle translator.\n\
         \n\
         {}\n\
         \n\
         Input rows are tab separated: id, text, previous line, next line, echo.\n\
         The previous and next lines are context only; do not translate them.\n\
         \n\
         Answer with exactly one line per input row and nothing else:\n\
         id<TAB>result<TAB>echo\n\
         Copy id and echo unchanged. Write line breaks inside a result as \\n.\n\
         \n\
         [Rows]\n\
         {}\n",
        task,
        render_payload(rows)
    )
}

/// Rows recovered from one backend response.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub outputs: BTreeMap<CueId, String>,
    /// Lines whose token matched no expected row
    pub unknown: usize,
    /// Lines whose echo did not match
    pub echo_mismatch: usize,
    /// Repeated tokens; the first occurrence wins
    pub duplicates: usize,
}

/// Parse a response against the rows that were sent. Lines that cannot be attributed to a
/// sent row are counted and discarded; nothing outside `expected` is ever returned.
pub fn parse_response(raw: &str, expected: &[PayloadRow]) -> ParsedResponse {
    let by_token: HashMap<&str, &PayloadRow> = expected.iter().map(|r| (r.token.as_str(), r)).collect();
    let mut parsed = ParsedResponse::default();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with("```") {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            continue;
        }

        let token = unescape(parts[0]).trim().to_string();
        let Some(row) = by_token.get(token.as_str()) else {
            parsed.unknown += 1;
            continue;
        };
        // stray tabs inside the result stay part of it
        let echo = unescape(parts[parts.len() - 1]).trim().to_string();
        if echo != row.echo {
            parsed.echo_mismatch += 1;
            continue;
        }
        let text = unescape(&parts[1..parts.len() - 1].join("\t")).trim().to_string();
        if parsed.outputs.contains_key(&row.id) {
            parsed.duplicates += 1;
            continue;
        }
        parsed.outputs.insert(row.id, text);
    }

    parsed
}
