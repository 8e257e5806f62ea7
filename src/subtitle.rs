use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, SubweaveError};

/// Stable cue identity, derived from the cue's position in the base caption sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CueId(pub u32);

impl fmt::Display for CueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    pub id: CueId,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

impl Cue {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Parse a caption file, choosing the format from its extension.
pub async fn load_captions<P: AsRef<Path>>(path: P) -> Result<Vec<Cue>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SubweaveError::FileNotFound(path.display().to_string()));
    }
    let raw = fs::read(path).await?;
    let text = String::from_utf8_lossy(&raw);
    let is_vtt = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("vtt"))
        .unwrap_or(false);

    let cues = if is_vtt { parse_vtt(&text) } else { parse_srt(&text) };
    debug!("Loaded {} cues from {}", cues.len(), path.display());
    Ok(cues)
}

/// Parse SRT text. Blocks without a valid timing line are skipped.
pub fn parse_srt(text: &str) -> Vec<Cue> {
    parse_blocks(text, ',')
}

/// Parse WebVTT text, dropping the header, NOTE/STYLE blocks and inline markup.
pub fn parse_vtt(text: &str) -> Vec<Cue> {
    let mut cues = parse_blocks(text, '.');
    for cue in &mut cues {
        cue.text = strip_tags(&cue.text);
    }
    cues
}

fn parse_blocks(text: &str, millis_sep: char) -> Vec<Cue> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut cues = Vec::new();

    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(timing_idx) = lines.iter().position(|l| l.contains("-->")) else {
            continue;
        };
        let Some((start_ms, end_ms)) = parse_timing_line(lines[timing_idx], millis_sep) else {
            continue;
        };
        let body = lines[timing_idx + 1..].join("\n").trim().to_string();
        cues.push(Cue {
            id: CueId(cues.len() as u32),
            start_ms,
            end_ms,
            text: body,
        });
    }

    cues
}

fn parse_timing_line(line: &str, millis_sep: char) -> Option<(i64, i64)> {
    let (start, rest) = line.split_once("-->")?;
    // VTT cue settings may follow the end timestamp
    let end = rest.split_whitespace().next()?;
    Some((
        parse_timestamp(start.trim(), millis_sep)?,
        parse_timestamp(end.trim(), millis_sep)?,
    ))
}

fn parse_timestamp(ts: &str, millis_sep: char) -> Option<i64> {
    let (clock, millis) = ts.split_once(millis_sep)?;
    let millis: i64 = millis.parse().ok()?;
    let parts: Vec<i64> = clock
        .split(':')
        .map(|p| p.parse::<i64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let seconds = match parts.as_slice() {
        [h, m, s] => h * 3600 + m * 60 + s,
        [m, s] => m * 60 + s,
        _ => return None,
    };
    Some(seconds * 1000 + millis)
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

/// Move every cue by `offset_ms`, clamping at zero. Identity and order are preserved.
pub fn shift_cues(cues: &[Cue], offset_ms: i64) -> Vec<Cue> {
    cues.iter()
        .map(|cue| Cue {
            id: cue.id,
            start_ms: (cue.start_ms + offset_ms).max(0),
            end_ms: (cue.end_ms + offset_ms).max(0),
            text: cue.text.clone(),
        })
        .collect()
}

/// Render cues as SRT text, numbering blocks sequentially.
pub fn render_srt(cues: &[Cue]) -> String {
    let mut srt_content = String::new();

    for (index, cue) in cues.iter().enumerate() {
        srt_content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_srt_time(cue.start_ms),
            format_srt_time(cue.end_ms),
            cue.text.trim()
        ));
    }

    srt_content
}

/// Write an SRT file through a temporary sibling so readers never see a partial file.
pub async fn write_srt<P: AsRef<Path>>(cues: &[Cue], output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!("Generating SRT file: {}", output_path.display());

    let tmp_path = output_path.with_extension("srt.partial");
    fs::write(&tmp_path, render_srt(cues)).await?;
    fs::rename(&tmp_path, output_path).await?;

    Ok(())
}

/// Format milliseconds in SRT time format (HH:MM:SS,mmm)
pub fn format_srt_time(ms: i64) -> String {
    let total_milliseconds = ms.max(0);
    let hours = total_milliseconds / 3_600_000;
    let minutes = (total_milliseconds % 3_600_000) / 60_000;
    let secs = (total_milliseconds % 60_000) / 1_000;
    let millis = total_milliseconds % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
