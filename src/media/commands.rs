use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SubweaveError};

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Quiet, non-interactive ffmpeg
    pub fn quiet(self) -> Self {
        self.args(["-hide_banner", "-nostdin", "-loglevel", "error"])
    }

    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    /// Run the command and return its stdout.
    pub async fn execute_capture(&self) -> Result<Vec<u8>> {
        debug!("Executing media command: {} {:?}", self.binary_path, self.args);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubweaveError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubweaveError::Media(format!("{} failed: {}", self.description, stderr.trim())));
        }

        Ok(output.stdout)
    }

    pub async fn execute(&self) -> Result<()> {
        self.execute_capture().await.map(|_| ())
    }
}

/// One subtitle stream of a mux.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxTrack {
    pub path: std::path::PathBuf,
    /// ISO 639-2 language tag
    pub language: String,
    pub title: String,
    /// Player picks this stream when none is chosen
    pub default: bool,
}

/// Builder for the ffmpeg and ffprobe invocations the pipeline needs
pub struct MediaCommandBuilder {
    binary_path: String,
    probe_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, probe_path: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            probe_path: probe_path.into(),
        }
    }

    pub fn probe_duration<P: AsRef<Path>>(&self, media: P) -> MediaCommand {
        MediaCommand::new(&self.probe_path, "Duration probe")
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=nw=1:nk=1"])
            .output(media)
    }

    /// Mono s16le samples on stdout, one sample per `bin_ms`.
    pub fn audio_envelope<P: AsRef<Path>>(&self, media: P, bin_ms: u32) -> MediaCommand {
        let rate = (1000 / bin_ms.max(1)).max(1);
        MediaCommand::new(&self.binary_path, "Audio envelope extraction")
            .quiet()
            .input(media)
            .no_video()
            .audio_channels(1)
            .audio_sample_rate(rate)
            .args(["-f", "s16le", "-"])
    }

    /// 16 kHz mono WAV clip for ASR.
    pub fn extract_clip<P: AsRef<Path>>(&self, media: P, start_ms: i64, duration_ms: i64, output: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Audio clip extraction")
            .quiet()
            .arg("-ss")
            .arg(format_seconds(start_ms))
            .arg("-t")
            .arg(format_seconds(duration_ms))
            .input(media)
            .no_video()
            .arg("-acodec")
            .arg("pcm_s16le")
            .audio_sample_rate(16000)
            .audio_channels(1)
            .overwrite()
            .output(output)
    }

    /// Video plus SRT subtitle streams into an MKV, streams copied.
    pub fn mux<P: AsRef<Path>>(&self, video: P, tracks: &[MuxTrack], subtitle_delay_ms: i64, output: P) -> MediaCommand {
        let mut cmd = MediaCommand::new(&self.binary_path, "Mux").quiet().overwrite().input(video);
        for track in tracks {
            if subtitle_delay_ms != 0 {
                cmd = cmd.arg("-itsoffset").arg(format_seconds(subtitle_delay_ms));
            }
            cmd = cmd.input(&track.path);
        }

        cmd = cmd.arg("-map").arg("0");
        for i in 1..=tracks.len() {
            cmd = cmd.arg("-map").arg(i.to_string());
        }
        cmd = cmd.args(["-c", "copy", "-c:s", "srt"]);

        for (idx, track) in tracks.iter().enumerate() {
            cmd = cmd
                .arg(format!("-metadata:s:s:{}", idx))
                .arg(format!("language={}", track.language))
                .arg(format!("-metadata:s:s:{}", idx))
                .arg(format!("title={}", track.title))
                .arg(format!("-disposition:s:{}", idx))
                .arg(if track.default { "default" } else { "0" });
        }
        cmd.output(output)
    }

    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}

fn format_seconds(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let ms = ms.abs();
    format!("{}{}.{:03}", sign, ms / 1000, ms % 1000)
}
