#![forbid(unsafe_code)]

//! Process contract with the external yt-dlp binary.
//!
//! yt-dlp is treated as a black box with exactly two observable outcomes per
//! invocation: an exit status and whatever files it leaves behind. This
//! module owns spawning, the wall-clock budget, and the tolerant parsing of
//! `--dump-single-json` payloads; which arguments to pass is the caller's
//! business.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Containers the info endpoint exposes. Everything else yt-dlp reports
/// (DASH fragments, storyboards, exotic containers) is filtered out.
const PLAYABLE_CONTAINERS: [&str; 6] = ["mp4", "webm", "m4a", "mp3", "ogg", "wav"];

/// Minimal slice of yt-dlp's `--dump-single-json` payload. Every field is
/// optional because older or region-locked videos routinely lack metadata.
#[derive(Debug, Deserialize)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

impl VideoInfo {
    /// Prefers the unabridged title, falls back to the short one.
    pub fn display_title(&self) -> Option<&str> {
        self.fulltitle
            .as_deref()
            .or(self.title.as_deref())
            .filter(|title| !title.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct FormatInfo {
    #[serde(rename = "format_id")]
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<i64>,
    pub quality: Option<f64>,
    pub filesize: Option<i64>,
}

impl FormatInfo {
    /// A missing codec field counts as present; yt-dlp writes the literal
    /// string "none" when a stream genuinely lacks that track.
    fn has_video(&self) -> bool {
        !self
            .vcodec
            .as_deref()
            .is_some_and(|codec| codec.eq_ignore_ascii_case("none"))
    }

    fn has_audio(&self) -> bool {
        !self
            .acodec
            .as_deref()
            .is_some_and(|codec| codec.eq_ignore_ascii_case("none"))
    }
}

/// Response shape of `GET /videos/info`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSummary {
    pub itag: Option<String>,
    /// `"<height>p"` when the height is known, otherwise the raw numeric
    /// quality, otherwise the string `"unknown"`.
    pub quality: Value,
    pub mime_type: String,
    pub container: String,
    pub has_video: bool,
    pub has_audio: bool,
    /// Byte count when reported, the string `"unknown"` when not.
    pub filesize: Value,
}

/// Flattens a raw metadata payload into the info-endpoint DTO, keeping only
/// formats that carry audio in a playable container.
pub fn summarize(info: &VideoInfo) -> VideoSummary {
    let formats = info
        .formats
        .iter()
        .filter(|format| {
            format.has_audio()
                && format
                    .ext
                    .as_deref()
                    .is_some_and(|ext| PLAYABLE_CONTAINERS.contains(&ext))
        })
        .map(|format| {
            let container = format.ext.clone().unwrap_or_default();
            let quality = match (format.height, format.quality) {
                (Some(height), _) => Value::String(format!("{height}p")),
                (None, Some(quality)) if quality != 0.0 => {
                    serde_json::json!(quality)
                }
                _ => Value::String("unknown".to_owned()),
            };
            let media = if format.has_video() { "video" } else { "audio" };
            FormatSummary {
                itag: format.format_id.clone(),
                quality,
                mime_type: format!("{media}/{container}"),
                container,
                has_video: format.has_video(),
                has_audio: format.has_audio(),
                filesize: match format.filesize {
                    Some(size) => serde_json::json!(size),
                    None => Value::String("unknown".to_owned()),
                },
            }
        })
        .collect();

    VideoSummary {
        title: info.display_title().map(str::to_owned),
        duration: info.duration,
        thumbnail: info.thumbnail.clone(),
        formats,
    }
}

/// Runs `<bin> --version` to fail loudly at startup when yt-dlp is missing.
pub async fn ensure_available(bin: &Path) -> Result<()> {
    let status = Command::new(bin)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            bin.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", bin.display(), err),
    }
}

/// Fetches the full metadata record for a URL.
pub async fn metadata(bin: &Path, url: &str, timeout: Duration) -> Result<VideoInfo> {
    let mut command = Command::new(bin);
    command
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-warnings")
        .arg("--no-progress")
        .arg(url);

    let output = run(command, timeout)
        .await
        .with_context(|| format!("fetching metadata for {url}"))?;
    serde_json::from_slice(&output.stdout).context("deserializing yt-dlp metadata JSON")
}

/// Executes a prepared yt-dlp invocation under a wall-clock budget. On
/// expiry the child is killed (via `kill_on_drop`) and the run reports a
/// timeout; a non-zero exit surfaces trimmed stderr for diagnostics.
pub async fn run(mut command: Command, timeout: Duration) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?command.as_std(), "running yt-dlp");

    let child = command.spawn().context("launching yt-dlp")?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.context("waiting for yt-dlp")?,
        Err(_) => bail!(
            "yt-dlp exceeded the {}s time budget and was killed",
            timeout.as_secs()
        ),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("yt-dlp exited with {}: {}", output.status, stderr.trim());
    }

    Ok(output)
}
