#![forbid(unsafe_code)]

//! URL validation and normalization.
//!
//! Every accepted input shape collapses to the single canonical
//! `watch?v=<id>` form, because yt-dlp is only ever invoked against that
//! form; feeding it the original shapes produced inconsistent extractions.

use crate::error::DownloadError;

/// Markers whose trailing text carries a standard 11-character video id.
const WATCH_MARKERS: [&str; 4] = [
    "youtube.com/watch?v=",
    "youtu.be/",
    "youtube.com/embed/",
    "youtube.com/v/",
];
const SHORTS_MARKER: &str = "youtube.com/shorts/";

const VIDEO_ID_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReference {
    pub video_id: String,
    pub canonical_url: String,
}

impl VideoReference {
    fn for_id(video_id: String) -> Self {
        let canonical_url = format!("https://www.youtube.com/watch?v={video_id}");
        Self {
            video_id,
            canonical_url,
        }
    }
}

/// Validates a raw URL and extracts its video id. First matching shape wins:
/// Shorts paths are checked before the standard watch/short-link/embed
/// shapes because a Shorts id is delimited by the path rather than a fixed
/// length.
pub fn resolve(raw_url: &str) -> Result<VideoReference, DownloadError> {
    if raw_url.contains(SHORTS_MARKER) {
        return resolve_shorts(raw_url);
    }

    if WATCH_MARKERS.iter().any(|marker| raw_url.contains(marker)) {
        return resolve_watch(raw_url);
    }

    Err(DownloadError::InvalidUrl(raw_url.to_owned()))
}

fn resolve_shorts(raw_url: &str) -> Result<VideoReference, DownloadError> {
    let rest = raw_url
        .split_once(SHORTS_MARKER)
        .map(|(_, rest)| rest)
        .unwrap_or("");

    let id: String = rest
        .chars()
        .take_while(|c| !matches!(c, '/' | '?' | '&' | '#'))
        .collect();

    if id.is_empty() {
        return Err(DownloadError::InvalidUrl(raw_url.to_owned()));
    }

    Ok(VideoReference::for_id(id))
}

fn resolve_watch(raw_url: &str) -> Result<VideoReference, DownloadError> {
    for marker in WATCH_MARKERS {
        let Some(index) = raw_url.find(marker) else {
            continue;
        };
        let rest = &raw_url[index + marker.len()..];

        // Permissive capture: the id runs until a URL delimiter, and must be
        // exactly eleven characters long. Anything shorter is rejected
        // outright instead of yielding a truncated id.
        let id: String = rest
            .chars()
            .take_while(|c| !matches!(c, '"' | '&' | '?' | '/' | '#') && !c.is_whitespace())
            .take(VIDEO_ID_LEN)
            .collect();

        if id.len() == VIDEO_ID_LEN {
            return Ok(VideoReference::for_id(id));
        }
    }

    Err(DownloadError::InvalidUrl(raw_url.to_owned()))
}
