#![forbid(unsafe_code)]

//! Failure taxonomy for the download pipeline.
//!
//! Every failure a request can hit maps onto one of these variants, and each
//! variant knows which HTTP status it should surface as. Malformed input is
//! the caller's fault (400); everything else is ours or yt-dlp's (500).

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The input did not match any recognized YouTube URL shape.
    #[error("invalid YouTube URL: {0}")]
    InvalidUrl(String),

    /// yt-dlp could not retrieve metadata, or the payload carried no title.
    #[error("failed to fetch video metadata: {0}")]
    MetadataFetch(String),

    /// yt-dlp exited non-zero, failed to launch, or exceeded the time budget.
    #[error("extraction process failed: {0}")]
    ExternalProcess(String),

    /// yt-dlp exited cleanly but left nothing in the scratch directory.
    /// An invariant violation on our side, never a user error.
    #[error("extraction process produced no output file")]
    NoOutputProduced,

    /// Scratch-directory or file-handle trouble outside the subprocess.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DownloadError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            DownloadError::MetadataFetch(_)
            | DownloadError::ExternalProcess(_)
            | DownloadError::NoOutputProduced
            | DownloadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
