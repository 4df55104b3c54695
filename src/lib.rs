#![forbid(unsafe_code)]

//! Shared library for the tubefetch server: URL resolution, yt-dlp process
//! plumbing, and the download orchestration that ties them together.

pub mod config;
pub mod downloader;
pub mod error;
pub mod resolver;
pub mod security;
pub mod ytdlp;
