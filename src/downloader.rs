#![forbid(unsafe_code)]

//! Download orchestration.
//!
//! One request, one scratch directory, one yt-dlp run. The scratch directory
//! name is unique across concurrent requests, which is the entire isolation
//! model; no locks exist anywhere in this pipeline. Cleanup is owned by a
//! drop guard so it fires exactly once whether the stream finishes, errors,
//! or the client walks away mid-transfer.

use std::{
    fs,
    path::{Path, PathBuf},
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use chrono::Utc;
use futures::Stream;
use tokio::{fs::File, process::Command};
use tokio_util::{bytes::Bytes, io::ReaderStream};
use tracing::{debug, info, warn};

use crate::{config::ServerConfig, error::DownloadError, resolver, ytdlp};

/// Fixed base name for whatever yt-dlp produces; the tool appends the
/// extension of the container it negotiated.
const OUTPUT_BASE_NAME: &str = "video";

/// Audio downloads are re-encoded to mp3 and capped to bound disk use.
pub const MAX_AUDIO_FILESIZE: &str = "100M";
/// Video downloads are capped at 720p and 500M to bound bandwidth and disk.
pub const MAX_VIDEO_FILESIZE: &str = "500M";
pub const VIDEO_FORMAT_SELECTOR: &str = "bestvideo[height<=720]+bestaudio/best[height<=720]";

const AUDIO_CONTENT_TYPE: &str = "audio/mp3";

/// Same-millisecond tiebreaker for scratch-directory names.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// High-level target of a download request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Unknown or missing values fall back to video.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            Some(ref value) if value == "audio" => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// The slice of server configuration the orchestrator needs.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub temp_root: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub process_timeout: Duration,
}

impl DownloadPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            temp_root: config.temp_root.clone(),
            ytdlp_bin: config.ytdlp_bin.clone(),
            process_timeout: config.process_timeout,
        }
    }
}

/// A per-request scratch directory. Dropping the guard removes the whole
/// tree, best-effort; deletion failures are logged and never replace the
/// request's primary outcome.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(temp_root: &Path) -> std::io::Result<Self> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!("download_{}_{}", Utc::now().timestamp_millis(), seq);
        let path = temp_root.join(name);
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed scratch directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
            }
        }
    }
}

/// Everything the transport boundary needs to deliver a finished download.
#[derive(Debug)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub filename: String,
    pub content_type: String,
    scratch: ScratchDir,
}

impl DownloadResult {
    /// Opens the output file for sequential reading. The returned stream
    /// owns the scratch guard, so the directory disappears when the body is
    /// dropped regardless of how far the transfer got.
    pub async fn into_stream(self) -> Result<DownloadStream, DownloadError> {
        let file = File::open(&self.file_path).await?;
        Ok(DownloadStream {
            inner: ReaderStream::new(file),
            _scratch: self.scratch,
        })
    }
}

pub struct DownloadStream {
    inner: ReaderStream<File>,
    _scratch: ScratchDir,
}

impl Stream for DownloadStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Runs the full download lifecycle: resolve, scratch dir, title fetch,
/// yt-dlp invocation, output discovery, content-type derivation. Every error
/// path drops the scratch guard and therefore cleans up behind itself.
pub async fn download(
    policy: &DownloadPolicy,
    raw_url: &str,
    format_id: &str,
    kind: MediaKind,
) -> Result<DownloadResult, DownloadError> {
    let reference = resolver::resolve(raw_url)?;
    info!(
        video_id = %reference.video_id,
        url = %reference.canonical_url,
        kind = kind.as_str(),
        "starting download"
    );
    if !format_id.is_empty() {
        // Advisory only: the per-kind selection policy below is authoritative.
        debug!(format_id, "ignoring format hint");
    }

    let scratch = ScratchDir::create(&policy.temp_root)?;

    let info = ytdlp::metadata(
        &policy.ytdlp_bin,
        &reference.canonical_url,
        policy.process_timeout,
    )
    .await
    .map_err(|err| DownloadError::MetadataFetch(format!("{err:#}")))?;
    let title = info.display_title().ok_or_else(|| {
        DownloadError::MetadataFetch(format!("no title in metadata for {}", reference.canonical_url))
    })?;
    let safe_title = sanitize_title(title);

    let output_base = scratch.path().join(OUTPUT_BASE_NAME);
    let mut command = Command::new(&policy.ytdlp_bin);
    match kind {
        MediaKind::Audio => {
            command.args([
                "-f",
                "bestaudio",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
                "--max-filesize",
                MAX_AUDIO_FILESIZE,
            ]);
        }
        MediaKind::Video => {
            command.args(["-f", VIDEO_FORMAT_SELECTOR, "--max-filesize", MAX_VIDEO_FILESIZE]);
        }
    }
    command
        .arg("-o")
        .arg(&output_base)
        .arg(&reference.canonical_url);

    ytdlp::run(command, policy.process_timeout)
        .await
        .map_err(|err| DownloadError::ExternalProcess(format!("{err:#}")))?;

    let file_path = first_output_file(scratch.path())?;
    let ext = file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let content_type = content_type_for(kind, &ext);
    let filename = if ext.is_empty() {
        safe_title
    } else {
        format!("{safe_title}.{ext}")
    };
    info!(file = %file_path.display(), content_type, filename, "download complete");

    Ok(DownloadResult {
        file_path,
        filename,
        content_type,
        scratch,
    })
}

/// Picks the output file from the scratch directory: lenient first-entry
/// policy (sorted, so the choice is at least deterministic when yt-dlp
/// leaves extra fragments behind).
fn first_output_file(dir: &Path) -> Result<PathBuf, DownloadError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    debug!(dir = %dir.display(), count = files.len(), "scratch directory listing");
    files.into_iter().next().ok_or(DownloadError::NoOutputProduced)
}

/// Derives the response content type. The audio path always reports mp3
/// because that is what the invocation re-encodes to; the video path maps
/// common containers and falls back to `video/<ext>`.
pub fn content_type_for(kind: MediaKind, ext: &str) -> String {
    match kind {
        MediaKind::Audio => AUDIO_CONTENT_TYPE.to_owned(),
        MediaKind::Video => match ext {
            "mp4" => "video/mp4".to_owned(),
            "webm" => "video/webm".to_owned(),
            "mkv" => "video/x-matroska".to_owned(),
            other => format!("video/{other}"),
        },
    }
}

/// Strips everything that is not alphanumeric, `_`, whitespace, `.`, or `-`,
/// then collapses whitespace runs into single underscores. Idempotent.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_ws = false;
    for c in title.chars() {
        if c.is_whitespace() {
            pending_ws = true;
            continue;
        }
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') {
            if pending_ws {
                out.push('_');
                pending_ws = false;
            }
            out.push(c);
        }
    }
    if pending_ws {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp-stub");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Answers the metadata call with a canned payload and drops an mp4 next
    /// to the `-o` base on the download call, like the real tool does.
    const HAPPY_STUB: &str = r#"case "$*" in
  *--dump-single-json*)
    echo '{"title":"My Video: Part #1!","duration":212.0,"thumbnail":"https://example.test/t.jpg","formats":[]}'
    ;;
  *)
    out=""
    prev=""
    for arg in "$@"; do
      if [ "$prev" = "-o" ]; then out="$arg"; fi
      prev="$arg"
    done
    echo media-bytes > "$out.mp4"
    ;;
esac"#;

    struct TestSetup {
        _stub_dir: TempDir,
        temp_root: TempDir,
        policy: DownloadPolicy,
    }

    fn setup(stub_body: &str) -> TestSetup {
        let stub_dir = tempfile::tempdir().unwrap();
        let temp_root = tempfile::tempdir().unwrap();
        let policy = DownloadPolicy {
            temp_root: temp_root.path().to_path_buf(),
            ytdlp_bin: write_stub(stub_dir.path(), stub_body),
            process_timeout: Duration::from_secs(10),
        };
        TestSetup {
            _stub_dir: stub_dir,
            temp_root,
            policy,
        }
    }

    fn temp_root_entries(setup: &TestSetup) -> usize {
        fs::read_dir(setup.temp_root.path()).unwrap().count()
    }

    const WATCH_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    #[test]
    fn sanitize_strips_and_collapses() {
        assert_eq!(sanitize_title("My Video: Part #1!"), "My_Video_Part_1");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_title("My Video: Part #1!");
        assert_eq!(sanitize_title(&once), once);
    }

    #[test]
    fn sanitize_keeps_dots_hyphens_underscores() {
        assert_eq!(sanitize_title("clip_v2.1 - final"), "clip_v2.1_-_final");
    }

    #[test]
    fn media_kind_parses_audio_and_defaults_to_video() {
        assert_eq!(MediaKind::parse(Some("audio")), MediaKind::Audio);
        assert_eq!(MediaKind::parse(Some("AUDIO ")), MediaKind::Audio);
        assert_eq!(MediaKind::parse(Some("video")), MediaKind::Video);
        assert_eq!(MediaKind::parse(Some("gibberish")), MediaKind::Video);
        assert_eq!(MediaKind::parse(None), MediaKind::Video);
    }

    #[test]
    fn content_type_maps_video_containers() {
        assert_eq!(content_type_for(MediaKind::Video, "mp4"), "video/mp4");
        assert_eq!(content_type_for(MediaKind::Video, "webm"), "video/webm");
        assert_eq!(content_type_for(MediaKind::Video, "mkv"), "video/x-matroska");
        assert_eq!(content_type_for(MediaKind::Video, "3gp"), "video/3gp");
    }

    #[test]
    fn audio_content_type_ignores_extension() {
        for ext in ["mp3", "m4a", "opus", "mp4"] {
            assert_eq!(content_type_for(MediaKind::Audio, ext), "audio/mp3");
        }
    }

    #[test]
    fn scratch_dirs_have_unique_names() {
        let root = tempfile::tempdir().unwrap();
        let first = ScratchDir::create(root.path()).unwrap();
        let second = ScratchDir::create(root.path()).unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn scratch_drop_removes_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(root.path()).unwrap();
        let path = scratch.path().to_path_buf();
        fs::write(path.join("partial.mp4"), b"half a download").unwrap();
        drop(scratch);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn download_video_end_to_end() {
        let setup = setup(HAPPY_STUB);
        let result = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap();
        assert_eq!(result.filename, "My_Video_Part_1.mp4");
        assert_eq!(result.content_type, "video/mp4");
        assert!(result.file_path.exists());
        assert_eq!(temp_root_entries(&setup), 1);

        drop(result);
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn audio_download_always_reports_mp3() {
        // The stub writes an .mp4 regardless; the audio path must still
        // report audio/mp3.
        let setup = setup(HAPPY_STUB);
        let result = download(&setup.policy, WATCH_URL, "", MediaKind::Audio)
            .await
            .unwrap();
        assert_eq!(result.content_type, "audio/mp3");
        assert_eq!(result.filename, "My_Video_Part_1.mp4");
    }

    #[tokio::test]
    async fn streaming_consumes_file_and_cleans_up() {
        let setup = setup(HAPPY_STUB);
        let result = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap();
        let mut stream = result.into_stream().await.unwrap();

        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(bytes, b"media-bytes\n");

        drop(stream);
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn dropped_stream_mid_transfer_still_cleans_up() {
        // A client disconnect drops the body without draining it.
        let setup = setup(HAPPY_STUB);
        let result = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap();
        let stream = result.into_stream().await.unwrap();
        drop(stream);
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_touching_the_filesystem() {
        let setup = setup(HAPPY_STUB);
        let err = download(
            &setup.policy,
            "https://example.com/notvideo",
            "",
            MediaKind::Video,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn process_failure_surfaces_diagnostics_and_cleans_up() {
        let setup = setup(
            r#"case "$*" in
  *--dump-single-json*)
    echo '{"title":"doomed clip"}'
    ;;
  *)
    echo 'ERROR: This video is unavailable' >&2
    exit 1
    ;;
esac"#,
        );
        let err = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap_err();
        match err {
            DownloadError::ExternalProcess(detail) => {
                assert!(detail.contains("This video is unavailable"));
            }
            other => panic!("expected ExternalProcess, got {other:?}"),
        }
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_an_invariant_violation() {
        let setup = setup(
            r#"case "$*" in
  *--dump-single-json*)
    echo '{"title":"phantom clip"}'
    ;;
  *)
    exit 0
    ;;
esac"#,
        );
        let err = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoOutputProduced));
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn missing_title_is_a_metadata_failure() {
        let setup = setup("echo '{}'");
        let err = download(&setup.policy, WATCH_URL, "", MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::MetadataFetch(_)));
        assert_eq!(temp_root_entries(&setup), 0);
    }

    #[tokio::test]
    async fn concurrent_downloads_use_disjoint_scratch_dirs() {
        let setup = setup(HAPPY_STUB);
        let (a, b) = tokio::join!(
            download(&setup.policy, WATCH_URL, "", MediaKind::Video),
            download(
                &setup.policy,
                "https://youtu.be/abcDEF12345",
                "",
                MediaKind::Video
            ),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a.file_path.parent(), b.file_path.parent());
        assert_eq!(temp_root_entries(&setup), 2);
        drop(a);
        drop(b);
        assert_eq!(temp_root_entries(&setup), 0);
    }
}
