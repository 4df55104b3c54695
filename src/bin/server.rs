#![forbid(unsafe_code)]

//! HTTP surface for the download service.
//!
//! Three endpoints under `/videos`: a liveness probe, a metadata lookup, and
//! the download itself. Handlers stay thin; the lifecycle work lives in
//! `tubefetch::downloader` and the responses here only shape its results
//! into HTTP.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tubefetch::config::{ConfigOverrides, resolve_config};
use tubefetch::downloader::{self, DownloadPolicy, MediaKind};
use tubefetch::error::DownloadError;
use tubefetch::security::ensure_not_root;
use tubefetch::ytdlp;

#[derive(Debug, Clone, Default)]
struct ServerArgs {
    overrides: ConfigOverrides,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--temp-root=") {
                overrides.temp_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp-bin=") {
                overrides.ytdlp_bin = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--host" => {
                    let value = args.next().ok_or_else(|| anyhow!("--host requires a value"))?;
                    overrides.host = Some(value);
                }
                "--port" => {
                    let value = args.next().ok_or_else(|| anyhow!("--port requires a value"))?;
                    overrides.port = Some(parse_port_arg(&value)?);
                }
                "--temp-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--temp-root requires a value"))?;
                    overrides.temp_root = Some(PathBuf::from(value));
                }
                "--ytdlp-bin" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--ytdlp-bin requires a value"))?;
                    overrides.ytdlp_bin = Some(PathBuf::from(value));
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self { overrides })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

#[derive(Clone)]
struct AppState {
    policy: Arc<DownloadPolicy>,
}

#[derive(Debug, Deserialize)]
struct InfoParams {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: Option<String>,
    format: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    ensure_not_root("server")?;

    let ServerArgs { overrides } = ServerArgs::parse()?;
    let config = resolve_config(overrides)?;

    std::fs::create_dir_all(&config.temp_root)
        .with_context(|| format!("creating temp root {}", config.temp_root.display()))?;

    ytdlp::ensure_available(&config.ytdlp_bin)
        .await
        .with_context(|| format!("probing {}", config.ytdlp_bin.display()))?;

    let state = AppState {
        policy: Arc::new(DownloadPolicy::from_config(&config)),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "download service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running download service")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/videos/health", get(get_health))
        .route("/videos/info", get(get_info))
        .route("/videos/download", get(get_download))
        .with_state(state)
}

async fn shutdown_signal() {
    // Failure here only costs graceful shutdown; the process still dies on
    // the signal itself.
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn get_health() -> Json<serde_json::Value> {
    Json(json!({ "message": "OK" }))
}

/// Metadata lookup. The URL is handed to yt-dlp as-is; any resolver-style
/// validation happens implicitly when the tool rejects it. Failures come
/// back as a 500 with the diagnostic chain attached.
async fn get_info(State(state): State<AppState>, Query(params): Query<InfoParams>) -> Response {
    let url = params.url.unwrap_or_default();
    info!(%url, "info request");

    match ytdlp::metadata(&state.policy.ytdlp_bin, &url, state.policy.process_timeout).await {
        Ok(info) => Json(ytdlp::summarize(&info)).into_response(),
        Err(err) => {
            error!(%url, error = format!("{err:#}"), "info request failed");
            let body = json!({
                "message": "Failed to fetch video info",
                "error": err.to_string(),
                "details": format!("{err:#}"),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn get_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Response {
    let url = params.url.unwrap_or_default();
    let format_id = params.format.unwrap_or_default();
    let kind = MediaKind::parse(params.media_type.as_deref());
    info!(%url, format_id, kind = kind.as_str(), "download request");

    let result = match downloader::download(&state.policy, &url, &format_id, kind).await {
        Ok(result) => result,
        Err(err) => return download_error_response(&url, err),
    };

    let filename = result.filename.clone();
    let content_type = result.content_type.clone();
    let stream = match result.into_stream().await {
        Ok(stream) => stream,
        Err(err) => return download_error_response(&url, err),
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }

    (headers, Body::from_stream(stream)).into_response()
}

/// Failure shape for the download endpoint: `{statusCode, message}` with the
/// status derived from the error class. Invalid URLs are the caller's
/// mistake; everything else is ours.
fn download_error_response(url: &str, err: DownloadError) -> Response {
    let status = err.status_code();
    error!(%url, status = status.as_u16(), error = %err, "download request failed");
    let body = json!({
        "statusCode": status.as_u16(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}
