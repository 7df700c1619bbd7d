#![forbid(unsafe_code)]

//! Axum backend for tokgrab.
//!
//! Accepts TikTok download requests, drives each one through an in-memory
//! job lifecycle (pending -> processing -> completed | failed), and serves
//! the finished file exactly once before forgetting the job. The extraction
//! work itself happens against a third-party API behind the
//! [`MediaResolver`] seam; this binary only orchestrates.

use std::{
    fs, io,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokgrab_tools::config::{ConfigOverrides, resolve_runtime_config};
use tokgrab_tools::extract::{MediaResolver, RapidApiResolver, is_tiktok_url};
use tokgrab_tools::jobs::{
    JobStatus, JobStore, JobUpdate, MediaFormat, format_duration, format_file_size,
};
use tokgrab_tools::security::ensure_not_root;
use tokio::{
    fs::File,
    io::{AsyncRead, ReadBuf},
    signal,
};
use tokio_util::io::ReaderStream;

const DOWNLOADS_SUBDIR: &str = "downloads";
const DEFAULT_TITLE: &str = "TikTok Video";
const DEFAULT_AUTHOR: &str = "Unknown";
const DEFAULT_FILENAME_STEM: &str = "tiktok_video";

#[derive(Debug, Clone)]
struct BackendArgs {
    media_root: PathBuf,
    www_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
    api_host: String,
    api_key: Option<String>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut media_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--media-root=") {
                media_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--media-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--media-root requires a value"))?;
                    media_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let config = resolve_runtime_config(ConfigOverrides {
            media_root: media_root_override,
            www_root: www_root_override,
            port: port_override,
            host: host_override.map(|host| host.to_string()),
            ..ConfigOverrides::default()
        })?;

        Ok(Self {
            media_root: config.media_root,
            www_root: config.www_root,
            port: config.port,
            listen_host: parse_host_arg(&config.host)?,
            api_host: config.api_host,
            api_key: config.api_key,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TOKGRAB_HOST")
}

/// Shared state injected into every handler.
///
/// * `store` is the single source of truth for job state.
/// * `resolver` is the opaque extraction capability.
/// * `downloads_dir` receives one file per job, named `<id>.<ext>`.
#[derive(Clone)]
struct AppState {
    store: Arc<JobStore>,
    resolver: Arc<dyn MediaResolver>,
    downloads_dir: Arc<PathBuf>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
    format: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStarted {
    success: bool,
    download_id: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    success: bool,
    download: DownloadInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadInfo {
    id: u64,
    status: JobStatus,
    title: Option<String>,
    author: Option<String>,
    duration: Option<String>,
    file_size: Option<String>,
    format: MediaFormat,
}

#[derive(Deserialize)]
struct ValidateRequest {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse {
    success: bool,
    title: Option<String>,
    author: Option<String>,
    duration: Option<String>,
    thumbnail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let api_key = args
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("TOKGRAB_API_KEY not set; the backend cannot resolve videos"))?;

    let downloads_dir = args.media_root.join(DOWNLOADS_SUBDIR);
    fs::create_dir_all(&downloads_dir)
        .with_context(|| format!("creating {}", downloads_dir.display()))?;

    // Jobs do not survive a restart, so files left over from a previous
    // process can never be delivered again. Sweep them out.
    match sweep_downloads_dir(&downloads_dir) {
        Ok(0) => {}
        Ok(removed) => println!("Removed {removed} stale download file(s)"),
        Err(err) => eprintln!("Warning: could not sweep downloads dir: {err:#}"),
    }

    let resolver = RapidApiResolver::new(args.api_host.clone(), api_key);
    let state = AppState {
        store: Arc::new(JobStore::new()),
        resolver: Arc::new(resolver),
        downloads_dir: Arc::new(downloads_dir),
        www_root: Arc::new(args.www_root.clone()),
    };

    let app = router(state);

    let addr = SocketAddr::new(args.listen_host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("tokgrab backend listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/download", post(start_download))
        .route("/api/download/{id}/status", get(get_download_status))
        .route("/api/download/{id}/file", get(deliver_download))
        .route("/api/validate", post(validate_url))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Failure here only affects graceful shutdown; Ctrl+C still terminates
    // the process.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn parse_format(value: &str) -> Option<MediaFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "video" => Some(MediaFormat::Video),
        "audio" => Some(MediaFormat::Audio),
        _ => None,
    }
}

fn sink_path(downloads_dir: &Path, job_id: u64, format: MediaFormat) -> PathBuf {
    downloads_dir.join(format!("{job_id}.{}", format.extension()))
}

/// Validates the request, creates the pending job, and detaches the pipeline.
/// The response never waits for any extraction work.
async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadStarted>> {
    let format = parse_format(&payload.format)
        .ok_or_else(|| ApiError::bad_request("format must be \"video\" or \"audio\""))?;
    if !is_tiktok_url(&payload.url) {
        return Err(ApiError::bad_request("not a valid TikTok URL"));
    }

    let job = state.store.create(&payload.url, format);
    tokio::spawn(run_pipeline(state.clone(), job.id));

    Ok(Json(DownloadStarted {
        success: true,
        download_id: job.id,
    }))
}

/// Background pipeline for one job. Every exit path lands the job in a
/// terminal state; a failure also discards whatever partial file exists.
async fn run_pipeline(state: AppState, job_id: u64) {
    if let Err(err) = drive_job(&state, job_id).await {
        eprintln!("download {job_id} failed: {err:#}");
        if let Some(job) = state.store.update(job_id, JobUpdate::status(JobStatus::Failed)) {
            let partial = sink_path(&state.downloads_dir, job_id, job.format);
            if let Err(err) = tokio::fs::remove_file(&partial).await
                && err.kind() != io::ErrorKind::NotFound
            {
                eprintln!("could not remove partial file {}: {err}", partial.display());
            }
        }
    }
}

async fn drive_job(state: &AppState, job_id: u64) -> Result<()> {
    let job = state
        .store
        .get(job_id)
        .context("job removed before processing started")?;
    state
        .store
        .update(job_id, JobUpdate::status(JobStatus::Processing));

    // Both resolver calls are blocking ureq I/O, so they run off the async
    // threads.
    let resolver = state.resolver.clone();
    let url = job.url.clone();
    let format = job.format;
    let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&url, format))
        .await
        .context("resolve task aborted")??;

    let dest = sink_path(&state.downloads_dir, job_id, format);
    let resolver = state.resolver.clone();
    let media_url = resolved.media_url.clone();
    let fetch_dest = dest.clone();
    let bytes = tokio::task::spawn_blocking(move || resolver.fetch(&media_url, &fetch_dest))
        .await
        .context("fetch task aborted")??;

    let metadata = resolved.metadata;
    state.store.update(
        job_id,
        JobUpdate {
            status: Some(JobStatus::Completed),
            title: Some(metadata.title.unwrap_or_else(|| DEFAULT_TITLE.to_string())),
            author: Some(metadata.author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string())),
            duration: Some(format_duration(metadata.duration_seconds.unwrap_or(0))),
            thumbnail: metadata.thumbnail,
            file_size: Some(format_file_size(bytes)),
            file_path: Some(dest),
        },
    );
    Ok(())
}

async fn get_download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Json<StatusResponse>> {
    let job = state
        .store
        .get(id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;

    Ok(Json(StatusResponse {
        success: true,
        download: DownloadInfo {
            id: job.id,
            status: job.status,
            title: job.title,
            author: job.author,
            duration: job.duration,
            file_size: job.file_size,
            format: job.format,
        },
    }))
}

/// Streams the finished file as an attachment. When the last byte has been
/// read the job is dropped from the store and the file deleted, so a repeat
/// request sees 404. Cleanup problems are logged, never surfaced; the caller
/// already has its bytes by then.
async fn deliver_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Response> {
    let job = state
        .store
        .get(id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::not_found("File not found or not ready"));
    }
    let path = job
        .file_path
        .clone()
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;

    let filename = attachment_filename(job.title.as_deref(), job.format);
    let reader = DeliveryReader::new(file, state.store.clone(), id, path);
    let mut response = Body::from_stream(ReaderStream::new(reader)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        job.format
            .content_type()
            .parse()
            .map_err(|_| ApiError::internal("invalid content type"))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{filename}\"")
            .parse()
            .map_err(|_| ApiError::internal("invalid attachment filename"))?,
    );
    Ok(response)
}

async fn validate_url(
    State(state): State<AppState>,
    Json(payload): Json<ValidateRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    if !is_tiktok_url(&payload.url) {
        return Err(ApiError::bad_request("not a valid TikTok URL"));
    }

    let resolver = state.resolver.clone();
    let url = payload.url.clone();
    let metadata = tokio::task::spawn_blocking(move || resolver.preview(&url))
        .await
        .map_err(|_| ApiError::internal("preview task aborted"))?
        .map_err(|err| ApiError::internal(format!("could not fetch video info: {err:#}")))?;

    Ok(Json(PreviewResponse {
        success: true,
        title: metadata.title,
        author: metadata.author,
        duration: metadata.duration_seconds.map(format_duration),
        thumbnail: metadata.thumbnail,
    }))
}

/// Builds the attachment filename from the job title, stripped down to
/// characters that are safe inside a quoted header value.
fn attachment_filename(title: Option<&str>, format: MediaFormat) -> String {
    let stem = title
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(|title| {
            title
                .chars()
                .map(|c| match c {
                    '"' | '\\' | '/' => '_',
                    c if c.is_control() => '_',
                    c => c,
                })
                .collect::<String>()
        })
        .unwrap_or_else(|| DEFAULT_FILENAME_STEM.to_string());
    format!("{stem}.{}", format.extension())
}

/// Wraps the delivered file so the job and its bytes are retired the moment
/// the stream reaches EOF. An aborted client keeps the job around for
/// another attempt.
struct DeliveryReader {
    file: File,
    cleanup: Option<DeliveryCleanup>,
}

struct DeliveryCleanup {
    store: Arc<JobStore>,
    job_id: u64,
    path: PathBuf,
}

impl DeliveryReader {
    fn new(file: File, store: Arc<JobStore>, job_id: u64, path: PathBuf) -> Self {
        Self {
            file,
            cleanup: Some(DeliveryCleanup {
                store,
                job_id,
                path,
            }),
        }
    }
}

impl AsyncRead for DeliveryReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.file).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before
                    && let Some(cleanup) = this.cleanup.take()
                {
                    cleanup.run();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl DeliveryCleanup {
    fn run(self) {
        // The job disappears first so no request can observe it after
        // delivery has completed.
        self.store.delete(self.job_id);
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::remove_file(&self.path).await {
                eprintln!(
                    "could not remove delivered file {}: {err}",
                    self.path.display()
                );
            }
        });
    }
}

/// Clears files left behind by a previous process. Ids never carry across a
/// restart, so nothing in the directory is reachable anymore.
fn sweep_downloads_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_static(root.join("index.html")).await,
        Ok(_) => stream_static(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_static(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// SPA routes have no extension; everything else is a real asset request.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

async fn stream_static(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
