#![forbid(unsafe_code)]

//! Axum router for the subtitle service.
//!
//! `POST /api/subs/` takes a multipart `video` field, stages it in the scratch
//! directory, runs the upload/generate pipeline on a blocking thread and
//! answers `{"subs": ...}`. Everything outside `/api` is the static front end.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::Serialize;
use serde_json::json;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DEFAULT_MAX_UPLOAD_MB};
use crate::pipeline::{PipelineError, SubtitlePipeline};
use crate::scratch::{ScratchDir, StagedUpload};

pub const VIDEO_FIELD: &str = "video";
const MISSING_VIDEO_MESSAGE: &str = "No video uploaded";

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: SubtitlePipeline,
    scratch: Arc<ScratchDir>,
    www_root: Arc<PathBuf>,
}

impl AppState {
    pub fn new(pipeline: SubtitlePipeline, scratch: ScratchDir, www_root: PathBuf) -> Self {
        Self {
            pipeline,
            scratch: Arc::new(scratch),
            www_root: Arc::new(www_root),
        }
    }
}

/// Transport-level settings that shape the router rather than the handlers.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
        }
    }
}

impl HttpOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub fn build_router(state: AppState, options: &HttpOptions) -> Result<Router> {
    let cors = cors_layer(&options.allowed_origins)?;

    let router = Router::new()
        .route("/api/subs", post(create_subtitles))
        .route("/api/subs/", post(create_subtitles))
        .route("/api/health", get(health))
        .fallback(static_fallback)
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .with_state(state);
    let router = match cors {
        Some(cors) => router.layer(cors),
        None => router,
    };
    Ok(router.layer(TraceLayer::new_for_http()))
}

/// Exact-match allow-list. With no origins configured the browser's
/// same-origin policy applies unchanged.
fn cors_layer(origins: &[String]) -> Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }
    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        if origin == "*" {
            bail!("wildcard CORS origins are not supported; list each origin explicitly");
        }
        let value = origin
            .parse::<HeaderValue>()
            .with_context(|| format!("invalid CORS origin `{origin}`"))?;
        allowed.push(value);
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]),
    ))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl ApiError {
    fn missing_video() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: MISSING_VIDEO_MESSAGE.to_string(),
            kind: "missing_video",
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            kind: "not_found",
        }
    }

    fn staging(err: std::io::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("could not stage upload: {err}"),
            kind: "staging",
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            kind: "internal",
        }
    }

    /// Malformed bodies are the client's fault; an oversized body maps to 413.
    fn multipart(err: MultipartError) -> Self {
        let status = err.status();
        Self {
            kind: if status == StatusCode::PAYLOAD_TOO_LARGE {
                "too_large"
            } else {
                "bad_request"
            },
            status,
            message: err.body_text(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, error = %self.message, "request failed");
        } else {
            debug!(kind = self.kind, error = %self.message, "request rejected");
        }
        let body = json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct SubsResponse {
    subs: String,
}

async fn create_subtitles(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<SubsResponse>> {
    let mut multipart = multipart.map_err(|rejection| {
        debug!(%rejection, "request is not multipart");
        ApiError::missing_video()
    })?;
    let staged = receive_video(&state.scratch, &mut multipart)
        .await?
        .ok_or_else(ApiError::missing_video)?;

    let metadata = staged.metadata();
    info!(
        file = %metadata.original_name,
        bytes = metadata.size,
        "received video"
    );

    // The staged file moves into the blocking task and is removed when the
    // task finishes, whatever the outcome.
    let pipeline = state.pipeline.clone();
    let subs = tokio::task::spawn_blocking(move || pipeline.run(&staged))
        .await
        .map_err(|err| ApiError::internal(format!("subtitle task failed: {err}")))??;

    Ok(Json(SubsResponse { subs }))
}

/// Streams the first non-empty `video` file field into a scratch file. Other
/// fields are skipped.
async fn receive_video(
    scratch: &ScratchDir,
    multipart: &mut Multipart,
) -> ApiResult<Option<StagedUpload>> {
    let mut staged: Option<StagedUpload> = None;
    while let Some(mut field) = multipart.next_field().await.map_err(ApiError::multipart)? {
        if staged.is_some() || field.name() != Some(VIDEO_FIELD) {
            continue;
        }
        // An empty file input is still submitted, with a blank filename.
        let Some(file_name) = field
            .file_name()
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
        else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let mut upload = scratch
            .stage(&file_name, content_type.as_deref())
            .map_err(ApiError::staging)?;
        let mut writer = upload.open_writer().map_err(ApiError::staging)?;
        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(ApiError::multipart)? {
            writer.write_all(&chunk).await.map_err(ApiError::staging)?;
            size += chunk.len() as u64;
        }
        writer.flush().await.map_err(ApiError::staging)?;
        upload.set_size(size);
        staged = Some(upload);
    }
    Ok(staged)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
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
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
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

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path).await.map_err(|err| {
        warn!(path = %path.display(), %err, "static file unavailable");
        ApiError::not_found("file not found")
    })?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
