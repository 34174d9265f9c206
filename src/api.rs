//! HTTP API server.
//!
//! Thin axum layer over the segmenter, the speech service and the preview
//! queue. Handlers translate module errors into `{error, code}` JSON bodies
//! with the matching status and, where useful, a `Retry-After` header.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::documents::{DocumentError, DocumentLibrary, DocumentSource};
use crate::preview::{PreviewError, PreviewFetch, PreviewQueue, PreviewState};
use crate::segmenter::{SegmentMode, Segmenter, SegmenterConfig};
use crate::speech::{AudioFormat, CacheStats, SpeechError, SpeechRequest, SpeechService};
use crate::usage::UsageSnapshot;

const USER_HEADER: &str = "x-user-id";
const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub segmenter: SegmenterConfig,
    pub speech: Arc<SpeechService>,
    pub tts: Arc<TtsConfig>,
    pub documents: Arc<DocumentLibrary>,
    pub previews: PreviewQueue,
    pub namespace: String,
}

// --- Errors ---

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<Duration>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    fn retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

/// Non-standard "client closed request".
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Whole seconds, rounded up, never zero.
fn retry_after_secs(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000).max(1) as u64
}

fn retry_after_header(duration: Duration) -> HeaderValue {
    HeaderValue::from(retry_after_secs(duration))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("{} {}: {}", self.status.as_u16(), self.code, self.message);
        } else {
            debug!("{} {}: {}", self.status.as_u16(), self.code, self.message);
        }
        let body = Json(ErrorBody {
            error: &self.message,
            code: self.code,
        });
        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, retry_after_header(retry_after));
        }
        response
    }
}

impl From<SpeechError> for ApiError {
    fn from(e: SpeechError) -> Self {
        let message = e.to_string();
        match e {
            SpeechError::InvalidRequest(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            SpeechError::QuotaExceeded { retry_after, .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", message)
                    .retry_after(Some(retry_after))
            }
            SpeechError::UpstreamRateLimited { retry_after } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "upstream_rate_limited", message)
                    .retry_after(retry_after)
            }
            SpeechError::Upstream { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            SpeechError::Transport(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", message)
            }
            SpeechError::Aborted => Self::new(client_closed_request(), "request_aborted", message),
            SpeechError::Usage(_) => Self::internal(message),
        }
    }
}

impl From<DocumentError> for ApiError {
    fn from(e: DocumentError) -> Self {
        let message = e.to_string();
        match e {
            DocumentError::InvalidId(_) | DocumentError::InvalidNamespace(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_id", message)
            }
            DocumentError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            DocumentError::UnsupportedType(_) => Self::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_type",
                message,
            ),
            DocumentError::Io(_) => Self::internal(message),
        }
    }
}

impl From<PreviewError> for ApiError {
    fn from(e: PreviewError) -> Self {
        match e {
            PreviewError::UnknownVariant(variant) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_variant",
                format!("unknown preview variant: {variant}"),
            ),
            PreviewError::Document(inner) => inner.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

// --- Request/Response types ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: String,
    cache: CacheStats,
    inflight: usize,
}

#[derive(Deserialize)]
struct SegmentBody {
    text: String,
    #[serde(default)]
    mode: Option<SegmentMode>,
    #[serde(default)]
    max_block_chars: Option<usize>,
}

#[derive(Serialize)]
struct SegmentResponse {
    blocks: Vec<String>,
    count: usize,
}

#[derive(Deserialize)]
struct TtsBody {
    text: String,
    #[serde(default)]
    voice: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Deserialize)]
struct PreviewQuery {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    variant: Option<String>,
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/segment", post(handle_segment))
        .route("/tts", post(handle_tts))
        .route("/usage", get(handle_usage))
        .route("/documents/{id}/preview", get(handle_preview))
        .route("/documents/{id}/preview/status", get(handle_preview_status))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn start_api(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Reader speech API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Reader speech API stopped");
    Ok(())
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

// --- Handlers ---

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.speech.provider_name().to_string(),
        cache: state.speech.cache().stats(),
        inflight: state.speech.inflight().len(),
    })
}

async fn handle_segment(
    State(state): State<AppState>,
    Json(body): Json<SegmentBody>,
) -> Json<SegmentResponse> {
    let config = SegmenterConfig {
        max_block_chars: body.max_block_chars.unwrap_or(state.segmenter.max_block_chars),
        mode: body.mode.unwrap_or(state.segmenter.mode),
    };
    let blocks = Segmenter::new(config).segment(&body.text);
    debug!(
        "HTTP /segment: {} chars -> {} blocks",
        body.text.chars().count(),
        blocks.len()
    );
    Json(SegmentResponse {
        count: blocks.len(),
        blocks,
    })
}

async fn handle_tts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TtsBody>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers);
    let format = match body.format.as_deref() {
        Some(raw) => raw
            .parse::<AudioFormat>()
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", e))?,
        None => state.tts.format,
    };
    let request = SpeechRequest {
        provider: state.tts.provider.clone(),
        model: body.model.unwrap_or_else(|| state.tts.model.clone()),
        voice: body.voice.unwrap_or_else(|| state.tts.voice.clone()),
        speed: body.speed.unwrap_or(state.tts.speed),
        format,
        text: body.text,
        instructions: body.instructions,
    };

    // Never fired: a client disconnect drops this future, which releases the
    // in-flight reference on its own.
    let cancel = CancellationToken::new();
    let output = state.speech.synthesize(&user, request, &cancel).await?;

    let headers = [
        (CONTENT_TYPE, HeaderValue::from_static(output.format.content_type())),
        (
            axum::http::HeaderName::from_static("x-cache"),
            HeaderValue::from_static(if output.cache_hit { "hit" } else { "miss" }),
        ),
        (
            axum::http::HeaderName::from_static("x-cache-key"),
            HeaderValue::from_str(output.key.as_str())
                .map_err(|e| ApiError::internal(e.to_string()))?,
        ),
    ];
    Ok((headers, output.audio).into_response())
}

async fn handle_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let Some(ledger) = state.speech.usage().cloned() else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "usage tracking is disabled",
        ));
    };
    let user = user_id(&headers);
    let snapshot = tokio::task::spawn_blocking(move || ledger.usage(&user, Utc::now()))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(snapshot))
}

fn pending_response(state: &PreviewState) -> Response {
    let retry_after = state.retry_after();
    let status = match state {
        PreviewState::Failed { terminal: true, .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::ACCEPTED,
    };
    let mut response = (status, Json(state)).into_response();
    if let Some(retry_after) = retry_after {
        response
            .headers_mut()
            .insert(RETRY_AFTER, retry_after_header(retry_after));
    }
    response
}

async fn resolve_preview_source(
    state: &AppState,
    id: String,
    query: PreviewQuery,
) -> Result<(DocumentSource, String), ApiError> {
    let namespace = query.namespace.unwrap_or_else(|| state.namespace.clone());
    let variant = query
        .variant
        .unwrap_or_else(|| state.previews.default_variant().to_string());
    let documents = Arc::clone(&state.documents);
    let source = tokio::task::spawn_blocking(move || documents.resolve(&namespace, &id))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok((source, variant))
}

async fn handle_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response, ApiError> {
    let (source, variant) = resolve_preview_source(&state, id, query).await?;
    match state.previews.fetch(&source, &variant).await? {
        PreviewFetch::Image { bytes, meta } => {
            let mut response = bytes.into_response();
            let headers = response.headers_mut();
            if let Ok(content_type) = HeaderValue::from_str(&meta.content_type) {
                headers.insert(CONTENT_TYPE, content_type);
            }
            if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
                headers.insert(ETAG, etag);
            }
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=300"));
            Ok(response)
        }
        PreviewFetch::Pending(pending) => Ok(pending_response(&pending)),
    }
}

async fn handle_preview_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response, ApiError> {
    let (source, variant) = resolve_preview_source(&state, id, query).await?;
    let preview = state.previews.request(&source, &variant).await?;
    Ok(match preview {
        PreviewState::Ready(_) => Json(&preview).into_response(),
        pending => pending_response(&pending),
    })
}
