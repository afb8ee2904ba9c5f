//! HTTP surface: page, analysis endpoints, CSV export.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use moodcam_core::imaging;
use moodcam_core::messages::MessageCatalog;
use moodcam_core::types::{Detection, EmotionCounts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{EngineError, EngineHandle};
use crate::error::ApiError;
use crate::session::SessionStore;

// --- Named constants ---

const SESSION_COOKIE: &str = "moodcam_session";
const UPLOAD_FIELD: &str = "file";
const CSV_FILENAME: &str = "emotion_log.csv";

const INDEX_HTML: &str = include_str!("../assets/index.html");
const SCRIPT_JS: &str = include_str!("../assets/script.js");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub sessions: Arc<SessionStore>,
    pub catalog: Arc<MessageCatalog>,
    pub http: reqwest::Client,
    pub max_fetch_bytes: usize,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/predict", post(analyze))
        .route("/analyze_image", post(analyze))
        .route("/download_csv", get(download_csv))
        .route("/static/script.js", get(client_script))
        .route("/healthz", get(healthz))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Read the session id from the cookie, minting one (and a Set-Cookie)
/// when absent or unparseable.
fn ensure_session(jar: CookieJar) -> (CookieJar, Uuid) {
    if let Some(id) = session_from_jar(&jar) {
        return (jar, id);
    }
    let id = Uuid::new_v4();
    let cookie = Cookie::build((SESSION_COOKIE, id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();
    (jar.add(cookie), id)
}

pub(crate) fn session_from_jar(jar: &CookieJar) -> Option<Uuid> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

/// Serve the page. Loading it starts the session over, so a refresh
/// always begins with empty counters and an empty log.
async fn index(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    let (jar, session) = ensure_session(jar);
    state.sessions.reset(session);
    (jar, Html(INDEX_HTML))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn client_script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

/// What the analysis endpoints reply with, and what each WebSocket
/// response embeds.
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    /// Annotated frame as a JPEG data URL.
    pub image: String,
    pub message: String,
    pub counts: EmotionCounts,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
struct AnalyzePayload {
    image: Option<String>,
    url: Option<String>,
}

/// One handler behind both `/predict` and `/analyze_image`. Accepts a
/// multipart upload, a JSON data URL, or a JSON remote URL.
async fn analyze(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
) -> Result<Response, ApiError> {
    let (jar, session) = ensure_session(jar);

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let bytes = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::Status(e.status(), e.body_text()))?;
        read_upload(multipart).await?
    } else {
        // Keep the extractor's own status (413 for an over-limit body)
        // instead of flattening everything to 400.
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| ApiError::Status(e.status(), e.body_text()))?;
        decode_json_payload(&state, &body).await?
    };

    let response = run_analysis(&state, session, bytes).await?;
    Ok((jar, Json(response)).into_response())
}

/// Engine round trip plus session bookkeeping, shared with the
/// WebSocket handler. Counts are read back after recording so the
/// response reflects the frame it carries.
pub(crate) async fn run_analysis(
    state: &AppState,
    session: Uuid,
    bytes: Vec<u8>,
) -> Result<AnalyzeResponse, EngineError> {
    let analysis = state.engine.analyze(bytes).await?;
    state.sessions.record(session, &analysis.detections);
    let message = state.catalog.for_detections(&analysis.detections).to_owned();
    let counts = state.sessions.counts(session);
    Ok(AnalyzeResponse {
        image: imaging::to_data_url(&analysis.jpeg),
        message,
        counts,
        detections: analysis.detections,
    })
}

async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Status(e.status(), e.body_text()))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::Status(e.status(), e.body_text()))?;
            if bytes.is_empty() {
                return Err(ApiError::bad_request("uploaded file is empty"));
            }
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::bad_request(format!(
        "multipart body is missing a \"{UPLOAD_FIELD}\" field"
    )))
}

async fn decode_json_payload(state: &AppState, body: &[u8]) -> Result<Vec<u8>, ApiError> {
    let payload: AnalyzePayload = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))?;

    if let Some(data_url) = payload.image {
        return imaging::from_data_url(&data_url).map_err(|e| ApiError::bad_request(e.to_string()));
    }
    if let Some(url) = payload.url {
        return fetch_remote(state, &url).await;
    }
    Err(ApiError::bad_request(
        "body must contain \"image\" or \"url\"",
    ))
}

/// Download a remote image on the client's behalf. Anything that goes
/// wrong here (bad URL, upstream failure, oversize body) is the
/// client's problem, so it all maps to 400.
async fn fetch_remote(state: &AppState, url: &str) -> Result<Vec<u8>, ApiError> {
    let mut response = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::bad_request(format!("could not fetch {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::bad_request(format!(
            "could not fetch {url}: upstream returned {status}"
        )));
    }

    if let Some(length) = response.content_length() {
        if length > state.max_fetch_bytes as u64 {
            return Err(ApiError::bad_request(format!(
                "remote image is {length} bytes, over the {} byte limit",
                state.max_fetch_bytes
            )));
        }
    }

    // A chunked upstream advertises no length, so the cap has to be
    // enforced while streaming; the buffer never grows past it.
    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ApiError::bad_request(format!("could not read {url}: {e}")))?
    {
        if bytes.len() + chunk.len() > state.max_fetch_bytes {
            return Err(ApiError::bad_request(format!(
                "remote image exceeds the {} byte limit",
                state.max_fetch_bytes
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// CSV export of the session's detection log. Without a session cookie
/// there is no history, so the file carries only the header row.
async fn download_csv(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let session = session_from_jar(&jar).unwrap_or_else(Uuid::nil);
    let csv = state
        .sessions
        .export_csv(session)
        .map_err(|e| ApiError::internal(format!("could not render CSV: {e}")))?;

    let disposition = format!("attachment; filename=\"{CSV_FILENAME}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}
