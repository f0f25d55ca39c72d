//! HTTP surface.
//!
//! Exposes the memory service as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Multipart upload: files + `index`, `documentId`, `tags`, `steps` fields |
//! | `GET`  | `/upload-status` | Pipeline status for `?index=&documentId=` |
//! | `DELETE` | `/documents` | Delete one document (`?index=&documentId=`) |
//! | `DELETE` | `/indexes` | Delete a whole index (`?index=`) |
//! | `GET`  | `/indexes` | List known indexes |
//! | `POST` | `/search` | Ranked chunk retrieval |
//! | `POST` | `/ask` | Grounded answer with citations |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/metrics` | Pipeline counter snapshot |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "validation", "message": "upload must contain at least one file" } }
//! ```
//!
//! Error codes: `validation` (400), `not_found` (404), `unavailable`
//! (503), `data_integrity` and `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cancel::CancelToken;
use crate::error::MemoryError;
use crate::metrics::MetricsSnapshot;
use crate::models::{MemoryFilter, TagCollection};
use crate::report::DocumentStatus;
use crate::service::{
    Answer, AskRequest, MemoryService, SearchRequest, UploadFile, UploadReceipt, UploadRequest,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<MemoryService>,
}

/// Build the application router. Split out from [`run_server`] so tests
/// can drive it without binding a socket.
pub fn router(service: Arc<MemoryService>) -> Router {
    let body_limit = service.config().pipeline.max_file_bytes as usize + 1024 * 1024;
    let state = AppState { service };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/upload-status", get(handle_status))
        .route("/documents", delete(handle_delete_document))
        .route("/indexes", get(handle_list_indexes).delete(handle_delete_index))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the cancel token fires.
pub async fn run_server(service: Arc<MemoryService>, cancel: CancelToken) -> anyhow::Result<()> {
    let bind_addr = service.config().service.bind.clone();
    let app = router(service);

    info!(%bind_addr, "memory service listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let shutdown = async move { cancel.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

/// JSON error envelope.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"validation"`, `"not_found"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation".to_string(),
        message: message.into(),
    }
}

impl From<MemoryError> for AppError {
    fn from(e: MemoryError) -> Self {
        let (status, code) = match &e {
            MemoryError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            MemoryError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            MemoryError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            MemoryError::DataIntegrity(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "data_integrity")
            }
            MemoryError::Permanent(_) | MemoryError::Poisoned(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}

// ============ POST /upload ============

/// Handler for `POST /upload`.
///
/// Multipart body: any number of file parts plus optional text fields
/// `index`, `documentId`, `tags` (JSON object: string or string-array
/// values), and `steps` (JSON array or comma-separated). Returns 202
/// with the assigned document id; processing continues asynchronously.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReceipt>), AppError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|s| s.to_string());

        if let Some(file_name) = file_name {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("failed to read file part: {e}")))?;
            request.files.push(UploadFile {
                name: file_name,
                bytes: bytes.to_vec(),
            });
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| bad_request(format!("failed to read field '{field_name}': {e}")))?;
        match field_name.as_str() {
            "index" => request.index = text,
            "documentId" => request.document_id = Some(text),
            "tags" => request.tags = parse_tags(&text)?,
            "steps" => request.steps = Some(parse_steps(&text)),
            _ => {}
        }
    }

    let receipt = state.service.upload(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Tags arrive as a JSON object; values may be a string, a string
/// array, or null (key present with no value).
fn parse_tags(raw: &str) -> Result<TagCollection, AppError> {
    if raw.trim().is_empty() {
        return Ok(TagCollection::new());
    }
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| bad_request(format!("tags must be a JSON object: {e}")))?;

    let mut tags = TagCollection::new();
    for (key, value) in parsed {
        match value {
            serde_json::Value::Null => tags.add_key(key),
            serde_json::Value::String(s) => tags.add(key, s),
            serde_json::Value::Array(values) => {
                for v in values {
                    match v {
                        serde_json::Value::String(s) => tags.add(key.clone(), s),
                        other => tags.add(key.clone(), other.to_string()),
                    }
                }
            }
            other => tags.add(key, other.to_string()),
        }
    }
    Ok(tags)
}

/// Steps arrive as a JSON array or a comma-separated list.
fn parse_steps(raw: &str) -> Vec<String> {
    if let Ok(steps) = serde_json::from_str::<Vec<String>>(raw) {
        return steps;
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ============ GET /upload-status ============

#[derive(Deserialize)]
struct DocumentQuery {
    #[serde(default)]
    index: String,
    #[serde(rename = "documentId")]
    document_id: String,
}

/// Handler for `GET /upload-status`. 404 when the document is unknown.
async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<DocumentStatus>, AppError> {
    let status = state
        .service
        .status(&query.index, &query.document_id)
        .await?;
    Ok(Json(status))
}

// ============ DELETE /documents, DELETE/GET /indexes ============

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

/// Handler for `DELETE /documents`. Idempotent.
async fn handle_delete_document(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<OkResponse>, AppError> {
    state
        .service
        .delete_document(&query.index, &query.document_id)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Deserialize)]
struct IndexQuery {
    #[serde(default)]
    index: String,
}

/// Handler for `DELETE /indexes`: drop every document under an index.
async fn handle_delete_index(
    State(state): State<AppState>,
    Query(query): Query<IndexQuery>,
) -> Result<Json<OkResponse>, AppError> {
    state.service.delete_index(&query.index).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[derive(Serialize)]
struct IndexesResponse {
    indexes: Vec<String>,
}

/// Handler for `GET /indexes`.
async fn handle_list_indexes(
    State(state): State<AppState>,
) -> Result<Json<IndexesResponse>, AppError> {
    let indexes = state.service.list_indexes().await?;
    Ok(Json(IndexesResponse { indexes }))
}

// ============ POST /search ============

/// JSON request body for `POST /search`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    #[serde(default)]
    index: String,
    query: String,
    /// Disjunction of conjunctions: each object's pairs must all match.
    #[serde(default)]
    filters: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    min_relevance: f32,
    /// `< 0` returns all matches; omitted uses the configured default.
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    document_id: String,
    file_id: String,
    part_index: usize,
    source_file: String,
    text: String,
    score: f32,
    tags: TagCollection,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

fn to_filters(bodies: Vec<BTreeMap<String, String>>) -> Vec<MemoryFilter> {
    bodies
        .into_iter()
        .map(|pairs| MemoryFilter {
            pairs: pairs.into_iter().collect(),
        })
        .collect()
}

/// Handler for `POST /search`.
async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let hits = state
        .service
        .search(SearchRequest {
            index: body.index,
            query: body.query,
            filters: to_filters(body.filters),
            min_relevance: body.min_relevance,
            limit: body.limit,
        })
        .await?;

    let results = hits
        .into_iter()
        .map(|h| SearchResultItem {
            document_id: h.record.document_id,
            file_id: h.record.file_id,
            part_index: h.record.part_index,
            source_file: h.record.source_file,
            text: h.record.text,
            score: h.score,
            tags: h.record.tags,
        })
        .collect();
    Ok(Json(SearchResponse { results }))
}

// ============ POST /ask ============

/// JSON request body for `POST /ask`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskBody {
    #[serde(default)]
    index: String,
    question: String,
    #[serde(default)]
    filters: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    min_relevance: f32,
}

/// Handler for `POST /ask`.
async fn handle_ask(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Result<Json<Answer>, AppError> {
    let answer = state
        .service
        .ask(AskRequest {
            index: body.index,
            question: body.question,
            filters: to_filters(body.filters),
            min_relevance: body.min_relevance,
        })
        .await?;
    Ok(Json(answer))
}

// ============ GET /health, GET /metrics ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Handler for `GET /health`. Used by load balancers and monitoring.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handler for `GET /metrics`.
async fn handle_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.service.metrics().snapshot())
}
