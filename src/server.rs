//! HTTP API.
//!
//! Exposes ingestion, chat and billing over a JSON HTTP API. Every route
//! except `/health` and the billing webhook requires an
//! `Authorization: Bearer <token>` header (see [`crate::session`]).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/message` | Send a chat message; answer streams back as `text/plain` |
//! | `POST` | `/api/uploads/complete` | Upload-complete event for a storage key; runs ingestion |
//! | `GET`  | `/api/documents` | Caller's documents, newest first |
//! | `GET`  | `/api/documents/{id}` | One document (status polling) |
//! | `DELETE` | `/api/documents/{id}` | Remove a document, its passages and messages |
//! | `POST` | `/api/documents/{id}/retry` | Re-run ingestion for a failed document |
//! | `GET`  | `/api/documents/{id}/messages` | Conversation page, newest first |
//! | `POST` | `/api/webhooks/billing` | Signed billing events |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found" } }
//! ```
//!
//! Status codes: `unauthorized` (401), `not_found` (404), `bad_request` (400),
//! `quota_exceeded` (403), `fetch_error` / `empty_content` (422),
//! `index_error` / `generation_error` (502), `internal` (500).
//!
//! Once the chat answer has started streaming the status is already 200; a
//! later failure aborts the response body instead.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::billing::{BillingError, BillingOutcome, BillingService, SIGNATURE_HEADER};
use crate::chat::{ChatService, ChatSettings, MessagePage};
use crate::config::Config;
use crate::embedding::create_provider;
use crate::error::{ChatError, ErrorKind, IngestError};
use crate::fetch::{StorageFetcher, StorageLocator};
use crate::generation::create_generator;
use crate::index::sqlite::SqliteIndex;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::models::{Document, Identity, UploadEvent};
use crate::session::{SessionError, SessionKeys};
use crate::store::sqlite::SqliteStore;
use crate::{db, migrate};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    ingestor: Arc<Ingestor>,
    chat: Arc<ChatService>,
    billing: Arc<BillingService>,
    sessions: SessionKeys,
    storage: StorageLocator,
}

impl AppState {
    /// `storage` turns upload storage keys into the addresses ingestion
    /// fetches from.
    pub fn new(
        ingestor: Arc<Ingestor>,
        chat: Arc<ChatService>,
        billing: Arc<BillingService>,
        sessions: SessionKeys,
        storage: StorageLocator,
    ) -> Self {
        Self {
            ingestor,
            chat,
            billing,
            sessions,
            storage,
        }
    }

    /// Wire the SQLite stores and the configured providers together.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let index = Arc::new(SqliteIndex::new(pool));
        let embedder = create_provider(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let storage = StorageLocator::new(&config.ingest.storage_base_url);
        let fetcher =
            Arc::new(StorageFetcher::new(config.ingest.fetch_timeout_secs)?.scoped(&storage));

        let ingestor = Ingestor::new(
            store.clone(),
            store.clone(),
            index.clone(),
            embedder.clone(),
            fetcher,
        )
        .with_plans(config.plans.table())
        .with_batch_size(config.embedding.batch_size);

        let chat = ChatService::new(store.clone(), store.clone(), index, embedder, generator)
            .with_settings(ChatSettings::from_config(config));

        let billing = BillingService::new(store, config.server.webhook_secret.clone());

        Ok(Self::new(
            Arc::new(ingestor),
            Arc::new(chat),
            Arc::new(billing),
            SessionKeys::new(&config.server.session_secret),
            storage,
        ))
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AppError> {
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.sessions.authenticate(header).map_err(AppError::from)
    }
}

/// Build the router with all routes, CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/message", post(handle_message))
        .route("/api/uploads/complete", post(handle_upload_complete))
        .route("/api/documents", get(handle_list_documents))
        .route(
            "/api/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/api/documents/{id}/retry", post(handle_retry_document))
        .route("/api/documents/{id}/messages", get(handle_list_messages))
        .route("/api/webhooks/billing", post(handle_billing_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` with state built from `config`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    run_server_with_state(&config.server.bind, state).await
}

/// Starts the HTTP server with caller-supplied state.
pub async fn run_server_with_state(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    println!("docchat listening on http://{}", bind_addr);
    tracing::info!(bind = bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            code: kind.code(),
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        Self::new(ErrorKind::Storage, "internal error")
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::QuotaExceeded => StatusCode::FORBIDDEN,
        ErrorKind::Fetch | ErrorKind::EmptyContent => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Index | ErrorKind::Generation | ErrorKind::Read => StatusCode::BAD_GATEWAY,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::new(err.kind(), err.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Storage {
            tracing::error!(error = %err, "ingestion storage failure");
            return AppError::new(kind, "internal error");
        }
        AppError::new(kind, err.to_string())
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let kind = err.kind();
        match kind {
            ErrorKind::NotFound | ErrorKind::BadRequest => AppError::new(kind, err.to_string()),
            _ => {
                tracing::error!(error = %err, "chat turn failed");
                AppError::new(kind, "failed to generate a response")
            }
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Storage {
            tracing::error!(error = %err, "billing storage failure");
            return AppError::new(kind, "internal error");
        }
        tracing::warn!(error = %err, "billing webhook rejected");
        AppError::new(kind, err.to_string())
    }
}

/// Parse a JSON body once the caller is authenticated, so rejections use
/// the error envelope.
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            ErrorKind::BadRequest,
            format!("invalid request body: {}", err),
        )
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/message ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest {
    document_id: String,
    #[serde(alias = "messageText")]
    message: String,
}

/// Streams the answer as raw UTF-8 text. Errors before the first byte are
/// JSON error responses; errors after it abort the body.
async fn handle_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let identity = state.authenticate(&headers)?;
    let req: MessageRequest = parse_json(&body)?;
    let answer = state
        .chat
        .respond(&identity, &req.document_id, &req.message)
        .await?;

    let document_id = req.document_id;
    let body = answer.map(move |item| {
        item.map(Bytes::from).map_err(|err| {
            tracing::error!(document_id = %document_id, error = %err, "answer stream failed");
            std::io::Error::other(err.kind().code())
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

// ============ POST /api/uploads/complete ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadCompleteRequest {
    storage_key: String,
    display_name: String,
}

/// Runs ingestion for the caller. `201` for a new document, `200` when the
/// same storage key was already registered.
///
/// The retrieval address is derived from the storage key; any address in
/// the body is ignored.
async fn handle_upload_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let identity = state.authenticate(&headers)?;
    let req: UploadCompleteRequest = parse_json(&body)?;
    let retrieval_address = state.storage.address(&req.storage_key)?;
    let tier = state
        .billing
        .tier_for(&identity.user_id, Utc::now())
        .await
        .map_err(AppError::internal)?;

    let event = UploadEvent {
        owner_id: identity.user_id,
        storage_key: req.storage_key,
        display_name: req.display_name,
        retrieval_address,
    };

    match state.ingestor.ingest(&event, tier).await? {
        IngestOutcome::Indexed { document, .. } => Ok((StatusCode::CREATED, Json(document))),
        IngestOutcome::AlreadyExists(document) => Ok((StatusCode::OK, Json(document))),
    }
}

// ============ /api/documents ============

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Document>>, AppError> {
    let identity = state.authenticate(&headers)?;
    Ok(Json(state.ingestor.list_documents(&identity).await?))
}

async fn handle_get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let identity = state.authenticate(&headers)?;
    Ok(Json(state.ingestor.find_document(&identity, &id).await?))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let identity = state.authenticate(&headers)?;
    state.ingestor.delete_document(&identity, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_retry_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let identity = state.authenticate(&headers)?;
    let tier = state
        .billing
        .tier_for(&identity.user_id, Utc::now())
        .await
        .map_err(AppError::internal)?;
    let outcome = state.ingestor.retry(&identity, &id, tier).await?;
    Ok((StatusCode::CREATED, Json(outcome.document().clone())))
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagePage>, AppError> {
    let identity = state.authenticate(&headers)?;
    let page = state
        .chat
        .messages(&identity, &id, query.limit, query.cursor.as_deref())
        .await?;
    Ok(Json(page))
}

// ============ POST /api/webhooks/billing ============

#[derive(Serialize)]
struct WebhookResponse {
    received: bool,
    updated: bool,
}

async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state.billing.handle(&body, signature, Utc::now()).await?;
    Ok(Json(WebhookResponse {
        received: true,
        updated: matches!(outcome, BillingOutcome::Updated(_)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::QuotaExceeded), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(ErrorKind::EmptyContent),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorKind::Generation), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn chat_failures_hide_details() {
        let err = AppError::from(ChatError::Generation("upstream said no".into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.message, "failed to generate a response");

        let err = AppError::from(ChatError::NotFound);
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn malformed_bodies_are_bad_requests() {
        let err = parse_json::<MessageRequest>(b"{not json").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");

        let err = parse_json::<UploadCompleteRequest>(br#"{"storageKey":"k"}"#).unwrap_err();
        assert!(err.message.contains("displayName"));
    }

    #[test]
    fn message_request_accepts_both_field_names() {
        let a: MessageRequest =
            serde_json::from_str(r#"{"documentId":"d1","message":"hi"}"#).unwrap();
        let b: MessageRequest =
            serde_json::from_str(r#"{"documentId":"d1","messageText":"hi"}"#).unwrap();
        assert_eq!(a.message, b.message);
    }
}
