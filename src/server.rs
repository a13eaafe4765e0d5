//! HTTP API.
//!
//! Tenant-owned routes require an `X-Tenant-ID` header (uuid or slug). The
//! header is resolved into a [`TenantContext`] by the [`TenantScope`]
//! extractor before any handler runs, so an unknown or inactive tenant is
//! rejected up front.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and version |
//! | `GET` | `/ready` | Database reachable, queue depths |
//! | `POST` | `/api/v1/tenants` | Create a tenant |
//! | `GET` | `/api/v1/tenants` | List tenants |
//! | `GET` | `/api/v1/tenants/{id}` | Get a tenant |
//! | `PATCH` | `/api/v1/tenants/{id}` | Update name, limits, chunking |
//! | `PATCH` | `/api/v1/tenants/{id}/status` | Set status |
//! | `POST` | `/api/v1/documents?filename=` | Upload (raw body) |
//! | `GET` | `/api/v1/documents` | List (`limit`, `offset`) |
//! | `GET` | `/api/v1/documents/stats` | Tenant document stats |
//! | `GET` | `/api/v1/documents/{id}` | Get a document |
//! | `GET` | `/api/v1/documents/{id}/chunks` | A document's chunks |
//! | `DELETE` | `/api/v1/documents/{id}` | Delete a document |
//! | `POST` | `/api/v1/search` | Retrieval only |
//! | `POST` | `/api/v1/query` | Retrieval plus generation |
//! | `DELETE` | `/api/v1/cache` | Clear the tenant's response cache |
//! | `GET` | `/api/v1/conversations/{id}` | A conversation's exchanges |
//! | `DELETE` | `/api/v1/conversations/{id}` | Forget a conversation |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found: ...", "request_id": "..." } }
//! ```
//!
//! `bad_request` (400), `tenant_inactive` (403), `not_found` (404),
//! `limit_exceeded` (413), `upstream_error` (502), `processing_failed` and
//! `internal` (500), `unavailable` (503).
//!
//! `request_id` is the failed query's own id for `processing_failed`, and a
//! fresh id otherwise; either way it appears in the log line for the error.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::conversation::Conversation;
use crate::db;
use crate::documents::{self, DocumentStats, Upload};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::RagError;
use crate::ingest::DocumentWorker;
use crate::llm::{create_generator, GenerationProvider};
use crate::migrate;
use crate::models::{Document, DocumentChunk};
use crate::queue::{
    MessageQueue, QueueDepth, SqliteQueue, TOPIC_CHUNK_EMBEDDING, TOPIC_DOCUMENT_PROCESSING,
};
use crate::rag::{RagQueryRequest, RagQueryResponse, RagService};
use crate::search::{ScoredChunk, SearchRequest};
use crate::tenant::{self, NewTenant, Tenant, TenantContext, TenantPatch, TenantStatus};
use crate::worker::EmbeddingWorker;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
const DEFAULT_USER_EMAIL: &str = "system@local";

/// Shared handler state. Everything inside is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
    queue: Arc<SqliteQueue>,
    embedder: Arc<dyn EmbeddingProvider>,
    rag: RagService,
}

impl AppState {
    /// Build state from configured providers.
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let generator = create_generator(&config.llm)?;
        Ok(Self::with_providers(pool, config, embedder, generator))
    }

    pub fn with_providers(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let queue = Arc::new(SqliteQueue::new(pool.clone(), config.queue.clone()));
        let rag = RagService::new(pool.clone(), config.clone(), embedder.clone(), generator);
        Self {
            pool,
            config,
            queue,
            embedder,
            rag,
        }
    }
}

/// All routes, with CORS and a body limit just above the upload cap.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Leave room over the file cap so oversize uploads reach the size check.
    let body_limit = usize::try_from(state.config.storage.max_file_size_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route(
            "/api/v1/tenants",
            post(handle_create_tenant).get(handle_list_tenants),
        )
        .route(
            "/api/v1/tenants/{id}",
            get(handle_get_tenant).patch(handle_update_tenant),
        )
        .route("/api/v1/tenants/{id}/status", patch(handle_set_status))
        .route(
            "/api/v1/documents",
            post(handle_upload).get(handle_list_documents),
        )
        .route("/api/v1/documents/stats", get(handle_document_stats))
        .route(
            "/api/v1/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/api/v1/documents/{id}/chunks", get(handle_list_chunks))
        .route("/api/v1/search", post(handle_search))
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/cache", axum::routing::delete(handle_clear_cache))
        .route(
            "/api/v1/conversations/{id}",
            get(handle_get_conversation).delete(handle_delete_conversation),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Connect, migrate, and serve on `[server].bind` until SIGINT/SIGTERM.
///
/// With `[queue].run_workers_in_server`, the document and embedding
/// workers run in the same process and are drained on shutdown.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let config = Arc::new(config.clone());
    let state = AppState::new(pool, config.clone())?;

    let listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "HTTP server listening");
    println!("RAG server listening on http://{}", config.server.bind);

    serve(listener, state, shutdown_signal()).await
}

/// Serve `state` on an already-bound listener until `shutdown` resolves.
pub async fn serve<S>(listener: TcpListener, state: AppState, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = tokio::task::JoinSet::new();

    if state.config.queue.run_workers_in_server {
        let queue: Arc<dyn MessageQueue> = state.queue.clone();
        let documents = DocumentWorker::new(state.pool.clone(), state.config.clone(), queue.clone());
        let embeddings = EmbeddingWorker::new(
            state.pool.clone(),
            state.config.clone(),
            queue,
            state.embedder.clone(),
        );
        let rx = stop_rx.clone();
        workers.spawn(async move { documents.run(rx).await });
        if state.embedder.dims() > 0 {
            let rx = stop_rx.clone();
            workers.spawn(async move { embeddings.run(rx).await });
        } else {
            tracing::warn!("embeddings disabled; embedding worker not started");
        }
    }
    drop(stop_rx);

    let app = router(state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = stop_tx.send(true);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "worker task failed");
        }
    }
    tracing::info!("server stopped");
    served.map_err(Into::into)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    request_id: String,
}

/// An error response. `request_id` is the failed operation's own id when it
/// has one, otherwise a fresh id that is logged next to the error.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    request_id: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::NotFound { .. } => StatusCode::NOT_FOUND,
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::TenantInactive(_) => StatusCode::FORBIDDEN,
            RagError::LimitExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RagError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let request_id = err
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if status.is_server_error() {
            tracing::error!(request_id = %request_id, code = err.code(), error = %err, "request failed");
        }
        // Storage and IO details stay in the logs.
        let message = match err.code() {
            "internal" => "internal error".to_string(),
            _ => err.to_string(),
        };
        AppError {
            status,
            code: err.code(),
            message,
            request_id,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if !self.status.is_server_error() {
            tracing::info!(
                request_id = %self.request_id,
                status = self.status.as_u16(),
                code = self.code,
                message = %self.message,
                "request rejected"
            );
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                request_id: self.request_id,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Tenant scope ============

/// The resolved tenant for a request, from `X-Tenant-ID`.
pub struct TenantScope(pub TenantContext);

impl FromRequestParts<AppState> for TenantScope {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let header = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::new(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "missing X-Tenant-ID header",
                )
            })?;
        let ctx = TenantContext::resolve(&state.pool, header, &state.config.chunking).await?;
        Ok(TenantScope(ctx))
    }
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    queues: BTreeMap<&'static str, QueueDepth>,
}

async fn handle_ready(State(state): State<AppState>) -> ApiResult<Json<ReadyResponse>> {
    let unavailable = |e: RagError| {
        let err = AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "database unavailable",
        );
        tracing::warn!(request_id = %err.request_id, error = %e, "readiness check failed");
        err
    };
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(|e| unavailable(e.into()))?;

    let mut queues = BTreeMap::new();
    for topic in [TOPIC_DOCUMENT_PROCESSING, TOPIC_CHUNK_EMBEDDING] {
        let depth = state.queue.depth(topic).await.map_err(unavailable)?;
        queues.insert(topic, depth);
    }
    Ok(Json(ReadyResponse {
        status: "ready",
        queues,
    }))
}

// ============ Tenants ============

async fn handle_create_tenant(
    State(state): State<AppState>,
    Json(new): Json<NewTenant>,
) -> ApiResult<(StatusCode, Json<Tenant>)> {
    let tenant = tenant::create_tenant(&state.pool, &new, &state.config.chunking).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

#[derive(Serialize)]
struct TenantList {
    tenants: Vec<Tenant>,
}

async fn handle_list_tenants(State(state): State<AppState>) -> ApiResult<Json<TenantList>> {
    Ok(Json(TenantList {
        tenants: tenant::list_tenants(&state.pool).await?,
    }))
}

async fn handle_get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Tenant>> {
    Ok(Json(tenant::find_tenant(&state.pool, &id).await?))
}

async fn handle_update_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TenantPatch>,
) -> ApiResult<Json<Tenant>> {
    let tenant = tenant::update_tenant(&state.pool, &id, &patch, &state.config.chunking).await?;
    Ok(Json(tenant))
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

async fn handle_set_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> ApiResult<Json<Tenant>> {
    let status: TenantStatus = body.status.parse().map_err(RagError::Validation)?;
    Ok(Json(tenant::set_status(&state.pool, &id, status).await?))
}

// ============ Documents ============

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
}

async fn handle_upload(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let email = header(USER_EMAIL_HEADER).unwrap_or(DEFAULT_USER_EMAIL);
    let content_type = header("content-type").unwrap_or("");

    let user_id = tenant::ensure_user(&state.pool, &ctx, email).await?;
    let document = documents::upload_document(
        &state.pool,
        &state.config,
        &ctx,
        &user_id,
        Upload {
            original_filename: &params.filename,
            content_type,
            bytes: &body,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<Document>,
    limit: i64,
    offset: i64,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<DocumentList>> {
    let limit = documents::effective_limit(params.limit.unwrap_or(50));
    let offset = params.offset.unwrap_or(0).max(0);
    let documents = documents::list_documents(&state.pool, &ctx, limit, offset).await?;
    Ok(Json(DocumentList {
        documents,
        limit,
        offset,
    }))
}

async fn handle_get_document(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    Ok(Json(documents::get_document(&state.pool, &ctx, &id).await?))
}

#[derive(Serialize)]
struct ChunkList {
    chunks: Vec<DocumentChunk>,
}

async fn handle_list_chunks(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Path(id): Path<String>,
) -> ApiResult<Json<ChunkList>> {
    Ok(Json(ChunkList {
        chunks: documents::list_chunks(&state.pool, &ctx, &id).await?,
    }))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    documents::delete_document(&state.pool, &state.config, &ctx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_document_stats(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
) -> ApiResult<Json<DocumentStats>> {
    Ok(Json(documents::document_stats(&state.pool, &ctx).await?))
}

// ============ Search and query ============

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredChunk>,
}

async fn handle_search(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let results = state.rag.retriever().search(&ctx, &request).await?;
    Ok(Json(SearchResponse { results }))
}

async fn handle_query(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Json(request): Json<RagQueryRequest>,
) -> ApiResult<Json<RagQueryResponse>> {
    Ok(Json(state.rag.query(&ctx, &request).await?))
}

#[derive(Serialize)]
struct ClearedResponse {
    cleared: u64,
}

async fn handle_clear_cache(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
) -> ApiResult<Json<ClearedResponse>> {
    Ok(Json(ClearedResponse {
        cleared: state.rag.invalidate_tenant(&ctx).await?,
    }))
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .rag
        .conversations()
        .get(&ctx, &id)
        .await?
        .ok_or_else(|| RagError::not_found("conversation", id))?;
    Ok(Json(conversation))
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    TenantScope(ctx): TenantScope,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.rag.conversations().delete(&ctx, &id).await? {
        return Err(RagError::not_found("conversation", id).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
