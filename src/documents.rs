//! Document storage: upload, lookup, listing, deletion, and stats.
//!
//! An upload writes the file to disk first, then inserts the PENDING row and
//! its `document-processing` event in one transaction. A failed write leaves
//! no row behind; a failed insert removes the written file.
//!
//! Every read here goes through the caller's [`TenantContext`], so a
//! document owned by another tenant is indistinguishable from a missing one.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{RagError, RagResult};
use crate::extract::{detect_document_type, mime_for};
use crate::models::{
    Document, DocumentChunk, DocumentProcessingEvent, ProcessingStatus, CHUNK_COLUMNS,
    DOCUMENT_COLUMNS,
};
use crate::queue::{publish_in_tx, TOPIC_DOCUMENT_PROCESSING};
use crate::tenant::TenantContext;

/// An incoming file before it is stored.
#[derive(Debug, Clone)]
pub struct Upload<'a> {
    pub original_filename: &'a str,
    /// May be empty; the type is then taken from the extension.
    pub content_type: &'a str,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DocumentStats {
    pub total_documents: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub storage_bytes: i64,
    pub total_chunks: i64,
    pub embedded_chunks: i64,
}

fn sanitize_filename(name: &str) -> RagResult<String> {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .unwrap_or("");
    if base.is_empty() {
        return Err(RagError::validation("filename is required"));
    }
    if base.chars().count() > 255 {
        return Err(RagError::validation("filename is too long"));
    }
    Ok(base.to_string())
}

/// Store an uploaded file for `ctx` and queue it for processing.
///
/// The file is written under `[storage].root/{tenant}/`, then the PENDING
/// row and its `document-processing` event are inserted in one
/// transaction.
///
/// # Arguments
///
/// * `uploaded_by` - user id from [`crate::tenant::ensure_user`].
/// * `upload` - original filename, declared content type, and bytes.
///
/// # Errors
///
/// - [`RagError::Validation`] for an empty, oversized, or unsupported file.
/// - [`RagError::LimitExceeded`] when the tenant's document count or
///   storage quota would be exceeded.
/// - [`RagError::Io`] when the file cannot be written; no row is created.
pub async fn upload_document(
    pool: &SqlitePool,
    config: &Config,
    ctx: &TenantContext,
    uploaded_by: &str,
    upload: Upload<'_>,
) -> RagResult<Document> {
    let original_filename = sanitize_filename(upload.original_filename)?;

    if upload.bytes.is_empty() {
        return Err(RagError::validation("file is empty"));
    }
    let size = upload.bytes.len() as u64;
    if size > config.storage.max_file_size_bytes {
        return Err(RagError::validation(format!(
            "file size {} exceeds the maximum of {} bytes",
            size, config.storage.max_file_size_bytes
        )));
    }

    let doc_type = detect_document_type(&original_filename, upload.content_type).ok_or_else(
        || {
            RagError::validation(format!(
                "unsupported file type: {} ({})",
                original_filename,
                if upload.content_type.is_empty() {
                    "no content type"
                } else {
                    upload.content_type
                }
            ))
        },
    )?;

    let doc_count = ctx
        .select("SELECT COUNT(*) FROM documents d", "d")
        .fetch_i64(pool)
        .await?;
    if doc_count >= ctx.max_documents() {
        return Err(RagError::LimitExceeded(format!(
            "tenant has reached its limit of {} documents",
            ctx.max_documents()
        )));
    }

    let used = ctx
        .select("SELECT SUM(d.file_size) FROM documents d", "d")
        .fetch_i64(pool)
        .await?;
    if used.saturating_add(size as i64) > ctx.max_storage_bytes() {
        return Err(RagError::LimitExceeded(format!(
            "upload would exceed the tenant's storage quota ({} of {} bytes used)",
            used,
            ctx.max_storage_bytes()
        )));
    }

    let id = Uuid::new_v4().to_string();
    let stored_name = format!("{}.{}", id, doc_type.extension());
    let dir = config.storage.root.join(ctx.tenant_id());
    let path = dir.join(&stored_name);

    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(&path, upload.bytes).await?;

    let content_type = if upload.content_type.is_empty() {
        mime_for(doc_type).to_string()
    } else {
        upload.content_type.to_string()
    };

    let now = chrono::Utc::now().timestamp();
    let event = DocumentProcessingEvent {
        document_id: id.clone(),
        tenant_id: ctx.tenant_id().to_string(),
        timestamp: now,
    };

    let inserted = async {
        let payload = serde_json::to_string(&event)?;
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, tenant_id, uploaded_by, filename, original_filename,
                                   content_type, file_size, document_type, file_path,
                                   processing_status, chunk_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(ctx.tenant_id())
        .bind(uploaded_by)
        .bind(&stored_name)
        .bind(&original_filename)
        .bind(&content_type)
        .bind(size as i64)
        .bind(doc_type.as_str())
        .bind(path.to_string_lossy().to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        publish_in_tx(&mut tx, TOPIC_DOCUMENT_PROCESSING, &id, &payload).await?;
        tx.commit().await?;
        Ok::<(), RagError>(())
    }
    .await;

    if let Err(e) = inserted {
        if let Err(rm) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %rm, "failed to remove orphaned upload");
        }
        return Err(e);
    }

    tracing::info!(
        tenant_id = %ctx.tenant_id(),
        document_id = %id,
        filename = %original_filename,
        size,
        document_type = %doc_type,
        "document uploaded"
    );
    get_document(pool, ctx, &id).await
}

/// Load one of the tenant's documents, including its extracted text.
///
/// # Errors
///
/// [`RagError::NotFound`] when the id does not exist or belongs to another
/// tenant.
pub async fn get_document(
    pool: &SqlitePool,
    ctx: &TenantContext,
    document_id: &str,
) -> RagResult<Document> {
    let row = ctx
        .select(
            &format!("SELECT {} FROM documents d", DOCUMENT_COLUMNS),
            "d",
        )
        .and_eq("d.id", document_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RagError::not_found("document", document_id))?;
    Ok(Document::from_row(&row)?)
}

/// Largest page [`list_documents`] returns.
pub const MAX_PAGE_SIZE: i64 = 500;

/// The page size [`list_documents`] actually applies for a requested `limit`.
pub fn effective_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

/// Newest first. Extracted text is omitted from listings.
///
/// `limit` is clamped with [`effective_limit`]; a negative `offset` reads as 0.
pub async fn list_documents(
    pool: &SqlitePool,
    ctx: &TenantContext,
    limit: i64,
    offset: i64,
) -> RagResult<Vec<Document>> {
    let rows = ctx
        .select(
            &format!("SELECT {} FROM documents d", DOCUMENT_COLUMNS),
            "d",
        )
        .push("ORDER BY d.created_at DESC, d.id LIMIT ")
        .bind(effective_limit(limit))
        .push("OFFSET ")
        .bind(offset.max(0))
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|r| {
            let mut doc = Document::from_row(r)?;
            doc.extracted_text = None;
            Ok::<_, RagError>(doc)
        })
        .collect()
}

/// A document's chunks in sequence order.
pub async fn list_chunks(
    pool: &SqlitePool,
    ctx: &TenantContext,
    document_id: &str,
) -> RagResult<Vec<DocumentChunk>> {
    let rows = ctx
        .select(
            &format!("SELECT {} FROM document_chunks c", CHUNK_COLUMNS),
            "c",
        )
        .and_eq("c.document_id", document_id.to_string())
        .push("ORDER BY c.sequence_number")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| DocumentChunk::from_row(r).map_err(RagError::from))
        .collect()
}

/// Delete a document with its chunks and vectors, remove the stored file,
/// and drop the tenant's cached answers.
pub async fn delete_document(
    pool: &SqlitePool,
    config: &Config,
    ctx: &TenantContext,
    document_id: &str,
) -> RagResult<()> {
    let doc = get_document(pool, ctx, document_id).await?;

    ctx.delete_from("documents")
        .and_eq("id", doc.id.clone())
        .execute(pool)
        .await?;

    match tokio::fs::remove_file(PathBuf::from(&doc.file_path)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(document_id = %doc.id, error = %e, "stored file could not be removed")
        }
    }

    let responses = ResponseCache::new(
        pool.clone(),
        Duration::from_secs(config.cache.response_ttl_secs),
    );
    responses.clear_tenant(ctx.tenant_id()).await?;

    tracing::info!(tenant_id = %ctx.tenant_id(), document_id = %doc.id, "document deleted");
    Ok(())
}

/// Status counts, stored bytes, and chunk/embedding totals for a tenant.
pub async fn document_stats(pool: &SqlitePool, ctx: &TenantContext) -> RagResult<DocumentStats> {
    let rows = ctx
        .select(
            "SELECT d.processing_status AS status, COUNT(*) AS n, \
             COALESCE(SUM(d.file_size), 0) AS bytes FROM documents d",
            "d",
        )
        .push("GROUP BY d.processing_status")
        .fetch_all(pool)
        .await?;

    let mut stats = DocumentStats::default();
    for row in &rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        let bytes: i64 = row.try_get("bytes")?;
        stats.total_documents += n;
        stats.storage_bytes += bytes;
        match status.parse::<ProcessingStatus>() {
            Ok(ProcessingStatus::Pending) => stats.pending += n,
            Ok(ProcessingStatus::Processing) => stats.processing += n,
            Ok(ProcessingStatus::Completed) => stats.completed += n,
            Ok(ProcessingStatus::Failed) => stats.failed += n,
            Err(_) => {}
        }
    }

    stats.total_chunks = ctx
        .select("SELECT COUNT(*) FROM document_chunks c", "c")
        .fetch_i64(pool)
        .await?;
    stats.embedded_chunks = ctx
        .select("SELECT COUNT(*) FROM document_chunks c", "c")
        .and("c.embedding_id IS NOT NULL")
        .fetch_i64(pool)
        .await?;

    Ok(stats)
}

/// Set a document's status and message, bumping `updated_at`.
pub async fn set_processing_status(
    pool: &SqlitePool,
    ctx: &TenantContext,
    document_id: &str,
    status: ProcessingStatus,
    message: Option<String>,
) -> RagResult<()> {
    ctx.update("documents")
        .set("processing_status", status.as_str())
        .set("processing_message", message)
        .set("updated_at", chrono::Utc::now().timestamp())
        .where_tenant()
        .and_eq("id", document_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a document to FAILED with `message` as the reason.
pub async fn mark_failed(
    pool: &SqlitePool,
    ctx: &TenantContext,
    document_id: &str,
    reason: &str,
) -> RagResult<()> {
    tracing::warn!(
        tenant_id = %ctx.tenant_id(),
        document_id,
        reason,
        "document marked FAILED"
    );
    set_processing_status(
        pool,
        ctx,
        document_id,
        ProcessingStatus::Failed,
        Some(reason.to_string()),
    )
    .await
}
