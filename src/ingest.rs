//! Document processing: extract → clean → chunk → emit.
//!
//! [`DocumentProcessor::process`] turns one `document-processing` event
//! into stored chunks plus one `chunk-embedding` event per chunk. The chunk
//! rows, their events, and the COMPLETED status commit in a single
//! transaction, so a crash mid-way leaves the document retryable rather than
//! half-chunked.
//!
//! Processing failures are recorded on the document (FAILED with a message)
//! and never propagated; only storage errors while recording the outcome
//! reach the queue, which retries the message.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::chunk::{chunk_text, ChunkDraft};
use crate::config::Config;
use crate::documents::{get_document, mark_failed, set_processing_status};
use crate::error::{RagError, RagResult};
use crate::extract::{clean_text, extract_text};
use crate::models::{ChunkEmbeddingEvent, Document, DocumentProcessingEvent, ProcessingStatus};
use crate::queue::{
    consume_until_shutdown, publish_in_tx, BatchStats, FailOutcome, MessageQueue,
    TOPIC_CHUNK_EMBEDDING, TOPIC_DOCUMENT_PROCESSING,
};
use crate::tenant::{find_tenant, TenantContext, TenantStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { chunks: usize },
    Failed { reason: String },
    /// Nothing to do: the document is gone or already COMPLETED.
    Skipped(&'static str),
}

#[derive(Clone)]
pub struct DocumentProcessor {
    pool: SqlitePool,
    config: Arc<Config>,
}

impl DocumentProcessor {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Self {
        Self { pool, config }
    }

    /// Extract, chunk, and fan out embedding events for one document.
    ///
    /// A COMPLETED document is skipped, so redelivery does not chunk twice.
    /// An inactive tenant fails the document instead of processing it.
    pub async fn process(&self, event: &DocumentProcessingEvent) -> RagResult<ProcessOutcome> {
        let tenant = match find_tenant(&self.pool, &event.tenant_id).await {
            Ok(t) => t,
            Err(RagError::NotFound { .. }) => return Ok(ProcessOutcome::Skipped("tenant gone")),
            Err(e) => return Err(e),
        };
        let ctx = TenantContext::load(&self.pool, &tenant.id, &self.config.chunking).await?;

        let doc = match get_document(&self.pool, &ctx, &event.document_id).await {
            Ok(d) => d,
            Err(RagError::NotFound { .. }) => {
                return Ok(ProcessOutcome::Skipped("document deleted"))
            }
            Err(e) => return Err(e),
        };
        if doc.processing_status == ProcessingStatus::Completed {
            return Ok(ProcessOutcome::Skipped("already completed"));
        }

        if tenant.status != TenantStatus::Active {
            let reason = format!("tenant is {}", tenant.status);
            mark_failed(&self.pool, &ctx, &doc.id, &reason).await?;
            return Ok(ProcessOutcome::Failed { reason });
        }

        set_processing_status(
            &self.pool,
            &ctx,
            &doc.id,
            ProcessingStatus::Processing,
            None,
        )
        .await?;

        match self.chunk_and_emit(&ctx, &doc).await {
            Ok(chunks) => {
                tracing::info!(
                    tenant_id = %ctx.tenant_id(),
                    document_id = %doc.id,
                    chunks,
                    strategy = %ctx.chunking().strategy,
                    "document processed"
                );
                Ok(ProcessOutcome::Completed { chunks })
            }
            Err(e) => {
                let reason = e.to_string();
                mark_failed(&self.pool, &ctx, &doc.id, &reason).await?;
                Ok(ProcessOutcome::Failed { reason })
            }
        }
    }

    async fn chunk_and_emit(&self, ctx: &TenantContext, doc: &Document) -> RagResult<usize> {
        let bytes = tokio::fs::read(&doc.file_path).await?;
        let doc_type = doc.document_type;

        // PDF parsing is CPU-bound.
        let raw = tokio::task::spawn_blocking(move || extract_text(&bytes, doc_type))
            .await
            .map_err(|e| RagError::Processing(format!("extraction task failed: {}", e)))?
            .map_err(|e| RagError::Processing(e.to_string()))?;

        let text = clean_text(&raw);
        if text.is_empty() {
            return Err(RagError::Processing("no extractable text".to_string()));
        }

        let drafts = chunk_text(&text, ctx.chunking());
        self.store_chunks(ctx, doc, &text, &drafts).await?;
        Ok(drafts.len())
    }

    /// Replace the document's chunks, enqueue their embedding events, and
    /// mark it COMPLETED, atomically.
    async fn store_chunks(
        &self,
        ctx: &TenantContext,
        doc: &Document,
        text: &str,
        drafts: &[ChunkDraft],
    ) -> RagResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        ctx.delete_from("document_chunks")
            .and_eq("document_id", doc.id.clone())
            .execute(&mut *tx)
            .await?;

        for draft in drafts {
            let chunk_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO document_chunks (id, tenant_id, document_id, sequence_number, content,
                                             start_offset, end_offset, token_count, content_hash,
                                             created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk_id)
            .bind(ctx.tenant_id())
            .bind(&doc.id)
            .bind(draft.sequence_number)
            .bind(&draft.content)
            .bind(draft.start_offset as i64)
            .bind(draft.end_offset as i64)
            .bind(draft.token_count as i64)
            .bind(&draft.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let event = ChunkEmbeddingEvent {
                chunk_id: chunk_id.clone(),
                document_id: doc.id.clone(),
                tenant_id: ctx.tenant_id().to_string(),
                content: draft.content.clone(),
                sequence_number: draft.sequence_number,
                token_count: draft.token_count as i64,
                timestamp: now,
            };
            let payload = serde_json::to_string(&event)?;
            publish_in_tx(&mut tx, TOPIC_CHUNK_EMBEDDING, &chunk_id, &payload).await?;
        }

        ctx.update("documents")
            .set("processing_status", ProcessingStatus::Completed.as_str())
            .set("processing_message", None::<String>)
            .set("extracted_text", text.to_string())
            .set("chunk_count", drafts.len() as i64)
            .set("updated_at", now)
            .where_tenant()
            .and_eq("id", doc.id.clone())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Consumer of the `document-processing` topic.
#[derive(Clone)]
pub struct DocumentWorker {
    processor: DocumentProcessor,
    queue: Arc<dyn MessageQueue>,
    config: Arc<Config>,
}

impl DocumentWorker {
    pub fn new(pool: SqlitePool, config: Arc<Config>, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            processor: DocumentProcessor::new(pool, config.clone()),
            queue,
            config,
        }
    }

    /// Claim and process up to `max` messages, one at a time.
    /// Claim up to `max` messages and settle each one.
    pub async fn run_once(&self, max: usize) -> RagResult<BatchStats> {
        let messages = self.queue.claim(TOPIC_DOCUMENT_PROCESSING, max).await?;
        let mut stats = BatchStats {
            claimed: messages.len(),
            ..BatchStats::default()
        };

        for message in &messages {
            let event: DocumentProcessingEvent = match serde_json::from_str(&message.payload) {
                Ok(ev) => ev,
                Err(e) => {
                    if self
                        .queue
                        .reject(message, &format!("undecodable payload: {}", e))
                        .await?
                    {
                        stats.dead_lettered += 1;
                    }
                    continue;
                }
            };

            match self.processor.process(&event).await {
                Ok(outcome) => {
                    tracing::debug!(document_id = %event.document_id, ?outcome, "document event handled");
                    if self.queue.ack(message).await? {
                        stats.succeeded += 1;
                    }
                }
                Err(e) => match self.queue.fail(message, &e.to_string()).await? {
                    FailOutcome::Retry { .. } => stats.retried += 1,
                    FailOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
                    FailOutcome::LeaseLost => {}
                },
            }
        }

        Ok(stats)
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> BatchStats {
        let batch = self.config.queue.claim_batch.max(1);
        consume_until_shutdown(
            "documents",
            Duration::from_millis(self.config.queue.poll_interval_ms),
            shutdown,
            || self.run_once(batch),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkStrategy, ChunkingConfig};
    use crate::documents::{list_chunks, upload_document, Upload};
    use crate::queue::SqliteQueue;
    use crate::tenant::{create_tenant, ensure_user, set_status, NewTenant};
    use crate::{db, migrate};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: Arc<Config>,
        pool: SqlitePool,
        queue: Arc<SqliteQueue>,
        ctx: TenantContext,
        user: String,
    }

    async fn setup(chunk_size: usize, overlap: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.chunking = ChunkingConfig {
            strategy: ChunkStrategy::FixedSize,
            chunk_size,
            overlap,
        };
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        create_tenant(
            &pool,
            &NewTenant {
                name: "Acme".into(),
                slug: "acme".into(),
                ..NewTenant::default()
            },
            &config.chunking,
        )
        .await
        .unwrap();
        let ctx = TenantContext::resolve(&pool, "acme", &config.chunking)
            .await
            .unwrap();
        let user = ensure_user(&pool, &ctx, "ops@acme.io").await.unwrap();
        let queue = Arc::new(SqliteQueue::new(pool.clone(), config.queue.clone()));
        Fixture {
            _tmp: tmp,
            config: Arc::new(config),
            pool,
            queue,
            ctx,
            user,
        }
    }

    async fn upload(f: &Fixture, name: &str, body: &[u8]) -> Document {
        upload_document(
            &f.pool,
            &f.config,
            &f.ctx,
            &f.user,
            Upload {
                original_filename: name,
                content_type: "",
                bytes: body,
            },
        )
        .await
        .unwrap()
    }

    fn event_for(doc: &Document) -> DocumentProcessingEvent {
        DocumentProcessingEvent {
            document_id: doc.id.clone(),
            tenant_id: doc.tenant_id.clone(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_process_stores_contiguous_chunks_and_events() {
        // 10-token chunks (40 chars), 2-token overlap (8 chars).
        let f = setup(10, 2).await;
        let body = "abcdefghij".repeat(10);
        let doc = upload(&f, "letters.txt", body.as_bytes()).await;

        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());
        let outcome = processor.process(&event_for(&doc)).await.unwrap();
        // L=100, S=40, O=8: ceil(92 / 32) = 3
        assert_eq!(outcome, ProcessOutcome::Completed { chunks: 3 });

        let chunks = list_chunks(&f.pool, &f.ctx, &doc.id).await.unwrap();
        let seqs: Vec<i64> = chunks.iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let stored = get_document(&f.pool, &f.ctx, &doc.id).await.unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Completed);
        assert_eq!(stored.chunk_count, 3);

        let events = f.queue.claim(TOPIC_CHUNK_EMBEDDING, 10).await.unwrap();
        assert_eq!(events.len(), 3);
        let first: ChunkEmbeddingEvent = serde_json::from_str(&events[0].payload).unwrap();
        assert_eq!(first.tenant_id, f.ctx.tenant_id());
        assert_eq!(first.content, chunks[0].content);
    }

    #[tokio::test]
    async fn test_reprocessing_replaces_chunks() {
        let f = setup(10, 2).await;
        let doc = upload(&f, "a.txt", "word ".repeat(40).as_bytes()).await;
        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());
        processor.process(&event_for(&doc)).await.unwrap();
        let before = list_chunks(&f.pool, &f.ctx, &doc.id).await.unwrap();

        // Force a second pass as a redelivered event would after a crash.
        set_processing_status(&f.pool, &f.ctx, &doc.id, ProcessingStatus::Processing, None)
            .await
            .unwrap();
        processor.process(&event_for(&doc)).await.unwrap();
        let after = list_chunks(&f.pool, &f.ctx, &doc.id).await.unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.sequence_number, b.sequence_number);
            assert_eq!(a.content_hash, b.content_hash);
        }
    }

    #[tokio::test]
    async fn test_completed_document_is_skipped() {
        let f = setup(10, 2).await;
        let doc = upload(&f, "a.txt", b"some text here").await;
        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());
        processor.process(&event_for(&doc)).await.unwrap();
        assert_eq!(
            processor.process(&event_for(&doc)).await.unwrap(),
            ProcessOutcome::Skipped("already completed")
        );
    }

    #[tokio::test]
    async fn test_blank_document_fails_with_message() {
        let f = setup(10, 2).await;
        let doc = upload(&f, "blank.txt", b"   \n\n  \t ").await;
        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());

        let outcome = processor.process(&event_for(&doc)).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

        let stored = get_document(&f.pool, &f.ctx, &doc.id).await.unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Failed);
        assert_eq!(
            stored.processing_message.as_deref(),
            Some("no extractable text")
        );
    }

    #[tokio::test]
    async fn test_corrupt_pdf_fails_without_error() {
        let f = setup(10, 2).await;
        let doc = upload(&f, "broken.pdf", b"%PDF-1.4 not really").await;
        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());
        let outcome = processor.process(&event_for(&doc)).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_suspended_tenant_fails_processing() {
        let f = setup(10, 2).await;
        let doc = upload(&f, "a.txt", b"text").await;
        set_status(&f.pool, "acme", TenantStatus::Suspended)
            .await
            .unwrap();

        let processor = DocumentProcessor::new(f.pool.clone(), f.config.clone());
        let outcome = processor.process(&event_for(&doc)).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                reason: "tenant is SUSPENDED".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_rejects_garbage() {
        let f = setup(10, 2).await;
        upload(&f, "a.txt", b"alpha beta gamma").await;
        f.queue
            .publish(TOPIC_DOCUMENT_PROCESSING, "garbage", "not json")
            .await
            .unwrap();

        let worker = DocumentWorker::new(f.pool.clone(), f.config.clone(), f.queue.clone());
        let stats = worker.run_once(10).await.unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.dead_lettered, 1);

        let depth = f.queue.depth(TOPIC_DOCUMENT_PROCESSING).await.unwrap();
        assert_eq!(depth.pending + depth.inflight, 0);
        assert_eq!(depth.dead, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = setup(10, 2).await;
        let worker = DocumentWorker::new(f.pool.clone(), f.config.clone(), f.queue.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.claimed, 0);
    }
}
