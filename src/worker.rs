//! Embedding worker: consumes `chunk-embedding` events and stores vectors.
//!
//! Handling is idempotent on chunk id. A redelivered event for a chunk that
//! already has a vector from the current model with the same content hash is
//! acknowledged without calling the provider. Vectors for identical text
//! come from the tenant-scoped [`EmbeddingCache`] when present.
//!
//! A batch is processed with at most `queue.worker_concurrency` events in
//! flight. When an event exhausts its retries it is dead-lettered and the
//! owning document is marked FAILED.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::documents::mark_failed;
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::error::{RagError, RagResult};
use crate::models::{ChunkEmbeddingEvent, ProcessingStatus};
use crate::queue::{
    consume_until_shutdown, BatchStats, FailOutcome, MessageQueue, QueueMessage,
    TOPIC_CHUNK_EMBEDDING,
};
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    Embedded { cache_hit: bool },
    AlreadyEmbedded,
    /// The chunk was deleted or replaced after the event was published.
    ChunkGone,
}

#[derive(Clone)]
pub struct EmbeddingWorker {
    pool: SqlitePool,
    config: Arc<Config>,
    queue: Arc<dyn MessageQueue>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl EmbeddingWorker {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        queue: Arc<dyn MessageQueue>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let cache = EmbeddingCache::new(
            pool.clone(),
            Duration::from_secs(config.cache.embedding_ttl_secs),
        );
        Self {
            pool,
            config,
            queue,
            provider,
            cache,
        }
    }

    /// Embed one chunk. Redelivery of an already-embedded chunk is a no-op.
    pub async fn handle(&self, event: &ChunkEmbeddingEvent) -> RagResult<EmbedOutcome> {
        if event.content.trim().is_empty() {
            return Err(RagError::validation("chunk event has empty content"));
        }

        let ctx = match TenantContext::load(&self.pool, &event.tenant_id, &self.config.chunking)
            .await
        {
            Ok(ctx) => ctx,
            Err(RagError::NotFound { .. }) => return Ok(EmbedOutcome::ChunkGone),
            Err(e) => return Err(e),
        };

        let row = ctx
            .select(
                "SELECT c.content_hash, e.model AS embedded_model, \
                 e.content_hash AS embedded_hash \
                 FROM document_chunks c LEFT JOIN chunk_embeddings e ON e.chunk_id = c.id",
                "c",
            )
            .and_eq("c.id", event.chunk_id.clone())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(EmbedOutcome::ChunkGone);
        };

        let content_hash: String = row.try_get("content_hash")?;
        let embedded_model: Option<String> = row.try_get("embedded_model")?;
        let embedded_hash: Option<String> = row.try_get("embedded_hash")?;
        let model = self.provider.model_name().to_string();
        if embedded_model.as_deref() == Some(model.as_str())
            && embedded_hash.as_deref() == Some(content_hash.as_str())
        {
            return Ok(EmbedOutcome::AlreadyEmbedded);
        }

        let (vector, cache_hit) = match self
            .cache
            .get(ctx.tenant_id(), &model, &event.content)
            .await?
        {
            Some(v) if v.len() == self.provider.dims() => (v, true),
            _ => {
                let vectors = self.provider.embed(&[event.content.clone()]).await?;
                let v = vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| RagError::upstream("empty embedding response"))?;
                if let Err(e) = self
                    .cache
                    .put(ctx.tenant_id(), &model, &event.content, &v)
                    .await
                {
                    tracing::warn!(chunk_id = %event.chunk_id, error = %e, "embedding cache write failed");
                }
                (v, false)
            }
        };

        self.store(&ctx, event, &model, &content_hash, &vector)
            .await?;

        tracing::debug!(
            tenant_id = %ctx.tenant_id(),
            chunk_id = %event.chunk_id,
            cache_hit,
            "chunk embedded"
        );
        Ok(EmbedOutcome::Embedded { cache_hit })
    }

    async fn store(
        &self,
        ctx: &TenantContext,
        event: &ChunkEmbeddingEvent,
        model: &str,
        content_hash: &str,
        vector: &[f32],
    ) -> RagResult<()> {
        let embedding_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_embeddings (id, chunk_id, tenant_id, document_id, model, dims,
                                          content_hash, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                id = excluded.id,
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(&embedding_id)
        .bind(&event.chunk_id)
        .bind(ctx.tenant_id())
        .bind(&event.document_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(content_hash)
        .bind(vec_to_blob(vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        ctx.update("document_chunks")
            .set("embedding_id", embedding_id)
            .where_tenant()
            .and_eq("id", event.chunk_id.clone())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Claim up to `max` events and handle them concurrently.
    pub async fn run_once(&self, max: usize) -> RagResult<BatchStats> {
        let messages = self.queue.claim(TOPIC_CHUNK_EMBEDDING, max).await?;
        let mut stats = BatchStats {
            claimed: messages.len(),
            ..BatchStats::default()
        };
        let limit = self.config.queue.worker_concurrency.max(1);

        let mut pending = messages.into_iter();
        let mut set = JoinSet::new();
        loop {
            while set.len() < limit {
                let Some(message) = pending.next() else { break };
                let worker = self.clone();
                set.spawn(async move { worker.settle(message).await });
            }
            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(Settled::Acked)) => stats.succeeded += 1,
                Ok(Ok(Settled::Retried)) => stats.retried += 1,
                Ok(Ok(Settled::DeadLettered)) => stats.dead_lettered += 1,
                Ok(Ok(Settled::LeaseLost)) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "failed to settle chunk event");
                }
                Err(e) => {
                    tracing::error!(error = %e, "embedding task panicked");
                }
            }
        }

        Ok(stats)
    }

    /// Handle one message and record the result on the queue.
    async fn settle(&self, message: QueueMessage) -> RagResult<Settled> {
        let event: ChunkEmbeddingEvent = match serde_json::from_str(&message.payload) {
            Ok(ev) => ev,
            Err(e) => {
                let rejected = self
                    .queue
                    .reject(&message, &format!("undecodable payload: {}", e))
                    .await?;
                return Ok(if rejected {
                    Settled::DeadLettered
                } else {
                    Settled::LeaseLost
                });
            }
        };

        let error = match self.handle(&event).await {
            Ok(_) => {
                return Ok(if self.queue.ack(&message).await? {
                    Settled::Acked
                } else {
                    Settled::LeaseLost
                });
            }
            Err(e) => e,
        };

        let reason = error.to_string();
        let outcome = if error.is_permanent() {
            if self.queue.reject(&message, &reason).await? {
                FailOutcome::DeadLettered {
                    attempts: message.attempts,
                }
            } else {
                FailOutcome::LeaseLost
            }
        } else {
            self.queue.fail(&message, &reason).await?
        };

        match outcome {
            FailOutcome::Retry { attempts, .. } => {
                tracing::warn!(chunk_id = %event.chunk_id, attempts, error = %reason, "embedding failed, will retry");
                Ok(Settled::Retried)
            }
            FailOutcome::DeadLettered { .. } => {
                self.fail_document(&event, &reason).await?;
                Ok(Settled::DeadLettered)
            }
            FailOutcome::LeaseLost => Ok(Settled::LeaseLost),
        }
    }

    async fn fail_document(&self, event: &ChunkEmbeddingEvent, reason: &str) -> RagResult<()> {
        let ctx = match TenantContext::load(&self.pool, &event.tenant_id, &self.config.chunking)
            .await
        {
            Ok(ctx) => ctx,
            Err(RagError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        mark_failed(
            &self.pool,
            &ctx,
            &event.document_id,
            &format!("embedding failed for chunk {}: {}", event.sequence_number, reason),
        )
        .await
    }

    /// Consume until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> BatchStats {
        let batch = self.config.queue.claim_batch.max(1);
        consume_until_shutdown(
            "embeddings",
            Duration::from_millis(self.config.queue.poll_interval_ms),
            shutdown,
            || self.run_once(batch),
        )
        .await
    }
}

enum Settled {
    Acked,
    Retried,
    DeadLettered,
    LeaseLost,
}

/// Re-publish embedding events for COMPLETED documents' chunks that have
/// no vector yet. Returns the number of events published.
///
/// Publishing is keyed by chunk id, so chunks whose event is still queued
/// are not duplicated.
pub async fn embed_pending(
    pool: &SqlitePool,
    queue: &dyn MessageQueue,
    ctx: &TenantContext,
    limit: i64,
) -> RagResult<usize> {
    let rows = ctx
        .select(
            "SELECT c.id, c.document_id, c.content, c.sequence_number, c.token_count \
             FROM document_chunks c JOIN documents d ON d.id = c.document_id",
            "c",
        )
        .and("c.embedding_id IS NULL")
        .and_eq("d.processing_status", ProcessingStatus::Completed.as_str())
        .push("ORDER BY c.document_id, c.sequence_number LIMIT ")
        .bind(limit.max(1))
        .fetch_all(pool)
        .await?;

    let now = chrono::Utc::now().timestamp();
    for row in &rows {
        let event = ChunkEmbeddingEvent {
            chunk_id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            tenant_id: ctx.tenant_id().to_string(),
            content: row.try_get("content")?,
            sequence_number: row.try_get("sequence_number")?,
            token_count: row.try_get("token_count")?,
            timestamp: now,
        };
        queue
            .publish(
                TOPIC_CHUNK_EMBEDDING,
                &event.chunk_id,
                &serde_json::to_string(&event)?,
            )
            .await?;
    }

    tracing::info!(tenant_id = %ctx.tenant_id(), published = rows.len(), "pending chunks re-queued");
    Ok(rows.len())
}
