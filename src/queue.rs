//! Durable work queue with an at-least-once delivery contract.
//!
//! Messages live in the `queue_messages` table. A consumer claims a batch,
//! which hides the claimed rows for `visibility_timeout_secs`; it must then
//! [`ack`](MessageQueue::ack) or [`fail`](MessageQueue::fail) each one. A
//! consumer that dies mid-batch simply lets the lease expire and the message
//! is delivered again, so every handler must be idempotent.
//!
//! A lease is identified by the message id plus its `attempts` count, which
//! every claim bumps. Settling a message whose lease has expired and been
//! re-claimed by another consumer is a no-op, so only the current holder
//! can delete or reschedule it.
//!
//! Failed messages are retried with exponential backoff until
//! `max_attempts`, then moved to `dead_letters`.
//!
//! Publishing is keyed: re-publishing a `(topic, key)` that is still queued
//! is a no-op. [`publish_in_tx`] enqueues inside a caller's transaction so
//! rows and their events commit together.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::QueueConfig;
use crate::error::RagResult;

pub const TOPIC_DOCUMENT_PROCESSING: &str = "document-processing";
pub const TOPIC_CHUNK_EMBEDDING: &str = "chunk-embedding";

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub topic: String,
    pub key: String,
    pub payload: String,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { attempts: u32, visible_at_ms: i64 },
    DeadLettered { attempts: u32 },
    /// Another consumer re-claimed the message after this lease expired.
    LeaseLost,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: i64,
    pub inflight: i64,
    pub dead: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub error: String,
    pub attempts: i64,
    pub failed_at: i64,
}

/// Tally of one consumer pass over a claimed batch.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BatchStats {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl BatchStats {
    pub fn merge(&mut self, other: BatchStats) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> RagResult<()>;

    /// Lease up to `max` visible messages from `topic`.
    async fn claim(&self, topic: &str, max: usize) -> RagResult<Vec<QueueMessage>>;

    /// Delete a processed message. Returns false when the lease was lost.
    async fn ack(&self, message: &QueueMessage) -> RagResult<bool>;

    /// Record a failed delivery; schedules a retry or dead-letters.
    async fn fail(&self, message: &QueueMessage, error: &str) -> RagResult<FailOutcome>;

    /// Dead-letter immediately, for payloads that can never succeed.
    /// Returns false when the lease was lost.
    async fn reject(&self, message: &QueueMessage, error: &str) -> RagResult<bool>;

    async fn depth(&self, topic: &str) -> RagResult<QueueDepth>;
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Enqueue on an open connection or transaction.
pub async fn publish_in_tx(
    conn: &mut SqliteConnection,
    topic: &str,
    key: &str,
    payload: &str,
) -> Result<(), sqlx::Error> {
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO queue_messages (topic, message_key, payload, status, attempts, visible_at, created_at, updated_at)
        VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
        ON CONFLICT(topic, message_key) DO NOTHING
        "#,
    )
    .bind(topic)
    .bind(key)
    .bind(payload)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Drive a consumer until `shutdown` flips to true (or its sender drops).
///
/// `step` processes one claimed batch. An empty batch sleeps for `poll`
/// before the next claim; a non-empty one loops immediately. Step errors
/// are logged and the loop carries on.
pub async fn consume_until_shutdown<F, Fut>(
    name: &str,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut step: F,
) -> BatchStats
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RagResult<BatchStats>>,
{
    tracing::info!(worker = name, "consumer started");
    let mut total = BatchStats::default();

    while !*shutdown.borrow() {
        let stats = match step().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(worker = name, error = %e, "consumer pass failed");
                BatchStats::default()
            }
        };
        total.merge(stats);

        if stats.claimed == 0 {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(
        worker = name,
        succeeded = total.succeeded,
        retried = total.retried,
        dead_lettered = total.dead_lettered,
        "consumer stopped"
    );
    total
}

/// `retry_base_ms * 2^(attempts - 1)`, capped at `retry_max_ms`.
pub fn retry_delay_ms(settings: &QueueConfig, attempts: u32) -> u64 {
    let exp = attempts.saturating_sub(1).min(20);
    settings
        .retry_base_ms
        .saturating_mul(1u64 << exp)
        .min(settings.retry_max_ms)
}

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    settings: QueueConfig,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, settings: QueueConfig) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &QueueConfig {
        &self.settings
    }

    /// Newest first, optionally for one topic.
    pub async fn dead_letters(
        &self,
        topic: Option<&str>,
        limit: i64,
    ) -> RagResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, error, attempts, failed_at
            FROM dead_letters
            WHERE (? IS NULL OR topic = ?)
            ORDER BY failed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DeadLetter {
                id: row.get("id"),
                topic: row.get("topic"),
                key: row.get("message_key"),
                payload: row.get("payload"),
                error: row.get("error"),
                attempts: row.get("attempts"),
                failed_at: row.get("failed_at"),
            })
            .collect())
    }

    /// Move a dead letter back onto its topic with a fresh attempt budget.
    /// Returns false when no such dead letter exists.
    pub async fn replay_dead_letter(&self, id: i64) -> RagResult<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT topic, message_key, payload FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let topic: String = row.get("topic");
        let key: String = row.get("message_key");
        let payload: String = row.get("payload");

        publish_in_tx(&mut tx, &topic, &key, &payload).await?;
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(dead_letter_id = id, %topic, %key, "dead letter replayed");
        Ok(true)
    }

    async fn move_to_dead_letters(
        &self,
        message: &QueueMessage,
        error: &str,
    ) -> RagResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM queue_messages WHERE id = ? AND status = 'inflight' AND attempts = ?",
        )
        .bind(message.id)
        .bind(message.attempts as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            lease_lost(message);
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO dead_letters (topic, message_key, payload, error, attempts, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(error)
        .bind(message.attempts as i64)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::warn!(
            topic = %message.topic,
            key = %message.key,
            attempts = message.attempts,
            error,
            "message dead-lettered"
        );
        Ok(true)
    }
}

fn lease_lost(message: &QueueMessage) {
    tracing::warn!(
        topic = %message.topic,
        key = %message.key,
        attempts = message.attempts,
        "lease lost; message was re-claimed by another consumer"
    );
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> RagResult<()> {
        let mut conn = self.pool.acquire().await?;
        publish_in_tx(&mut conn, topic, key, payload).await?;
        Ok(())
    }

    async fn claim(&self, topic: &str, max: usize) -> RagResult<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = now_ms();
        let lease_until = now + (self.settings.visibility_timeout_secs as i64) * 1000;

        // Expired in-flight leases are claimable again.
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'inflight', attempts = attempts + 1, visible_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE topic = ? AND status IN ('pending', 'inflight') AND visible_at <= ?
                ORDER BY visible_at, id
                LIMIT ?
            )
            RETURNING id, topic, message_key, payload, attempts
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(topic)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<QueueMessage> = rows
            .iter()
            .map(|row| QueueMessage {
                id: row.get("id"),
                topic: row.get("topic"),
                key: row.get("message_key"),
                payload: row.get("payload"),
                attempts: row.get::<i64, _>("attempts") as u32,
            })
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn ack(&self, message: &QueueMessage) -> RagResult<bool> {
        let removed = sqlx::query(
            "DELETE FROM queue_messages WHERE id = ? AND status = 'inflight' AND attempts = ?",
        )
        .bind(message.id)
        .bind(message.attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if removed == 0 {
            lease_lost(message);
        }
        Ok(removed > 0)
    }

    async fn fail(&self, message: &QueueMessage, error: &str) -> RagResult<FailOutcome> {
        if message.attempts >= self.settings.max_attempts {
            if !self.move_to_dead_letters(message, error).await? {
                return Ok(FailOutcome::LeaseLost);
            }
            return Ok(FailOutcome::DeadLettered {
                attempts: message.attempts,
            });
        }

        let now = now_ms();
        let visible_at_ms = now + retry_delay_ms(&self.settings, message.attempts) as i64;
        let updated = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'pending', visible_at = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'inflight' AND attempts = ?
            "#,
        )
        .bind(visible_at_ms)
        .bind(error)
        .bind(now)
        .bind(message.id)
        .bind(message.attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            lease_lost(message);
            return Ok(FailOutcome::LeaseLost);
        }

        tracing::debug!(
            topic = %message.topic,
            key = %message.key,
            attempts = message.attempts,
            "message scheduled for retry"
        );
        Ok(FailOutcome::Retry {
            attempts: message.attempts,
            visible_at_ms,
        })
    }

    async fn reject(&self, message: &QueueMessage, error: &str) -> RagResult<bool> {
        self.move_to_dead_letters(message, error).await
    }

    async fn depth(&self, topic: &str) -> RagResult<QueueDepth> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'inflight' THEN 1 ELSE 0 END), 0) AS inflight
            FROM queue_messages WHERE topic = ?
            "#,
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueDepth {
            pending: row.get("pending"),
            inflight: row.get("inflight"),
            dead,
        })
    }
}
