//! Conversation history for follow-up questions.
//!
//! A conversation is one JSON document in the `conversation` namespace of
//! the TTL cache, keyed by `{tenant}:{conversation id}`. Recording an
//! exchange rewrites the document and refreshes its TTL, so an idle
//! conversation simply expires. Another tenant's conversation with the same
//! id is a different key and reads as absent.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::KvCache;
use crate::config::ConversationConfig;
use crate::error::{RagError, RagResult};
use crate::query::extract_key_terms;
use crate::tenant::TenantContext;

pub const CONVERSATION_NAMESPACE: &str = "conversation";

const MAX_ID_CHARS: usize = 100;
const ANSWER_PREVIEW_CHARS: usize = 200;
/// Cap on terms borrowed from earlier questions for retrieval.
const MAX_CARRIED_TERMS: usize = 8;

/// One question and the answer it received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: String,
    pub query: String,
    pub answer: String,
    /// Documents the answer drew on.
    pub document_ids: Vec<String>,
    pub timestamp: i64,
}

impl Exchange {
    pub fn new(query: &str, answer: &str, document_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            answer: answer.to_string(),
            document_ids,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    /// Oldest first.
    pub exchanges: Vec<Exchange>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    fn new(tenant_id: &str, id: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            exchanges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append, dropping the oldest exchanges beyond `max_history`.
    pub fn push(&mut self, exchange: Exchange, max_history: usize) {
        self.updated_at = exchange.timestamp;
        self.exchanges.push(exchange);
        let excess = self.exchanges.len().saturating_sub(max_history.max(1));
        self.exchanges.drain(..excess);
    }

    /// The last `n` exchanges, oldest first.
    pub fn recent(&self, n: usize) -> &[Exchange] {
        let start = self.exchanges.len().saturating_sub(n);
        &self.exchanges[start..]
    }
}

/// Conversation ids are 1..=100 characters of `[A-Za-z0-9_-]`.
pub fn validate_conversation_id(id: &str) -> RagResult<()> {
    let len = id.chars().count();
    if len == 0 || len > MAX_ID_CHARS {
        return Err(RagError::validation(format!(
            "conversation_id must be between 1 and {} characters",
            MAX_ID_CHARS
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RagError::validation(
            "conversation_id may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

fn preview(answer: &str) -> String {
    if answer.chars().count() <= ANSWER_PREVIEW_CHARS {
        return answer.to_string();
    }
    let head: String = answer.chars().take(ANSWER_PREVIEW_CHARS).collect();
    format!("{}...", head)
}

#[derive(Clone)]
pub struct ConversationStore {
    cache: KvCache,
    settings: ConversationConfig,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool, settings: ConversationConfig) -> Self {
        Self {
            cache: KvCache::new(
                pool,
                CONVERSATION_NAMESPACE,
                Duration::from_secs(settings.ttl_secs),
            ),
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn key(ctx: &TenantContext, id: &str) -> String {
        format!("{}:{}", ctx.tenant_id(), id)
    }

    /// Load a conversation; `None` when it never existed or has expired.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Validation`] for a malformed id and a storage
    /// error when the cache cannot be read.
    pub async fn get(&self, ctx: &TenantContext, id: &str) -> RagResult<Option<Conversation>> {
        validate_conversation_id(id)?;
        let Some(bytes) = self.cache.get(&Self::key(ctx, id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Conversation>(&bytes) {
            Ok(conversation) => Ok(Some(conversation)),
            Err(e) => {
                tracing::warn!(conversation_id = id, error = %e, "discarding undecodable conversation");
                Ok(None)
            }
        }
    }

    /// Append `exchange`, creating the conversation on first use, and
    /// refresh its TTL. Returns the stored conversation.
    pub async fn add_exchange(
        &self,
        ctx: &TenantContext,
        id: &str,
        exchange: Exchange,
    ) -> RagResult<Conversation> {
        let mut conversation = self
            .get(ctx, id)
            .await?
            .unwrap_or_else(|| Conversation::new(ctx.tenant_id(), id));
        conversation.push(exchange, self.settings.max_history);
        let bytes = serde_json::to_vec(&conversation)?;
        self.cache.put(&Self::key(ctx, id), &bytes).await?;
        tracing::debug!(
            tenant_id = %ctx.tenant_id(),
            conversation_id = id,
            exchanges = conversation.exchanges.len(),
            "conversation exchange recorded"
        );
        Ok(conversation)
    }

    /// Forget a conversation. Returns whether it existed.
    pub async fn delete(&self, ctx: &TenantContext, id: &str) -> RagResult<bool> {
        validate_conversation_id(id)?;
        self.cache.delete(&Self::key(ctx, id)).await
    }

    /// Fold the recent exchanges into `question` for the generator.
    ///
    /// With no history the question comes back unchanged.
    pub fn contextualize(&self, conversation: &Conversation, question: &str) -> String {
        let recent = conversation.recent(self.settings.context_window);
        if recent.is_empty() {
            return question.to_string();
        }
        let mut out = String::from("Given our recent conversation:\n");
        for exchange in recent {
            out.push_str(&format!(
                "User: {}\nAI: {}\n\n",
                exchange.query,
                preview(&exchange.answer)
            ));
        }
        out.push_str("New question: ");
        out.push_str(question);
        out
    }

    /// `query` plus key terms from recent questions that it lacks, newest
    /// question first, so a terse follow-up still retrieves on topic.
    pub fn retrieval_query(&self, conversation: &Conversation, query: &str) -> String {
        let mut present = extract_key_terms(query);
        let mut carried: Vec<String> = Vec::new();
        for exchange in conversation
            .recent(self.settings.context_window)
            .iter()
            .rev()
        {
            for term in extract_key_terms(&exchange.query) {
                if carried.len() >= MAX_CARRIED_TERMS {
                    break;
                }
                if !present.contains(&term) {
                    present.push(term.clone());
                    carried.push(term);
                }
            }
        }
        if carried.is_empty() {
            return query.to_string();
        }
        format!("{} {}", query, carried.join(" "))
    }
}
