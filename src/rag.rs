//! Query orchestration: cache, retrieve, assemble, generate.
//!
//! A query first checks the tenant's response cache. On a miss the
//! question is rewritten for retrieval and, when it belongs to a
//! conversation with history, enriched with recent terms. An empty
//! retrieval short-circuits to a canned NO_CONTEXT answer without calling
//! the generator. Otherwise the ranked chunks are assembled into a bounded
//! context, the generator answers the question (folded together with the
//! recent exchanges), the exchange is recorded, and the serialized response
//! is written back to the cache unless it depended on history.
//!
//! Retrieval and generation failures are logged with the request id and
//! surfaced as [`RagError::QueryFailed`] carrying that same id. Caller mistakes
//! (validation, inactive tenant) pass through unchanged.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cache::{EmbeddingCache, ResponseCache};
use crate::config::{Config, SearchMode};
use crate::context::assemble_context;
use crate::conversation::{validate_conversation_id, Conversation, ConversationStore, Exchange};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, RagResult};
use crate::llm::{user_prompt, GenerationProvider, GenerationRequest, SYSTEM_PROMPT};
use crate::query::QueryOptimizer;
use crate::search::{Retriever, ScoredChunk, SearchRequest};
use crate::tenant::TenantContext;
use sqlx::SqlitePool;

pub const MAX_QUERY_CHARS: usize = 2000;

pub const NO_CONTEXT_ANSWER: &str = "I couldn't find any relevant information to answer \
your question. Please try rephrasing your query or check if the relevant documents have \
been uploaded.";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RagQueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    /// Follow-up questions with the same id see the earlier exchanges.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Success,
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReference {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub content: String,
    pub sequence_number: i64,
    pub relevance_score: f64,
}

impl From<&ScoredChunk> for SourceReference {
    fn from(chunk: &ScoredChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            filename: chunk.filename.clone(),
            content: chunk.content.clone(),
            sequence_number: chunk.sequence_number,
            relevance_score: chunk.score,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub total_ms: u64,
    pub retrieval_ms: u64,
    pub context_ms: u64,
    pub generation_ms: u64,
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
    pub tokens_generated: usize,
    pub model_used: Option<String>,
    pub retrieval_strategy: String,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQueryResponse {
    pub request_id: String,
    pub tenant_id: String,
    pub query: String,
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<SourceReference>,
    pub metrics: QueryMetrics,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: i64,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Mean relevance of the sources, clamped to `[0, 1]`.
pub fn confidence(sources: &[SourceReference]) -> f64 {
    if sources.is_empty() {
        return 0.0;
    }
    let sum: f64 = sources.iter().map(|s| s.relevance_score).sum();
    (sum / sources.len() as f64).clamp(0.0, 1.0)
}

/// Answers questions for one tenant at a time.
///
/// Cheap to clone; every clone shares the same pool and providers.
#[derive(Clone)]
pub struct RagService {
    config: Arc<Config>,
    retriever: Retriever,
    generator: Arc<dyn GenerationProvider>,
    responses: ResponseCache,
    conversations: ConversationStore,
    optimizer: QueryOptimizer,
}

impl RagService {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let embeddings = EmbeddingCache::new(
            pool.clone(),
            Duration::from_secs(config.cache.embedding_ttl_secs),
        );
        let responses = ResponseCache::new(
            pool.clone(),
            Duration::from_secs(config.cache.response_ttl_secs),
        );
        let conversations = ConversationStore::new(pool.clone(), config.conversation.clone());
        let optimizer = QueryOptimizer::new(config.query.clone());
        let retriever = Retriever::new(pool, embedder, embeddings, config.retrieval.clone());
        Self {
            config,
            retriever,
            generator,
            responses,
            conversations,
            optimizer,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Answer `request` from the tenant's documents.
    ///
    /// # Errors
    ///
    /// - [`RagError::Validation`] for an empty or over-long query, a
    ///   malformed `conversation_id`, or bad retrieval options.
    /// - [`RagError::QueryFailed`] when retrieval or generation fails; its
    ///   `request_id` matches the error log line with the cause.
    pub async fn query(
        &self,
        ctx: &TenantContext,
        request: &RagQueryRequest,
    ) -> RagResult<RagQueryResponse> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(RagError::validation(format!(
                "query must be at most {} characters",
                MAX_QUERY_CHARS
            )));
        }

        let conversation_id = request.conversation_id.as_deref().map(str::trim);
        if let Some(id) = conversation_id {
            validate_conversation_id(id)?;
        }

        let request_id = Uuid::new_v4().to_string();

        if let Some(mut hit) = self.cached(ctx, query, &request_id).await {
            hit.conversation_id = conversation_id.map(str::to_string);
            if let Some(id) = conversation_id {
                self.record(ctx, id, &hit, &request_id).await;
            }
            return Ok(hit);
        }

        let history = match conversation_id {
            Some(id) => self.history(ctx, id, &request_id).await,
            None => None,
        };
        let optimized = self.optimizer.optimize(query);
        let (retrieval_query, question) = match &history {
            Some(conversation) => (
                self.conversations.retrieval_query(conversation, &optimized),
                self.conversations.contextualize(conversation, query),
            ),
            None => (optimized, query.to_string()),
        };
        let used_history = history.is_some();

        let mode = request.mode.unwrap_or(self.retriever.settings().mode);
        let search = SearchRequest {
            query: retrieval_query,
            top_k: request.top_k,
            similarity_threshold: request.similarity_threshold,
            mode: Some(mode),
            document_ids: request.document_ids.clone(),
        };

        let retrieval_started = Instant::now();
        let chunks = self
            .retriever
            .search(ctx, &search)
            .await
            .map_err(|e| self.internal_failure(&request_id, "retrieval", e))?;
        let retrieval_ms = millis(retrieval_started.elapsed());

        let mut metrics = QueryMetrics {
            retrieval_ms,
            chunks_retrieved: chunks.len(),
            retrieval_strategy: mode.as_str().to_string(),
            ..QueryMetrics::default()
        };

        if chunks.is_empty() {
            metrics.total_ms = millis(started.elapsed());
            tracing::info!(
                request_id = %request_id,
                tenant_id = %ctx.tenant_id(),
                "no relevant context found"
            );
            return Ok(RagQueryResponse {
                request_id,
                tenant_id: ctx.tenant_id().to_string(),
                query: query.to_string(),
                answer: NO_CONTEXT_ANSWER.to_string(),
                confidence: 0.0,
                sources: Vec::new(),
                metrics,
                status: QueryStatus::NoContext,
                conversation_id: conversation_id.map(str::to_string),
                created_at: chrono::Utc::now().timestamp(),
            });
        }

        let context_started = Instant::now();
        let assembled = assemble_context(&chunks, &self.config.context);
        let sources: Vec<SourceReference> = chunks
            .iter()
            .take(assembled.chunks_used)
            .map(SourceReference::from)
            .collect();
        metrics.context_ms = millis(context_started.elapsed());
        metrics.chunks_used = assembled.chunks_used;

        let generation_started = Instant::now();
        let generation = self
            .generator
            .generate(&GenerationRequest {
                system: SYSTEM_PROMPT.to_string(),
                user: user_prompt(&assembled.text, &question),
                max_tokens: self.config.llm.max_tokens,
                temperature: self.config.llm.temperature,
            })
            .await
            .map_err(|e| self.internal_failure(&request_id, "generation", e))?;
        metrics.generation_ms = millis(generation_started.elapsed());
        metrics.tokens_generated = generation.tokens;
        metrics.model_used = Some(generation.model);
        metrics.total_ms = millis(started.elapsed());

        let response = RagQueryResponse {
            request_id,
            tenant_id: ctx.tenant_id().to_string(),
            query: query.to_string(),
            answer: generation.text,
            confidence: confidence(&sources),
            sources,
            metrics,
            status: QueryStatus::Success,
            conversation_id: conversation_id.map(str::to_string),
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Some(id) = conversation_id {
            self.record(ctx, id, &response, &response.request_id).await;
        }
        // An answer shaped by earlier exchanges is not reusable for the bare query.
        if !used_history {
            self.store(ctx, query, &response).await;
        }

        tracing::info!(
            request_id = %response.request_id,
            tenant_id = %ctx.tenant_id(),
            chunks_used = response.metrics.chunks_used,
            used_history,
            total_ms = response.metrics.total_ms,
            "query answered"
        );
        Ok(response)
    }

    /// Cache read errors are treated as a miss.
    async fn cached(
        &self,
        ctx: &TenantContext,
        query: &str,
        request_id: &str,
    ) -> Option<RagQueryResponse> {
        let bytes = match self.responses.get_raw(ctx.tenant_id(), query).await {
            Ok(hit) => hit?,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "response cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<RagQueryResponse>(&bytes) {
            Ok(mut response) => {
                response.metrics.cache_hit = true;
                tracing::info!(request_id, tenant_id = %ctx.tenant_id(), "response cache hit");
                Some(response)
            }
            Err(e) => {
                tracing::warn!(request_id, error = %e, "discarding undecodable cached response");
                None
            }
        }
    }

    /// Prior exchanges of `id`, if conversations are enabled and it has any.
    /// Read failures are logged and treated as no history.
    async fn history(
        &self,
        ctx: &TenantContext,
        id: &str,
        request_id: &str,
    ) -> Option<Conversation> {
        if !self.conversations.is_enabled() {
            return None;
        }
        match self.conversations.get(ctx, id).await {
            Ok(conversation) => conversation.filter(|c| !c.exchanges.is_empty()),
            Err(e) => {
                tracing::warn!(request_id, conversation_id = id, error = %e, "conversation read failed");
                None
            }
        }
    }

    async fn record(
        &self,
        ctx: &TenantContext,
        id: &str,
        response: &RagQueryResponse,
        request_id: &str,
    ) {
        if !self.conversations.is_enabled() {
            return;
        }
        let mut document_ids: Vec<String> = response
            .sources
            .iter()
            .map(|s| s.document_id.clone())
            .collect();
        document_ids.sort();
        document_ids.dedup();
        let exchange = Exchange::new(&response.query, &response.answer, document_ids);
        if let Err(e) = self.conversations.add_exchange(ctx, id, exchange).await {
            tracing::warn!(request_id, conversation_id = id, error = %e, "conversation write failed");
        }
    }

    async fn store(&self, ctx: &TenantContext, query: &str, response: &RagQueryResponse) {
        let result = match serde_json::to_vec(response) {
            Ok(bytes) => self.responses.put_raw(ctx.tenant_id(), query, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(
                request_id = %response.request_id,
                error = %e,
                "response cache write failed"
            );
        }
    }

    fn internal_failure(&self, request_id: &str, stage: &str, error: RagError) -> RagError {
        if error.is_permanent() {
            return error;
        }
        tracing::error!(request_id, stage, error = %error, "query failed");
        RagError::QueryFailed {
            request_id: request_id.to_string(),
        }
    }

    /// Drop every cached response for the tenant.
    pub async fn invalidate_tenant(&self, ctx: &TenantContext) -> RagResult<u64> {
        self.responses.clear_tenant(ctx.tenant_id()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(score: f64) -> SourceReference {
        SourceReference {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            filename: "f.txt".to_string(),
            content: "x".to_string(),
            sequence_number: 0,
            relevance_score: score,
        }
    }

    #[test]
    fn test_confidence_is_mean() {
        let value = confidence(&[source(0.5), source(1.0)]);
        assert!((value - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_clamped_and_empty() {
        assert_eq!(confidence(&[]), 0.0);
        assert_eq!(confidence(&[source(1.4)]), 1.0);
        assert_eq!(confidence(&[source(-0.2)]), 0.0);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&QueryStatus::NoContext).unwrap(),
            "\"NO_CONTEXT\""
        );
    }
}
