//! Tenant-scoped chunk retrieval: keyword, semantic, and hybrid.
//!
//! Every candidate query is built from the caller's [`TenantContext`], so
//! the tenant predicate is part of the SQL before any ranking happens.
//!
//! # Modes
//!
//! - **keyword** (default): chunks whose lowercased content contains the
//!   first query token; score is the fraction of query tokens present. The
//!   similarity threshold does not apply.
//! - **semantic**: cosine similarity between the query vector and the
//!   tenant's stored vectors for the configured model; scores below the
//!   threshold are dropped.
//! - **hybrid**: both channels min-max normalized to `[0, 1]` and merged as
//!   `(1 - α) · keyword + α · semantic`.
//!
//! Results are ordered by score descending, then document id, then
//! sequence number, and truncated to `top_k`.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::EmbeddingCache;
use crate::config::{RetrievalConfig, SearchMode};
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::{RagError, RagResult};
use crate::tenant::TenantContext;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub content: String,
    pub sequence_number: i64,
    pub score: f64,
}

impl ScoredChunk {
    fn from_row(row: &SqliteRow, score: f64) -> Result<Self, sqlx::Error> {
        Ok(Self {
            chunk_id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            filename: row.try_get("original_filename")?,
            content: row.try_get("content")?,
            sequence_number: row.try_get("sequence_number")?,
            score,
        })
    }
}

const CHUNK_SELECT: &str = "SELECT c.id, c.document_id, c.content, c.sequence_number, \
     d.original_filename FROM document_chunks c JOIN documents d ON d.id = c.document_id";

const VECTOR_SELECT: &str = "SELECT c.id, c.document_id, c.content, c.sequence_number, \
     d.original_filename, e.vector FROM chunk_embeddings e \
     JOIN document_chunks c ON c.id = e.chunk_id \
     JOIN documents d ON d.id = c.document_id";

/// Lowercased alphanumeric tokens in first-seen order, deduplicated.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

#[derive(Clone)]
pub struct Retriever {
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    settings: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
        cache: EmbeddingCache,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            provider,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Rank the tenant's chunks for `request`. A blank query returns no
    /// results.
    ///
    /// Keyword mode scores by the share of query tokens a chunk contains.
    /// Semantic mode embeds the query (through the embedding cache) and
    /// keeps chunks at or above the similarity threshold. Hybrid blends both
    /// with `hybrid_alpha`. Results are sorted by score and cut to `top_k`.
    ///
    /// # Errors
    ///
    /// [`RagError::Validation`] for `top_k == 0`, a threshold outside
    /// `[0, 1]`, or a vector mode without an embedding provider.
    pub async fn search(
        &self,
        ctx: &TenantContext,
        request: &SearchRequest,
    ) -> RagResult<Vec<ScoredChunk>> {
        let query = request.query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mode = request.mode.unwrap_or(self.settings.mode);
        let top_k = request.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 {
            return Err(RagError::validation("top_k must be >= 1"));
        }
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.settings.similarity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RagError::validation(
                "similarity_threshold must be in [0.0, 1.0]",
            ));
        }
        if mode.needs_embeddings() && self.provider.dims() == 0 {
            return Err(RagError::validation(format!(
                "search mode '{}' requires embeddings; configure an [embedding] provider",
                mode
            )));
        }
        let doc_filter = request.document_ids.as_deref();

        let mut results = match mode {
            SearchMode::Keyword => self.keyword_candidates(ctx, query, doc_filter).await?,
            SearchMode::Semantic => {
                self.semantic_candidates(ctx, query, threshold, doc_filter)
                    .await?
            }
            SearchMode::Hybrid => {
                let keyword = self.keyword_candidates(ctx, query, doc_filter).await?;
                let semantic = self
                    .semantic_candidates(ctx, query, threshold, doc_filter)
                    .await?;
                merge_hybrid(keyword, semantic, self.settings.hybrid_alpha)
            }
        };

        sort_results(&mut results);
        results.truncate(top_k);

        tracing::debug!(
            tenant_id = %ctx.tenant_id(),
            mode = %mode,
            results = results.len(),
            "search complete"
        );
        Ok(results)
    }

    async fn keyword_candidates(
        &self,
        ctx: &TenantContext,
        query: &str,
        doc_filter: Option<&[String]>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let tokens = query_tokens(query);
        let Some(first) = tokens.first() else {
            return Ok(Vec::new());
        };

        let mut q = ctx
            .select(CHUNK_SELECT, "c")
            .and("instr(lower(c.content), ")
            .bind(first.clone())
            .push(") > 0");
        if let Some(ids) = doc_filter {
            q = q.and_in("c.document_id", ids);
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let content: String = row.try_get("content")?;
                let lower = content.to_lowercase();
                let hits = tokens.iter().filter(|t| lower.contains(t.as_str())).count();
                let score = hits as f64 / tokens.len() as f64;
                Ok::<_, RagError>(ScoredChunk::from_row(row, score)?)
            })
            .collect()
    }

    async fn semantic_candidates(
        &self,
        ctx: &TenantContext,
        query: &str,
        threshold: f64,
        doc_filter: Option<&[String]>,
    ) -> RagResult<Vec<ScoredChunk>> {
        let query_vec = self.query_vector(ctx, query).await?;

        let mut q = ctx
            .select(VECTOR_SELECT, "e")
            .and_eq("e.model", self.provider.model_name().to_string());
        if let Some(ids) = doc_filter {
            q = q.and_in("c.document_id", ids);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut candidates = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.try_get("vector")?;
            let similarity = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
            if similarity >= threshold {
                candidates.push(ScoredChunk::from_row(row, similarity)?);
            }
        }

        sort_results(&mut candidates);
        candidates.truncate(self.settings.candidate_k.max(1));
        Ok(candidates)
    }

    async fn query_vector(&self, ctx: &TenantContext, query: &str) -> RagResult<Vec<f32>> {
        let model = self.provider.model_name();
        if let Some(v) = self.cache.get(ctx.tenant_id(), model, query).await? {
            if v.len() == self.provider.dims() {
                return Ok(v);
            }
        }
        let v = embed_query(self.provider.as_ref(), query).await?;
        if let Err(e) = self.cache.put(ctx.tenant_id(), model, query, &v).await {
            tracing::warn!(error = %e, "query embedding cache write failed");
        }
        Ok(v)
    }
}

fn sort_results(results: &mut [ScoredChunk]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.sequence_number.cmp(&b.sequence_number))
    });
}

/// Min-max normalize scores to `[0, 1]`. A set whose scores are all equal
/// normalizes to 1.0.
fn normalize_scores(candidates: &[ScoredChunk]) -> HashMap<&str, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - s_min) / (s_max - s_min)
            };
            (c.chunk_id.as_str(), norm)
        })
        .collect()
}

fn merge_hybrid(keyword: Vec<ScoredChunk>, semantic: Vec<ScoredChunk>, alpha: f64) -> Vec<ScoredChunk> {
    let (kw_map, vec_map): (HashMap<String, f64>, HashMap<String, f64>) = {
        let k = normalize_scores(&keyword)
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        let v = normalize_scores(&semantic)
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        (k, v)
    };

    let mut merged: HashMap<String, ScoredChunk> = HashMap::new();
    for chunk in keyword.into_iter().chain(semantic) {
        merged.entry(chunk.chunk_id.clone()).or_insert(chunk);
    }

    merged
        .into_values()
        .map(|mut chunk| {
            let k = kw_map.get(&chunk.chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(&chunk.chunk_id).copied().unwrap_or(0.0);
            chunk.score = (1.0 - alpha) * k + alpha * v;
            chunk
        })
        .collect()
}
