//! CLI command implementations for the `rag` binary.
//!
//! Each `run_*` function opens the database, performs one operation
//! through the library services, and prints a human-readable summary to
//! stdout. `--json` variants print the service's serialized output instead.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::{self, EmbeddingCache, ResponseCache};
use crate::config::{Config, SearchMode};
use crate::db;
use crate::documents::{self, Upload};
use crate::embedding::create_provider;
use crate::ingest::DocumentWorker;
use crate::llm::create_generator;
use crate::migrate;
use crate::queue::{BatchStats, MessageQueue, SqliteQueue};
use crate::rag::{RagQueryRequest, RagService};
use crate::search::SearchRequest;
use crate::server::shutdown_signal;
use crate::tenant::{self, NewTenant, Tenant, TenantContext, TenantPatch, TenantStatus};
use crate::worker::{embed_pending, EmbeddingWorker};

async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}

async fn scope(pool: &SqlitePool, config: &Config, tenant: &str) -> Result<TenantContext> {
    TenantContext::resolve(pool, tenant, &config.chunking)
        .await
        .with_context(|| format!("cannot act on tenant '{}'", tenant))
}

fn parse_mode(mode: Option<&str>) -> Result<Option<SearchMode>> {
    mode.map(|m| m.parse::<SearchMode>())
        .transpose()
        .map_err(anyhow::Error::msg)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============ init ============

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    std::fs::create_dir_all(&config.storage.root).with_context(|| {
        format!(
            "Failed to create storage root: {}",
            config.storage.root.display()
        )
    })?;
    println!("Database initialized successfully.");
    Ok(())
}

// ============ tenant ============

pub async fn run_tenant_create(config: &Config, new: NewTenant) -> Result<()> {
    let pool = open(config).await?;
    let tenant = tenant::create_tenant(&pool, &new, &config.chunking).await?;
    println!("Created tenant {} ({})", tenant.slug, tenant.id);
    pool.close().await;
    Ok(())
}

pub async fn run_tenant_list(config: &Config, json: bool) -> Result<()> {
    let pool = open(config).await?;
    let tenants = tenant::list_tenants(&pool).await?;
    pool.close().await;

    if json {
        return print_json(&tenants);
    }
    if tenants.is_empty() {
        println!("No tenants.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<20} {:<10} {:>8} {:>10}",
        "ID", "SLUG", "STATUS", "MAX DOCS", "MAX MB"
    );
    println!("{}", "-".repeat(90));
    for t in &tenants {
        println!(
            "{:<36}  {:<20} {:<10} {:>8} {:>10}",
            t.id, t.slug, t.status.as_str(), t.max_documents, t.max_storage_mb
        );
    }
    Ok(())
}

fn print_tenant(config: &Config, t: &Tenant) {
    let chunking = t.chunking(&config.chunking);
    println!("Tenant:    {} ({})", t.name, t.slug);
    println!("ID:        {}", t.id);
    println!("Status:    {}", t.status);
    println!(
        "Limits:    {} documents, {} MB",
        t.max_documents, t.max_storage_mb
    );
    println!(
        "Chunking:  {} size={} overlap={}",
        chunking.strategy.as_str(),
        chunking.chunk_size,
        chunking.overlap
    );
    println!("Created:   {}", format_ts(t.created_at));
}

pub async fn run_tenant_show(config: &Config, id_or_slug: &str, json: bool) -> Result<()> {
    let pool = open(config).await?;
    let t = tenant::find_tenant(&pool, id_or_slug).await?;
    pool.close().await;
    if json {
        return print_json(&t);
    }
    print_tenant(config, &t);
    Ok(())
}

pub async fn run_tenant_status(config: &Config, id_or_slug: &str, status: &str) -> Result<()> {
    let status: TenantStatus = status.parse().map_err(anyhow::Error::msg)?;
    let pool = open(config).await?;
    let t = tenant::set_status(&pool, id_or_slug, status).await?;
    pool.close().await;
    println!("Tenant {} is now {}", t.slug, t.status);
    Ok(())
}

pub async fn run_tenant_update(config: &Config, id_or_slug: &str, patch: TenantPatch) -> Result<()> {
    let pool = open(config).await?;
    let t = tenant::update_tenant(&pool, id_or_slug, &patch, &config.chunking).await?;
    pool.close().await;
    print_tenant(config, &t);
    Ok(())
}

// ============ documents ============

pub async fn run_upload(
    config: &Config,
    tenant: &str,
    path: &Path,
    email: &str,
    content_type: Option<&str>,
) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid file name: {}", path.display()))?;

    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    let user_id = tenant::ensure_user(&pool, &ctx, email).await?;
    let doc = documents::upload_document(
        &pool,
        config,
        &ctx,
        &user_id,
        Upload {
            original_filename: filename,
            content_type: content_type.unwrap_or(""),
            bytes: &bytes,
        },
    )
    .await?;
    pool.close().await;

    println!(
        "Uploaded {} ({}, {}) as {} [{}]",
        doc.original_filename,
        doc.document_type.as_str(),
        format_bytes(doc.file_size.max(0) as u64),
        doc.id,
        doc.processing_status.as_str()
    );
    Ok(())
}

pub async fn run_documents_list(
    config: &Config,
    tenant: &str,
    limit: i64,
    offset: i64,
    json: bool,
) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    let docs = documents::list_documents(&pool, &ctx, limit, offset).await?;
    pool.close().await;

    if json {
        return print_json(&docs);
    }
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<30} {:<11} {:>7} {:>10}",
        "ID", "FILENAME", "STATUS", "CHUNKS", "SIZE"
    );
    println!("{}", "-".repeat(100));
    for d in &docs {
        println!(
            "{:<36}  {:<30} {:<11} {:>7} {:>10}",
            d.id,
            truncate(&d.original_filename, 30),
            d.processing_status.as_str(),
            d.chunk_count,
            format_bytes(d.file_size.max(0) as u64)
        );
    }
    Ok(())
}

pub async fn run_documents_show(
    config: &Config,
    tenant: &str,
    id: &str,
    with_chunks: bool,
    json: bool,
) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    let doc = documents::get_document(&pool, &ctx, id).await?;
    let chunks = if with_chunks {
        documents::list_chunks(&pool, &ctx, id).await?
    } else {
        Vec::new()
    };
    pool.close().await;

    if json {
        return print_json(&serde_json::json!({ "document": doc, "chunks": chunks }));
    }

    println!("Document:  {}", doc.original_filename);
    println!("ID:        {}", doc.id);
    println!("Type:      {} ({})", doc.document_type.as_str(), doc.content_type);
    println!("Size:      {}", format_bytes(doc.file_size.max(0) as u64));
    println!("Status:    {}", doc.processing_status.as_str());
    if let Some(message) = &doc.processing_message {
        println!("Message:   {}", message);
    }
    println!("Chunks:    {}", doc.chunk_count);
    println!("Uploaded:  {}", format_ts(doc.created_at));

    for chunk in &chunks {
        println!();
        println!(
            "--- chunk {} [{}..{}] ~{} tokens{} ---",
            chunk.sequence_number,
            chunk.start_offset,
            chunk.end_offset,
            chunk.token_count,
            if chunk.embedding_id.is_some() { ", embedded" } else { "" }
        );
        println!("{}", chunk.content);
    }
    Ok(())
}

pub async fn run_documents_delete(config: &Config, tenant: &str, id: &str) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    documents::delete_document(&pool, config, &ctx, id).await?;
    pool.close().await;
    println!("Deleted document {}", id);
    Ok(())
}

pub async fn run_documents_stats(config: &Config, tenant: &str, json: bool) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    let stats = documents::document_stats(&pool, &ctx).await?;
    pool.close().await;

    if json {
        return print_json(&stats);
    }
    println!("Document stats for tenant {}", ctx.slug());
    println!();
    println!("  Documents:   {}", stats.total_documents);
    println!(
        "    pending {} / processing {} / completed {} / failed {}",
        stats.pending, stats.processing, stats.completed, stats.failed
    );
    println!(
        "  Storage:     {} of {}",
        format_bytes(stats.storage_bytes.max(0) as u64),
        format_bytes(ctx.max_storage_bytes().max(0) as u64)
    );
    println!("  Chunks:      {}", stats.total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.total_chunks,
        if stats.total_chunks > 0 {
            (stats.embedded_chunks * 100) / stats.total_chunks
        } else {
            0
        }
    );
    Ok(())
}

// ============ workers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Documents,
    Embeddings,
}

fn print_batch(kind: WorkerKind, stats: &BatchStats) {
    println!(
        "{:?} worker: claimed {}, succeeded {}, retried {}, dead-lettered {}",
        kind, stats.claimed, stats.succeeded, stats.retried, stats.dead_lettered
    );
}

pub async fn run_worker(config: &Config, kind: WorkerKind, once: bool) -> Result<()> {
    let pool = open(config).await?;
    let config = Arc::new(config.clone());
    let queue: Arc<dyn MessageQueue> =
        Arc::new(SqliteQueue::new(pool.clone(), config.queue.clone()));
    let batch = config.queue.claim_batch.max(1);

    let (stop_tx, stop_rx) = watch::channel(false);
    if !once {
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        });
    }

    let stats = match kind {
        WorkerKind::Documents => {
            let worker = DocumentWorker::new(pool.clone(), config.clone(), queue);
            if once {
                worker.run_once(batch).await?
            } else {
                worker.run(stop_rx).await
            }
        }
        WorkerKind::Embeddings => {
            let provider = create_provider(&config.embedding)?;
            if provider.dims() == 0 {
                bail!("embeddings are disabled; configure [embedding] to run this worker");
            }
            let worker = EmbeddingWorker::new(pool.clone(), config.clone(), queue, provider);
            if once {
                worker.run_once(batch).await?
            } else {
                worker.run(stop_rx).await
            }
        }
    };

    pool.close().await;
    print_batch(kind, &stats);
    Ok(())
}

pub async fn run_embed_pending(config: &Config, tenant: Option<&str>, limit: i64) -> Result<()> {
    let pool = open(config).await?;
    let queue = SqliteQueue::new(pool.clone(), config.queue.clone());

    let targets: Vec<String> = match tenant {
        Some(t) => vec![t.to_string()],
        None => tenant::list_tenants(&pool)
            .await?
            .into_iter()
            .filter(|t| t.status == TenantStatus::Active)
            .map(|t| t.id)
            .collect(),
    };

    let mut total = 0usize;
    for target in &targets {
        let ctx = scope(&pool, config, target).await?;
        let published = embed_pending(&pool, &queue, &ctx, limit).await?;
        if published > 0 {
            println!("{}: queued {} chunks", ctx.slug(), published);
        }
        total += published;
    }
    pool.close().await;

    println!("Queued {} chunks for embedding.", total);
    Ok(())
}

// ============ search / query ============

pub struct SearchArgs<'a> {
    pub tenant: &'a str,
    pub query: &'a str,
    pub mode: Option<&'a str>,
    pub top_k: Option<usize>,
    pub threshold: Option<f64>,
    /// Only used by `query`.
    pub conversation: Option<&'a str>,
    pub json: bool,
}

fn rag_service(pool: &SqlitePool, config: &Config) -> Result<RagService> {
    let config = Arc::new(config.clone());
    let embedder = create_provider(&config.embedding)?;
    let generator = create_generator(&config.llm)?;
    Ok(RagService::new(pool.clone(), config, embedder, generator))
}

pub async fn run_search(config: &Config, args: SearchArgs<'_>) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, args.tenant).await?;
    let service = rag_service(&pool, config)?;
    let results = service
        .retriever()
        .search(
            &ctx,
            &SearchRequest {
                query: args.query.to_string(),
                top_k: args.top_k,
                similarity_threshold: args.threshold,
                mode: parse_mode(args.mode)?,
                document_ids: None,
            },
        )
        .await?;
    pool.close().await;

    if args.json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{} ({})",
            i + 1,
            r.score,
            r.filename,
            r.sequence_number,
            r.document_id
        );
        println!("    {}", truncate(&r.content.replace('\n', " "), 160));
    }
    Ok(())
}

pub async fn run_query(config: &Config, args: SearchArgs<'_>) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, args.tenant).await?;
    let service = rag_service(&pool, config)?;
    let response = service
        .query(
            &ctx,
            &RagQueryRequest {
                query: args.query.to_string(),
                top_k: args.top_k,
                similarity_threshold: args.threshold,
                mode: parse_mode(args.mode)?,
                document_ids: None,
                conversation_id: args.conversation.map(str::to_string),
            },
        )
        .await?;
    pool.close().await;

    if args.json {
        return print_json(&response);
    }
    println!("{}", response.answer);
    println!();
    println!(
        "confidence {:.2} · {} ms · {} of {} chunks{}",
        response.confidence,
        response.metrics.total_ms,
        response.metrics.chunks_used,
        response.metrics.chunks_retrieved,
        if response.metrics.cache_hit { " · cached" } else { "" }
    );
    for source in &response.sources {
        println!(
            "  - {} #{} [{:.3}]",
            source.filename, source.sequence_number, source.relevance_score
        );
    }
    Ok(())
}

// ============ cache ============

pub async fn run_cache_clear(config: &Config, tenant: &str) -> Result<()> {
    let pool = open(config).await?;
    let ctx = scope(&pool, config, tenant).await?;
    let ttl = std::time::Duration::from_secs(config.cache.response_ttl_secs);
    let cleared = ResponseCache::new(pool.clone(), ttl)
        .clear_tenant(ctx.tenant_id())
        .await?;
    let embeddings = EmbeddingCache::new(
        pool.clone(),
        std::time::Duration::from_secs(config.cache.embedding_ttl_secs),
    )
    .invalidate_tenant(ctx.tenant_id())
    .await?;
    pool.close().await;
    println!(
        "Cleared {} cached responses and {} cached embeddings for {}",
        cleared,
        embeddings,
        ctx.slug()
    );
    Ok(())
}

pub async fn run_cache_purge(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let purged = cache::purge_expired(&pool).await?;
    pool.close().await;
    println!("Purged {} expired cache entries.", purged);
    Ok(())
}

pub async fn run_cache_stats(config: &Config, json: bool) -> Result<()> {
    let pool = open(config).await?;
    let embedding = EmbeddingCache::new(
        pool.clone(),
        std::time::Duration::from_secs(config.cache.embedding_ttl_secs),
    )
    .stats()
    .await?;
    let response = ResponseCache::new(
        pool.clone(),
        std::time::Duration::from_secs(config.cache.response_ttl_secs),
    )
    .stats()
    .await?;
    pool.close().await;

    let all = [embedding, response];
    if json {
        return print_json(&all);
    }
    println!("{:<12} {:>8} {:>8} {:>10}", "NAMESPACE", "LIVE", "EXPIRED", "SIZE");
    for s in &all {
        println!(
            "{:<12} {:>8} {:>8} {:>10}",
            s.namespace,
            s.live,
            s.expired,
            format_bytes(s.bytes.max(0) as u64)
        );
    }
    Ok(())
}

// ============ dlq ============

pub async fn run_dlq_list(config: &Config, topic: Option<&str>, limit: i64, json: bool) -> Result<()> {
    let pool = open(config).await?;
    let queue = SqliteQueue::new(pool.clone(), config.queue.clone());
    let letters = queue.dead_letters(topic, limit).await?;
    pool.close().await;

    if json {
        return print_json(&letters);
    }
    if letters.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }
    for l in &letters {
        println!(
            "#{} {} key={} attempts={} at {}",
            l.id,
            l.topic,
            l.key,
            l.attempts,
            format_ts(l.failed_at / 1000)
        );
        println!("    {}", truncate(&l.error, 160));
    }
    Ok(())
}

pub async fn run_dlq_replay(config: &Config, id: i64) -> Result<()> {
    let pool = open(config).await?;
    let queue = SqliteQueue::new(pool.clone(), config.queue.clone());
    let replayed = queue.replay_dead_letter(id).await?;
    pool.close().await;
    if !replayed {
        bail!("dead letter not found: {}", id);
    }
    println!("Re-queued dead letter #{}", id);
    Ok(())
}

// ============ formatting ============

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo wörld", 6), "héllo…");
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(None).unwrap(), None);
        assert_eq!(parse_mode(Some("hybrid")).unwrap(), Some(SearchMode::Hybrid));
        assert!(parse_mode(Some("fuzzy")).is_err());
    }
}
