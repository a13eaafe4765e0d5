//! # RAG Harness CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and storage root |
//! | `rag tenant create\|list\|show\|status\|update` | Manage tenants |
//! | `rag upload <file> --tenant <t>` | Store a document and queue it for processing |
//! | `rag documents list\|show\|delete\|stats` | Inspect a tenant's documents |
//! | `rag worker documents\|embeddings [--once]` | Run a queue consumer |
//! | `rag embed pending` | Re-queue chunks that have no embedding |
//! | `rag search "<query>"` | Retrieval only |
//! | `rag query "<question>" [--conversation <id>]` | Retrieval plus answer generation |
//! | `rag cache clear\|purge\|stats` | Manage the TTL caches |
//! | `rag dlq list\|replay` | Inspect and replay dead-lettered messages |
//! | `rag serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! rag init
//! rag tenant create --name "Acme Corp" --slug acme
//! rag upload ./handbook.pdf --tenant acme
//! rag worker documents --once
//! rag search "refund policy" --tenant acme
//! rag query "How long is the refund window?" --tenant acme --conversation c1
//! rag query "And for digital goods?" --tenant acme --conversation c1
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rag_harness::commands::{self, SearchArgs, WorkerKind};
use rag_harness::config::{self, ChunkStrategy};
use rag_harness::logging;
use rag_harness::server;
use rag_harness::tenant::{NewTenant, TenantPatch};

/// RAG Harness: a multi-tenant retrieval-augmented generation pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "RAG Harness: multi-tenant document ingestion, retrieval, and answer generation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and storage directory.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Manage tenants.
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Upload a file for a tenant and queue it for processing.
    Upload {
        /// Path to the file.
        path: PathBuf,

        /// Tenant id or slug.
        #[arg(long)]
        tenant: String,

        /// Email of the uploading user (created on first use).
        #[arg(long, default_value = "system@local")]
        user: String,

        /// Content type; detected from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Inspect a tenant's documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Run a queue worker.
    Worker {
        #[command(subcommand)]
        kind: WorkerCommand,
    },

    /// Manage embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search a tenant's chunks without generating an answer.
    Search {
        query: String,

        #[arg(long)]
        tenant: String,

        /// `keyword`, `semantic`, or `hybrid`. Defaults to `[retrieval].mode`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity for semantic results.
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question from a tenant's documents.
    Query {
        question: String,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        mode: Option<String>,

        /// Number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        threshold: Option<f64>,

        /// Conversation id; follow-ups with the same id see earlier answers.
        #[arg(long)]
        conversation: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Manage the embedding and response caches.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect and replay dead-lettered queue messages.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Start the HTTP API server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a tenant.
    Create {
        #[arg(long)]
        name: String,
        /// Lowercase letters, digits, and dashes.
        #[arg(long)]
        slug: String,
        #[arg(long)]
        max_documents: Option<i64>,
        #[arg(long)]
        max_storage_mb: Option<i64>,
        /// FIXED_SIZE, SLIDING_WINDOW, or SEMANTIC.
        #[arg(long)]
        chunk_strategy: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },
    /// List all tenants.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one tenant.
    Show {
        tenant: String,
        #[arg(long)]
        json: bool,
    },
    /// Set a tenant's status (ACTIVE, SUSPENDED, INACTIVE).
    Status { tenant: String, status: String },
    /// Change a tenant's name, limits, or chunking overrides.
    Update {
        tenant: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        max_documents: Option<i64>,
        #[arg(long)]
        max_storage_mb: Option<i64>,
        #[arg(long)]
        chunk_strategy: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },
}

#[derive(Subcommand)]
enum DocumentsAction {
    List {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        #[arg(long)]
        json: bool,
    },
    Show {
        id: String,
        #[arg(long)]
        tenant: String,
        /// Also print every chunk.
        #[arg(long)]
        chunks: bool,
        #[arg(long)]
        json: bool,
    },
    Delete {
        id: String,
        #[arg(long)]
        tenant: String,
    },
    Stats {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Extract, chunk, and emit embedding events.
    Documents {
        /// Process one batch and exit.
        #[arg(long)]
        once: bool,
    },
    /// Embed chunks and store vectors.
    Embeddings {
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Re-queue chunks of completed documents that have no vector.
    Pending {
        /// Restrict to one tenant; all ACTIVE tenants otherwise.
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop a tenant's cached responses and embeddings.
    Clear {
        #[arg(long)]
        tenant: String,
    },
    /// Delete expired entries from every namespace.
    Purge,
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    List {
        /// `document-processing` or `chunk-embedding`.
        #[arg(long)]
        topic: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// Move a dead letter back onto its topic.
    Replay { id: i64 },
}

fn parse_strategy(value: Option<String>) -> anyhow::Result<Option<ChunkStrategy>> {
    value
        .map(|s| s.parse::<ChunkStrategy>())
        .transpose()
        .map_err(anyhow::Error::msg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Tenant { action } => match action {
            TenantAction::Create {
                name,
                slug,
                max_documents,
                max_storage_mb,
                chunk_strategy,
                chunk_size,
                chunk_overlap,
            } => {
                let new = NewTenant {
                    name,
                    slug,
                    max_documents,
                    max_storage_mb,
                    chunk_strategy: parse_strategy(chunk_strategy)?,
                    chunk_size,
                    chunk_overlap,
                };
                commands::run_tenant_create(&cfg, new).await?;
            }
            TenantAction::List { json } => commands::run_tenant_list(&cfg, json).await?,
            TenantAction::Show { tenant, json } => {
                commands::run_tenant_show(&cfg, &tenant, json).await?
            }
            TenantAction::Status { tenant, status } => {
                commands::run_tenant_status(&cfg, &tenant, &status).await?
            }
            TenantAction::Update {
                tenant,
                name,
                max_documents,
                max_storage_mb,
                chunk_strategy,
                chunk_size,
                chunk_overlap,
            } => {
                let patch = TenantPatch {
                    name,
                    max_documents,
                    max_storage_mb,
                    chunk_strategy: parse_strategy(chunk_strategy)?,
                    chunk_size,
                    chunk_overlap,
                };
                commands::run_tenant_update(&cfg, &tenant, patch).await?;
            }
        },
        Commands::Upload {
            path,
            tenant,
            user,
            content_type,
        } => {
            commands::run_upload(&cfg, &tenant, &path, &user, content_type.as_deref()).await?;
        }
        Commands::Documents { action } => match action {
            DocumentsAction::List {
                tenant,
                limit,
                offset,
                json,
            } => commands::run_documents_list(&cfg, &tenant, limit, offset, json).await?,
            DocumentsAction::Show {
                id,
                tenant,
                chunks,
                json,
            } => commands::run_documents_show(&cfg, &tenant, &id, chunks, json).await?,
            DocumentsAction::Delete { id, tenant } => {
                commands::run_documents_delete(&cfg, &tenant, &id).await?
            }
            DocumentsAction::Stats { tenant, json } => {
                commands::run_documents_stats(&cfg, &tenant, json).await?
            }
        },
        Commands::Worker { kind } => match kind {
            WorkerCommand::Documents { once } => {
                commands::run_worker(&cfg, WorkerKind::Documents, once).await?
            }
            WorkerCommand::Embeddings { once } => {
                commands::run_worker(&cfg, WorkerKind::Embeddings, once).await?
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending { tenant, limit } => {
                commands::run_embed_pending(&cfg, tenant.as_deref(), limit).await?
            }
        },
        Commands::Search {
            query,
            tenant,
            mode,
            limit,
            threshold,
            json,
        } => {
            commands::run_search(
                &cfg,
                SearchArgs {
                    tenant: &tenant,
                    query: &query,
                    mode: mode.as_deref(),
                    top_k: limit,
                    threshold,
                    conversation: None,
                    json,
                },
            )
            .await?;
        }
        Commands::Query {
            question,
            tenant,
            mode,
            top_k,
            threshold,
            conversation,
            json,
        } => {
            commands::run_query(
                &cfg,
                SearchArgs {
                    tenant: &tenant,
                    query: &question,
                    mode: mode.as_deref(),
                    top_k,
                    threshold,
                    conversation: conversation.as_deref(),
                    json,
                },
            )
            .await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear { tenant } => commands::run_cache_clear(&cfg, &tenant).await?,
            CacheAction::Purge => commands::run_cache_purge(&cfg).await?,
            CacheAction::Stats { json } => commands::run_cache_stats(&cfg, json).await?,
        },
        Commands::Dlq { action } => match action {
            DlqAction::List { topic, limit, json } => {
                commands::run_dlq_list(&cfg, topic.as_deref(), limit, json).await?
            }
            DlqAction::Replay { id } => commands::run_dlq_replay(&cfg, id).await?,
        },
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
