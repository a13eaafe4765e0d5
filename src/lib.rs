//! # RAG Harness
//!
//! A multi-tenant retrieval-augmented generation pipeline.
//!
//! Documents uploaded for a tenant are stored, extracted, chunked, and
//! embedded asynchronously through a durable queue. Queries retrieve the
//! tenant's most relevant chunks, assemble a bounded context, and ask a
//! language model for an answer. Every tenant-owned read and write goes
//! through a [`tenant::TenantContext`], so no query can cross tenants.
//!
//! ## Architecture
//!
//! ```text
//! upload ──▶ documents ──(document-processing)──▶ ingest ──(chunk-embedding)──▶ worker
//!                │                                  │                            │
//!                ▼                                  ▼                            ▼
//!            storage/                         document_chunks            chunk_embeddings
//!                                                   │                            │
//! query ──▶ rag ──▶ search (keyword | semantic | hybrid) ◀───────────────────────┘
//!            │
//!            ├──▶ query (rewrite) + conversation (history)
//!            ├──▶ context ──▶ llm
//!            └──▶ cache (responses, embeddings, conversations)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types and queue events |
//! | [`tenant`] | Tenant registry and the tenant-scoped query builder |
//! | [`documents`] | Upload, lookup, listing, deletion |
//! | [`extract`] | Text extraction per document type |
//! | [`chunk`] | Fixed-size, sliding-window, and semantic chunking |
//! | [`queue`] | Durable at-least-once message queue |
//! | [`ingest`] | Document processing worker |
//! | [`http`] | Shared HTTP client and retry policy |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`worker`] | Embedding worker |
//! | [`cache`] | TTL caches for embeddings and responses |
//! | [`search`] | Tenant-scoped retrieval |
//! | [`context`] | Context assembly under a token budget |
//! | [`llm`] | Answer generation providers |
//! | [`query`] | Query clean-up before retrieval |
//! | [`conversation`] | Conversation history for follow-up questions |
//! | [`rag`] | Query orchestration |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |
//! | [`commands`] | CLI command implementations |

pub mod cache;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod context;
pub mod conversation;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod query;
pub mod queue;
pub mod rag;
pub mod search;
pub mod server;
pub mod tenant;
pub mod worker;
