//! HTTP API tests against a server bound to an ephemeral port.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use rag_harness::config::Config;
use rag_harness::embedding::{create_provider, EmbeddingProvider};
use rag_harness::error::{RagError, RagResult};
use rag_harness::llm::create_generator;
use rag_harness::server::{self, AppState};
use rag_harness::{db, migrate};

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// An embedding provider whose every call fails.
struct UnreachableEmbedder;

#[async_trait]
impl EmbeddingProvider for UnreachableEmbedder {
    fn model_name(&self) -> &str {
        "unreachable"
    }

    fn dims(&self) -> usize {
        8
    }

    async fn embed(&self, _texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Err(RagError::upstream("connection refused"))
    }
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(None).await
    }

    async fn start_with(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.storage.max_file_size_bytes = 4096;
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        let embedder = embedder.unwrap_or_else(|| create_provider(&config.embedding).unwrap());
        let generator = create_generator(&config.llm).unwrap();
        let state = AppState::with_providers(pool, Arc::new(config), embedder, generator);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(listener, state, async move {
            let _ = stopped.await;
        }));

        Self {
            _tmp: tmp,
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            stop: Some(stop),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create_tenant(&self, slug: &str) -> Value {
        let resp = self
            .client
            .post(self.url("/api/v1/tenants"))
            .json(&json!({ "name": format!("{} inc", slug), "slug": slug }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    async fn upload(&self, tenant: &str, filename: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/api/v1/documents?filename={}", filename)))
            .header("X-Tenant-ID", tenant)
            .header("X-User-Email", "ops@example.com")
            .header("Content-Type", "text/plain")
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

fn assert_error(body: &Value, code: &str) {
    assert_eq!(body["error"]["code"], code, "body={}", body);
    assert!(body["error"]["message"].as_str().is_some());
    assert!(!body["error"]["request_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn health_and_ready() {
    let server = TestServer::start().await;

    let health: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let ready: Value = server
        .client
        .get(server.url("/ready"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["queues"]["document-processing"]["pending"], 0);
    assert_eq!(ready["queues"]["chunk-embedding"]["dead"], 0);

    server.shutdown().await;
}

#[tokio::test]
async fn tenant_lifecycle() {
    let server = TestServer::start().await;
    let created = server.create_tenant("acme").await;
    assert_eq!(created["slug"], "acme");
    assert_eq!(created["status"], "ACTIVE");

    let dup = server
        .client
        .post(server.url("/api/v1/tenants"))
        .json(&json!({ "name": "again", "slug": "acme" }))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 400);
    assert_error(&dup.json().await.unwrap(), "bad_request");

    let suspended: Value = server
        .client
        .patch(server.url("/api/v1/tenants/acme/status"))
        .json(&json!({ "status": "SUSPENDED" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(suspended["status"], "SUSPENDED");

    let blocked = server.upload("acme", "a.txt", "hello").await;
    assert_eq!(blocked.status(), 403);
    assert_error(&blocked.json().await.unwrap(), "tenant_inactive");

    let list: Value = server
        .client
        .get(server.url("/api/v1/tenants"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["tenants"].as_array().unwrap().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn tenant_header_is_required() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .get(server.url("/api/v1/documents"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_error(&body, "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("X-Tenant-ID"));

    let unknown = server
        .client
        .get(server.url("/api/v1/documents"))
        .header("X-Tenant-ID", "nobody")
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn documents_are_tenant_scoped() {
    let server = TestServer::start().await;
    server.create_tenant("acme").await;
    server.create_tenant("globex").await;

    let resp = server
        .upload("acme", "notes.txt", "Quarterly notes about refunds.")
        .await;
    assert_eq!(resp.status(), 201);
    let doc: Value = resp.json().await.unwrap();
    assert_eq!(doc["processing_status"], "PENDING");
    assert_eq!(doc["original_filename"], "notes.txt");
    let id = doc["id"].as_str().unwrap().to_string();

    let own = server
        .client
        .get(server.url(&format!("/api/v1/documents/{}", id)))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(own.status(), 200);

    let other = server
        .client
        .get(server.url(&format!("/api/v1/documents/{}", id)))
        .header("X-Tenant-ID", "globex")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 404);
    assert_error(&other.json().await.unwrap(), "not_found");

    let listed: Value = server
        .client
        .get(server.url("/api/v1/documents?limit=10"))
        .header("X-Tenant-ID", "globex")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed["documents"].as_array().unwrap().is_empty());
    assert_eq!(listed["limit"], 10);

    let clamped: Value = server
        .client
        .get(server.url("/api/v1/documents?limit=100000"))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(clamped["limit"], 500);
    assert_eq!(clamped["documents"].as_array().unwrap().len(), 1);

    let deleted = server
        .client
        .delete(server.url(&format!("/api/v1/documents/{}", id)))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    server.shutdown().await;
}

#[tokio::test]
async fn upload_validation_errors() {
    let server = TestServer::start().await;
    server.create_tenant("acme").await;

    let empty = server.upload("acme", "empty.txt", "").await;
    assert_eq!(empty.status(), 400);
    assert_error(&empty.json().await.unwrap(), "bad_request");

    let big = server.upload("acme", "big.txt", &"x".repeat(5000)).await;
    assert_eq!(big.status(), 400);
    let body: Value = big.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("exceeds the maximum"));

    server.shutdown().await;
}

#[tokio::test]
async fn query_without_documents_has_no_context() {
    let server = TestServer::start().await;
    server.create_tenant("acme").await;

    let resp = server
        .client
        .post(server.url("/api/v1/query"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "what is the refund window?", "mode": "keyword" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "NO_CONTEXT");
    assert_eq!(body["sources"].as_array().unwrap().len(), 0);

    let empty = server
        .client
        .post(server.url("/api/v1/query"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), 400);

    let semantic = server
        .client
        .post(server.url("/api/v1/search"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "refund", "mode": "semantic" }))
        .send()
        .await
        .unwrap();
    assert_eq!(semantic.status(), 400);

    server.shutdown().await;
}

#[tokio::test]
async fn failed_query_reports_its_own_request_id() {
    let server = TestServer::start_with(Some(Arc::new(UnreachableEmbedder))).await;
    server.create_tenant("acme").await;

    let resp = server
        .client
        .post(server.url("/api/v1/query"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "refund window", "mode": "semantic" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_error(&body, "processing_failed");

    let request_id = body["error"]["request_id"].as_str().unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert_eq!(
        message,
        format!("failed to process query (request {})", request_id)
    );

    server.shutdown().await;
}

#[tokio::test]
async fn conversation_endpoints() {
    let server = TestServer::start().await;
    server.create_tenant("acme").await;

    let missing = server
        .client
        .get(server.url("/api/v1/conversations/chat-1"))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    assert_error(&missing.json().await.unwrap(), "not_found");

    let bad = server
        .client
        .post(server.url("/api/v1/query"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "refunds", "conversation_id": "not valid!" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    let answered: Value = server
        .client
        .post(server.url("/api/v1/query"))
        .header("X-Tenant-ID", "acme")
        .json(&json!({ "query": "refunds", "mode": "keyword", "conversation_id": "chat-1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(answered["status"], "NO_CONTEXT");
    assert_eq!(answered["conversation_id"], "chat-1");

    // Unanswered questions are not recorded.
    let still_missing = server
        .client
        .get(server.url("/api/v1/conversations/chat-1"))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(still_missing.status(), 404);

    let delete = server
        .client
        .delete(server.url("/api/v1/conversations/chat-1"))
        .header("X-Tenant-ID", "acme")
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), 404);

    server.shutdown().await;
}
