use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("notes.csv"), "a,b,c\n1,2,3\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/rag.sqlite"

[storage]
root = "{root}/uploads"

[chunking]
strategy = "FIXED_SIZE"
chunk_size = 64
overlap = 8

[retrieval]
top_k = 5

[queue]
max_attempts = 3
retry_base_ms = 10
retry_max_ms = 50

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = root.join("config").join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn must(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, success) = run_rag(config_path, args);
    assert!(
        success,
        "rag {:?} failed: stdout={}, stderr={}",
        args, stdout, stderr
    );
    stdout
}

fn file(config_path: &Path, name: &str) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join("files").join(name).to_str().unwrap().to_string()
}

/// Init, create a tenant, upload the three sample files, and process them.
fn seeded(slug: &str) -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);
    must(
        &config_path,
        &["tenant", "create", "--name", "Tenant Under Test", "--slug", slug],
    );
    for name in ["alpha.md", "beta.md", "gamma.txt"] {
        must(
            &config_path,
            &["upload", &file(&config_path, name), "--tenant", slug],
        );
    }
    must(&config_path, &["worker", "documents", "--once"]);
    (tmp, config_path)
}

fn documents_json(config_path: &Path, tenant: &str) -> Vec<serde_json::Value> {
    let stdout = must(
        config_path,
        &["documents", "list", "--tenant", tenant, "--json"],
    );
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_rag(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_rag(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_tenant_create_and_list() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);

    let stdout = must(
        &config_path,
        &["tenant", "create", "--name", "Acme Corp", "--slug", "acme"],
    );
    assert!(stdout.contains("Created tenant acme"));

    let stdout = must(&config_path, &["tenant", "list"]);
    assert!(stdout.contains("acme"));
    assert!(stdout.contains("ACTIVE"));
}

#[test]
fn test_duplicate_slug_rejected() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);
    must(
        &config_path,
        &["tenant", "create", "--name", "Acme Corp", "--slug", "acme"],
    );

    let (_, stderr, success) = run_rag(
        &config_path,
        &["tenant", "create", "--name", "Acme Again", "--slug", "acme"],
    );
    assert!(!success);
    assert!(stderr.contains("already taken"), "stderr={}", stderr);
}

#[test]
fn test_invalid_slug_rejected() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);

    let (_, _, success) = run_rag(
        &config_path,
        &["tenant", "create", "--name", "Bad Slug", "--slug", "Bad Slug!"],
    );
    assert!(!success);
}

#[test]
fn test_upload_and_process() {
    let (_tmp, config_path) = seeded("acme");

    let docs = documents_json(&config_path, "acme");
    assert_eq!(docs.len(), 3);
    for doc in &docs {
        assert_eq!(doc["processing_status"], "COMPLETED", "doc={}", doc);
        assert!(doc["chunk_count"].as_i64().unwrap() >= 1);
    }
}

#[test]
fn test_unsupported_type_rejected() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);
    must(
        &config_path,
        &["tenant", "create", "--name", "Acme Corp", "--slug", "acme"],
    );

    let (_, stderr, success) = run_rag(
        &config_path,
        &["upload", &file(&config_path, "notes.csv"), "--tenant", "acme"],
    );
    assert!(!success);
    assert!(stderr.contains("unsupported"), "stderr={}", stderr);
    assert!(documents_json(&config_path, "acme").is_empty());
}

#[test]
fn test_keyword_search() {
    let (_tmp, config_path) = seeded("acme");

    let stdout = must(
        &config_path,
        &["search", "kubernetes docker", "--tenant", "acme"],
    );
    assert!(stdout.contains("gamma.txt"), "stdout={}", stdout);
    assert!(!stdout.contains("alpha.md"));
}

#[test]
fn test_search_is_tenant_scoped() {
    let (_tmp, config_path) = seeded("acme");
    must(
        &config_path,
        &["tenant", "create", "--name", "Globex Inc", "--slug", "globex"],
    );

    let stdout = must(&config_path, &["search", "kubernetes", "--tenant", "globex"]);
    assert!(stdout.contains("No results."), "stdout={}", stdout);
}

#[test]
fn test_semantic_search_requires_embeddings() {
    let (_tmp, config_path) = seeded("acme");

    let (_, stderr, success) = run_rag(
        &config_path,
        &["search", "rust", "--tenant", "acme", "--mode", "semantic"],
    );
    assert!(!success);
    assert!(stderr.contains("requires embeddings"), "stderr={}", stderr);
}

#[test]
fn test_query_without_context_returns_canned_answer() {
    let (_tmp, config_path) = seeded("acme");

    // No LLM is configured; the no-context path must not need one.
    let stdout = must(
        &config_path,
        &["query", "quantum chromodynamics", "--tenant", "acme", "--json"],
    );
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["status"], "NO_CONTEXT");
    assert_eq!(response["confidence"], 0.0);
    assert!(response["answer"]
        .as_str()
        .unwrap()
        .contains("couldn't find any relevant information"));
}

#[test]
fn test_query_generation_failure_is_generic() {
    let (_tmp, config_path) = seeded("acme");

    let (_, stderr, success) = run_rag(&config_path, &["query", "cargo", "--tenant", "acme"]);
    assert!(!success);
    assert!(stderr.contains("failed to process query"), "stderr={}", stderr);
}

#[test]
fn test_query_rejects_empty() {
    let (_tmp, config_path) = seeded("acme");

    let (_, stderr, success) = run_rag(&config_path, &["query", "   ", "--tenant", "acme"]);
    assert!(!success);
    assert!(stderr.contains("must not be empty"), "stderr={}", stderr);
}

#[test]
fn test_suspended_tenant_cannot_upload() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);
    must(
        &config_path,
        &["tenant", "create", "--name", "Acme Corp", "--slug", "acme"],
    );
    must(&config_path, &["tenant", "status", "acme", "suspended"]);

    let (_, stderr, success) = run_rag(
        &config_path,
        &["upload", &file(&config_path, "alpha.md"), "--tenant", "acme"],
    );
    assert!(!success);
    assert!(stderr.contains("not active"), "stderr={}", stderr);
}

#[test]
fn test_document_limit_enforced() {
    let (_tmp, config_path) = setup_test_env();
    must(&config_path, &["init"]);
    must(
        &config_path,
        &[
            "tenant",
            "create",
            "--name",
            "Tiny Tenant",
            "--slug",
            "tiny",
            "--max-documents",
            "1",
        ],
    );
    must(
        &config_path,
        &["upload", &file(&config_path, "alpha.md"), "--tenant", "tiny"],
    );

    let (_, stderr, success) = run_rag(
        &config_path,
        &["upload", &file(&config_path, "beta.md"), "--tenant", "tiny"],
    );
    assert!(!success);
    assert!(stderr.contains("limit exceeded"), "stderr={}", stderr);
}

#[test]
fn test_documents_show_and_delete() {
    let (_tmp, config_path) = seeded("acme");
    let docs = documents_json(&config_path, "acme");
    let id = docs[0]["id"].as_str().unwrap().to_string();

    let stdout = must(
        &config_path,
        &["documents", "show", &id, "--tenant", "acme", "--chunks"],
    );
    assert!(stdout.contains("COMPLETED"));
    assert!(stdout.contains("--- chunk 0"));

    must(&config_path, &["documents", "delete", &id, "--tenant", "acme"]);
    assert_eq!(documents_json(&config_path, "acme").len(), 2);

    let (_, _, success) = run_rag(
        &config_path,
        &["documents", "show", &id, "--tenant", "acme"],
    );
    assert!(!success);
}

#[test]
fn test_documents_stats() {
    let (_tmp, config_path) = seeded("acme");

    let stdout = must(
        &config_path,
        &["documents", "stats", "--tenant", "acme", "--json"],
    );
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["total_documents"], 3);
    assert_eq!(stats["completed"], 3);
    assert_eq!(stats["embedded_chunks"], 0);
}

#[test]
fn test_dlq_and_cache_commands() {
    let (_tmp, config_path) = seeded("acme");

    let stdout = must(&config_path, &["dlq", "list"]);
    assert!(stdout.contains("empty"));

    let stdout = must(&config_path, &["cache", "stats"]);
    assert!(stdout.contains("embedding"));
    assert!(stdout.contains("rag"));

    must(&config_path, &["cache", "purge"]);
    must(&config_path, &["cache", "clear", "--tenant", "acme"]);
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_rag(Path::new("/nonexistent/rag.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
