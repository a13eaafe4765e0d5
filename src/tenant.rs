//! Tenants and the mandatory tenant scope.
//!
//! Every read or write of tenant-owned rows goes through a [`TenantContext`].
//! The context can only be obtained by resolving a tenant that exists (and,
//! for request paths, is ACTIVE), and the [`TenantQuery`] builder it hands
//! out always emits the `tenant_id` predicate before any caller-supplied
//! condition. A query that forgets the tenant filter cannot be built.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteQueryResult, SqliteRow};
use sqlx::{Encode, Executor, QueryBuilder, Row, Sqlite, SqlitePool, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::{ChunkStrategy, ChunkingConfig};
use crate::error::{RagError, RagResult};

const DEFAULT_MAX_DOCUMENTS: i64 = 1000;
const DEFAULT_MAX_STORAGE_MB: i64 = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Active,
    Suspended,
    Inactive,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "ACTIVE",
            TenantStatus::Suspended => "SUSPENDED",
            TenantStatus::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(TenantStatus::Active),
            "SUSPENDED" => Ok(TenantStatus::Suspended),
            "INACTIVE" => Ok(TenantStatus::Inactive),
            other => Err(format!(
                "unknown tenant status '{}': expected ACTIVE, SUSPENDED, or INACTIVE",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub status: TenantStatus,
    pub max_documents: i64,
    pub max_storage_mb: i64,
    pub chunk_strategy: Option<ChunkStrategy>,
    pub chunk_size: Option<i64>,
    pub chunk_overlap: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tenant {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let strategy: Option<String> = row.try_get("chunk_strategy")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            status: status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })?,
            max_documents: row.try_get("max_documents")?,
            max_storage_mb: row.try_get("max_storage_mb")?,
            chunk_strategy: strategy.and_then(|s| s.parse().ok()),
            chunk_size: row.try_get("chunk_size")?,
            chunk_overlap: row.try_get("chunk_overlap")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// The tenant's overrides layered on top of the configured defaults.
    pub fn chunking(&self, defaults: &ChunkingConfig) -> ChunkingConfig {
        ChunkingConfig {
            strategy: self.chunk_strategy.unwrap_or(defaults.strategy),
            chunk_size: self
                .chunk_size
                .map(|v| v as usize)
                .unwrap_or(defaults.chunk_size),
            overlap: self
                .chunk_overlap
                .map(|v| v as usize)
                .unwrap_or(defaults.overlap),
        }
    }
}

/// Input for [`create_tenant`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NewTenant {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub max_documents: Option<i64>,
    #[serde(default)]
    pub max_storage_mb: Option<i64>,
    #[serde(default)]
    pub chunk_strategy: Option<ChunkStrategy>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

/// Slugs are 2..=50 characters of `[a-z0-9-]`.
pub fn validate_slug(slug: &str) -> RagResult<()> {
    let len = slug.chars().count();
    if !(2..=50).contains(&len) {
        return Err(RagError::validation(
            "slug must be between 2 and 50 characters",
        ));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(RagError::validation(
            "slug may only contain lowercase letters, digits, and hyphens",
        ));
    }
    Ok(())
}

fn validate_new_tenant(new: &NewTenant, defaults: &ChunkingConfig) -> RagResult<()> {
    let name_len = new.name.trim().chars().count();
    if !(2..=100).contains(&name_len) {
        return Err(RagError::validation(
            "name must be between 2 and 100 characters",
        ));
    }
    validate_slug(&new.slug)?;
    if new.max_documents.is_some_and(|v| v < 1) {
        return Err(RagError::validation("max_documents must be >= 1"));
    }
    if new.max_storage_mb.is_some_and(|v| v < 1) {
        return Err(RagError::validation("max_storage_mb must be >= 1"));
    }
    let effective = ChunkingConfig {
        strategy: new.chunk_strategy.unwrap_or(defaults.strategy),
        chunk_size: new.chunk_size.unwrap_or(defaults.chunk_size),
        overlap: new.chunk_overlap.unwrap_or(defaults.overlap),
    };
    effective.validate().map_err(RagError::Validation)
}

/// Create an ACTIVE tenant, filling unset limits and chunking from defaults.
///
/// # Errors
///
/// [`RagError::Validation`] for a bad name, slug, limit, or chunking
/// override, or when the slug is already taken.
pub async fn create_tenant(
    pool: &SqlitePool,
    new: &NewTenant,
    defaults: &ChunkingConfig,
) -> RagResult<Tenant> {
    validate_new_tenant(new, defaults)?;

    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM tenants WHERE slug = ?")
        .bind(&new.slug)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(RagError::validation(format!(
            "slug '{}' is already taken",
            new.slug
        )));
    }

    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO tenants (id, name, slug, status, max_documents, max_storage_mb,
                             chunk_strategy, chunk_size, chunk_overlap, created_at, updated_at)
        VALUES (?, ?, ?, 'ACTIVE', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(new.name.trim())
    .bind(&new.slug)
    .bind(new.max_documents.unwrap_or(DEFAULT_MAX_DOCUMENTS))
    .bind(new.max_storage_mb.unwrap_or(DEFAULT_MAX_STORAGE_MB))
    .bind(new.chunk_strategy.map(|s| s.as_str()))
    .bind(new.chunk_size.map(|v| v as i64))
    .bind(new.chunk_overlap.map(|v| v as i64))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(tenant_id = %id, slug = %new.slug, "tenant created");
    find_tenant(pool, &id).await
}

/// Look a tenant up by id or slug.
pub async fn find_tenant(pool: &SqlitePool, id_or_slug: &str) -> RagResult<Tenant> {
    let row = sqlx::query("SELECT * FROM tenants WHERE id = ? OR slug = ?")
        .bind(id_or_slug)
        .bind(id_or_slug)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RagError::not_found("tenant", id_or_slug))?;
    Ok(Tenant::from_row(&row)?)
}

/// All tenants, oldest first.
pub async fn list_tenants(pool: &SqlitePool) -> RagResult<Vec<Tenant>> {
    let rows = sqlx::query("SELECT * FROM tenants ORDER BY created_at, slug")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| Tenant::from_row(r).map_err(RagError::from))
        .collect()
}

/// Partial update for [`update_tenant`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TenantPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_documents: Option<i64>,
    #[serde(default)]
    pub max_storage_mb: Option<i64>,
    #[serde(default)]
    pub chunk_strategy: Option<ChunkStrategy>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

/// Apply the set fields of `patch`; unset fields keep their value.
pub async fn update_tenant(
    pool: &SqlitePool,
    id_or_slug: &str,
    patch: &TenantPatch,
    defaults: &ChunkingConfig,
) -> RagResult<Tenant> {
    let current = find_tenant(pool, id_or_slug).await?;

    let merged = NewTenant {
        name: patch.name.clone().unwrap_or_else(|| current.name.clone()),
        slug: current.slug.clone(),
        max_documents: Some(patch.max_documents.unwrap_or(current.max_documents)),
        max_storage_mb: Some(patch.max_storage_mb.unwrap_or(current.max_storage_mb)),
        chunk_strategy: patch.chunk_strategy.or(current.chunk_strategy),
        chunk_size: patch
            .chunk_size
            .or(current.chunk_size.map(|v| v as usize)),
        chunk_overlap: patch
            .chunk_overlap
            .or(current.chunk_overlap.map(|v| v as usize)),
    };
    validate_new_tenant(&merged, defaults)?;

    sqlx::query(
        r#"
        UPDATE tenants
        SET name = ?, max_documents = ?, max_storage_mb = ?,
            chunk_strategy = ?, chunk_size = ?, chunk_overlap = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(merged.name.trim())
    .bind(merged.max_documents)
    .bind(merged.max_storage_mb)
    .bind(merged.chunk_strategy.map(|s| s.as_str()))
    .bind(merged.chunk_size.map(|v| v as i64))
    .bind(merged.chunk_overlap.map(|v| v as i64))
    .bind(chrono::Utc::now().timestamp())
    .bind(&current.id)
    .execute(pool)
    .await?;

    tracing::info!(tenant_id = %current.id, "tenant updated");
    find_tenant(pool, &current.id).await
}

/// Soft-disable or re-enable a tenant. Tenants are never deleted here.
pub async fn set_status(
    pool: &SqlitePool,
    id_or_slug: &str,
    status: TenantStatus,
) -> RagResult<Tenant> {
    let tenant = find_tenant(pool, id_or_slug).await?;
    sqlx::query("UPDATE tenants SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(&tenant.id)
        .execute(pool)
        .await?;
    tracing::info!(tenant_id = %tenant.id, status = %status, "tenant status changed");
    find_tenant(pool, &tenant.id).await
}

/// Proof that the caller is acting on behalf of one tenant.
///
/// There is no public constructor besides [`TenantContext::resolve`], so
/// holding one means the tenant exists and was ACTIVE when resolved.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: String,
    slug: String,
    max_documents: i64,
    max_storage_mb: i64,
    chunking: ChunkingConfig,
}

impl TenantContext {
    /// Resolve an ACTIVE tenant by id or slug.
    pub async fn resolve(
        pool: &SqlitePool,
        id_or_slug: &str,
        defaults: &ChunkingConfig,
    ) -> RagResult<Self> {
        let tenant = find_tenant(pool, id_or_slug).await?;
        if tenant.status != TenantStatus::Active {
            return Err(RagError::TenantInactive(format!(
                "{} is {}",
                tenant.slug, tenant.status
            )));
        }
        Ok(Self::from_tenant(&tenant, defaults))
    }

    /// Load a tenant regardless of status. Used by workers to record
    /// failures against documents of tenants that were disabled mid-flight.
    pub(crate) async fn load(
        pool: &SqlitePool,
        tenant_id: &str,
        defaults: &ChunkingConfig,
    ) -> RagResult<Self> {
        let tenant = find_tenant(pool, tenant_id).await?;
        Ok(Self::from_tenant(&tenant, defaults))
    }

    fn from_tenant(tenant: &Tenant, defaults: &ChunkingConfig) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            slug: tenant.slug.clone(),
            max_documents: tenant.max_documents,
            max_storage_mb: tenant.max_storage_mb,
            chunking: tenant.chunking(defaults),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn max_documents(&self) -> i64 {
        self.max_documents
    }

    /// Storage quota in bytes; saturates at `i64::MAX` for very large limits.
    pub fn max_storage_bytes(&self) -> i64 {
        self.max_storage_mb.saturating_mul(1024 * 1024)
    }

    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    /// `SELECT ... FROM <table> <alias> [JOIN ...]` scoped to this tenant.
    pub fn select(&self, head: &str, alias: &str) -> TenantQuery {
        TenantQuery::select(self, head, alias)
    }

    pub fn delete_from(&self, table: &str) -> TenantQuery {
        TenantQuery::delete(self, table)
    }

    pub fn update(&self, table: &str) -> TenantUpdate {
        TenantUpdate::new(self, table)
    }
}

/// Query builder that starts life already filtered by tenant.
pub struct TenantQuery {
    qb: QueryBuilder<'static, Sqlite>,
}

impl TenantQuery {
    fn select(ctx: &TenantContext, head: &str, alias: &str) -> Self {
        let mut qb = QueryBuilder::new(head);
        qb.push(" WHERE ")
            .push(alias)
            .push(".tenant_id = ")
            .push_bind(ctx.tenant_id.clone());
        Self { qb }
    }

    fn delete(ctx: &TenantContext, table: &str) -> Self {
        let mut qb = QueryBuilder::new("DELETE FROM ");
        qb.push(table)
            .push(" WHERE tenant_id = ")
            .push_bind(ctx.tenant_id.clone());
        Self { qb }
    }

    /// Append `AND <predicate>`; follow with [`TenantQuery::bind`] for any
    /// placeholder the predicate ends with.
    pub fn and(mut self, predicate: &str) -> Self {
        self.qb.push(" AND ").push(predicate);
        self
    }

    pub fn and_eq<T>(mut self, column: &str, value: T) -> Self
    where
        T: 'static + Encode<'static, Sqlite> + Type<Sqlite> + Send,
    {
        self.qb
            .push(" AND ")
            .push(column)
            .push(" = ")
            .push_bind(value);
        self
    }

    /// `AND column IN (...)`. An empty list matches nothing.
    /// `AND column IN (...)`. An empty list matches nothing.
    pub fn and_in(mut self, column: &str, values: &[String]) -> Self {
        if values.is_empty() {
            self.qb.push(" AND 0");
            return self;
        }
        self.qb.push(" AND ").push(column).push(" IN (");
        let mut separated = self.qb.separated(", ");
        for v in values {
            separated.push_bind(v.clone());
        }
        separated.push_unseparated(")");
        self
    }

    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: 'static + Encode<'static, Sqlite> + Type<Sqlite> + Send,
    {
        self.qb.push_bind(value);
        self
    }

    /// Raw trailing SQL such as `ORDER BY` or `LIMIT`.
    pub fn push(mut self, sql: &str) -> Self {
        self.qb.push(" ").push(sql);
        self
    }

    pub fn sql(&self) -> &str {
        self.qb.sql()
    }

    pub async fn fetch_all<'c, E>(mut self, executor: E) -> Result<Vec<SqliteRow>, sqlx::Error>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        self.qb.build().fetch_all(executor).await
    }

    pub async fn fetch_optional<'c, E>(
        mut self,
        executor: E,
    ) -> Result<Option<SqliteRow>, sqlx::Error>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        self.qb.build().fetch_optional(executor).await
    }

    /// First column of the first row as an integer (for `COUNT`/`SUM`).
    pub async fn fetch_i64<'c, E>(mut self, executor: E) -> Result<i64, sqlx::Error>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let row = self.qb.build().fetch_one(executor).await?;
        let value: Option<i64> = row.try_get(0)?;
        Ok(value.unwrap_or(0))
    }

    pub async fn execute<'c, E>(mut self, executor: E) -> Result<SqliteQueryResult, sqlx::Error>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        self.qb.build().execute(executor).await
    }
}

/// `UPDATE <table> SET ...` that is closed with the tenant predicate.
pub struct TenantUpdate {
    qb: QueryBuilder<'static, Sqlite>,
    tenant_id: String,
    has_set: bool,
}

impl TenantUpdate {
    fn new(ctx: &TenantContext, table: &str) -> Self {
        let mut qb = QueryBuilder::new("UPDATE ");
        qb.push(table).push(" SET ");
        Self {
            qb,
            tenant_id: ctx.tenant_id.clone(),
            has_set: false,
        }
    }

    pub fn set<T>(mut self, column: &str, value: T) -> Self
    where
        T: 'static + Encode<'static, Sqlite> + Type<Sqlite> + Send,
    {
        if self.has_set {
            self.qb.push(", ");
        }
        self.qb.push(column).push(" = ").push_bind(value);
        self.has_set = true;
        self
    }

    pub fn where_tenant(mut self) -> TenantQuery {
        self.qb
            .push(" WHERE tenant_id = ")
            .push_bind(self.tenant_id.clone());
        TenantQuery { qb: self.qb }
    }
}

/// Get-or-create a user by email within the tenant.
pub async fn ensure_user(pool: &SqlitePool, ctx: &TenantContext, email: &str) -> RagResult<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(RagError::validation(format!("invalid email: '{}'", email)));
    }

    let existing = ctx
        .select("SELECT u.id FROM users u", "u")
        .and_eq("u.email", email.clone())
        .fetch_optional(pool)
        .await?;
    if let Some(row) = existing {
        return Ok(row.try_get("id")?);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO users (id, tenant_id, email, created_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(tenant_id, email) DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(ctx.tenant_id())
    .bind(&email)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    // A concurrent insert may have won; read back whichever row exists.
    let row = ctx
        .select("SELECT u.id FROM users u", "u")
        .and_eq("u.email", email)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| RagError::Processing("user insert did not persist".to_string()))?;
    Ok(row.try_get("id")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, pool)
    }

    fn new_tenant(slug: &str) -> NewTenant {
        NewTenant {
            name: format!("Tenant {}", slug),
            slug: slug.to_string(),
            ..NewTenant::default()
        }
    }

    #[test]
    fn test_validate_slug() {
        assert!(validate_slug("acme-corp").is_ok());
        assert!(validate_slug("a").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("acme_corp").is_err());
    }

    #[tokio::test]
    async fn test_create_and_resolve_by_slug() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        let tenant = create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.max_documents, 1000);

        let ctx = TenantContext::resolve(&pool, "acme", &defaults).await.unwrap();
        assert_eq!(ctx.tenant_id(), tenant.id);
        assert_eq!(ctx.chunking(), &defaults);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();
        let err = create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[tokio::test]
    async fn test_suspended_tenant_cannot_resolve() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();
        set_status(&pool, "acme", TenantStatus::Suspended)
            .await
            .unwrap();

        let err = TenantContext::resolve(&pool, "acme", &defaults)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::TenantInactive(_)));

        let unknown = TenantContext::resolve(&pool, "nobody", &defaults)
            .await
            .unwrap_err();
        assert!(matches!(unknown, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_tenant_chunking_override() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        let mut new = new_tenant("legal");
        new.chunk_strategy = Some(ChunkStrategy::Semantic);
        new.chunk_size = Some(256);
        create_tenant(&pool, &new, &defaults).await.unwrap();

        let ctx = TenantContext::resolve(&pool, "legal", &defaults)
            .await
            .unwrap();
        assert_eq!(ctx.chunking().strategy, ChunkStrategy::Semantic);
        assert_eq!(ctx.chunking().chunk_size, 256);
        assert_eq!(ctx.chunking().overlap, defaults.overlap);
    }

    #[tokio::test]
    async fn test_update_tenant_validates_merged_values() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();

        let updated = update_tenant(
            &pool,
            "acme",
            &TenantPatch {
                max_documents: Some(5),
                chunk_size: Some(128),
                ..TenantPatch::default()
            },
            &defaults,
        )
        .await
        .unwrap();
        assert_eq!(updated.max_documents, 5);
        assert_eq!(updated.chunk_size, Some(128));
        assert_eq!(updated.name, "Tenant acme");

        // Overlap must stay below the stored chunk size.
        let err = update_tenant(
            &pool,
            "acme",
            &TenantPatch {
                chunk_overlap: Some(128),
                ..TenantPatch::default()
            },
            &defaults,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
    }

    #[tokio::test]
    async fn test_query_always_starts_with_tenant_filter() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();
        let ctx = TenantContext::resolve(&pool, "acme", &defaults).await.unwrap();

        let q = ctx
            .select("SELECT d.id FROM documents d", "d")
            .and_eq("d.processing_status", "PENDING".to_string());
        assert!(q.sql().contains("WHERE d.tenant_id = ?"));
        assert!(q.sql().find("tenant_id").unwrap() < q.sql().find("processing_status").unwrap());

        let update = ctx
            .update("documents")
            .set("chunk_count", 3i64)
            .where_tenant();
        assert!(update.sql().ends_with("WHERE tenant_id = ?"));
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let (_tmp, pool) = setup().await;
        let defaults = ChunkingConfig::default();
        create_tenant(&pool, &new_tenant("acme"), &defaults)
            .await
            .unwrap();
        let ctx = TenantContext::resolve(&pool, "acme", &defaults).await.unwrap();

        let a = ensure_user(&pool, &ctx, "Ops@Acme.io").await.unwrap();
        let b = ensure_user(&pool, &ctx, "ops@acme.io").await.unwrap();
        assert_eq!(a, b);
        assert!(ensure_user(&pool, &ctx, "not-an-email").await.is_err());
    }
}
