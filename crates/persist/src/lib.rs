//! Relational backend: per-kind tables with a JSON report column, a
//! tenant discriminator, and read fan-out over replicas.

#![forbid(unsafe_code)]

pub mod query;
pub mod router;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use arca_core::{Filter, ResourceKind, ResourceRecord, StoreError, StoreResult};
use arca_store::{object_key, storage_key, Repository};

pub use query::{QueryBuilder, SqlParam};
pub use router::{select_read, DbRouter};

/// Database settings. Defaults read the `ARCA_DB_*` environment; the
/// primary URL has no default because silently pointing writes at a
/// guessed database is worse than failing.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub primary_url: String,
    pub replica_urls: Vec<String>,
    pub cluster_id: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl DbConfig {
    pub fn from_env() -> StoreResult<Self> {
        let primary_url = std::env::var("ARCA_DB_URL")
            .map_err(|_| StoreError::Connection("ARCA_DB_URL is not set".into()))?;
        let replica_urls = std::env::var("ARCA_DB_REPLICA_URLS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let cluster_id =
            std::env::var("ARCA_CLUSTER_ID").unwrap_or_else(|_| "default".to_string());
        let max_connections = std::env::var("ARCA_DB_MAX_CONNS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let acquire_timeout_ms = std::env::var("ARCA_DB_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);
        Ok(Self { primary_url, replica_urls, cluster_id, max_connections, acquire_timeout_ms })
    }
}

/// Open the primary eagerly (a dead primary should fail startup) and the
/// replicas lazily (a dead replica should not; the router's probe keeps
/// it out of rotation until it comes back).
pub async fn connect(cfg: &DbConfig) -> StoreResult<DbRouter> {
    let started = std::time::Instant::now();
    let primary = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_millis(cfg.acquire_timeout_ms))
        .connect(&cfg.primary_url)
        .await
        .map_err(|e| StoreError::Connection(format!("db connect primary: {}", e)))?;
    let mut replicas = Vec::with_capacity(cfg.replica_urls.len());
    for url in &cfg.replica_urls {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_millis(cfg.acquire_timeout_ms))
            .connect_lazy(url)
            .map_err(|e| StoreError::Connection(format!("db replica url: {}", e)))?;
        replicas.push(pool);
    }
    histogram!("db_connect_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(replicas = replicas.len(), "db: connected");
    Ok(DbRouter::new(primary, replicas))
}

/// Repository over one relational table per kind.
///
/// Rows hold the serialized record under `report` beside the identity
/// columns; the composite primary key covers `(name[, namespace],
/// cluster_id)`. Reads go through the router's replica rotation, writes
/// to the primary. Records of a namespaced kind that carry no namespace
/// land under the empty string so point lookups stay exact, mirroring
/// the bare-name keys of the other backends.
pub struct SqlRepository<T> {
    kind: ResourceKind,
    table: String,
    cluster_id: String,
    router: Arc<DbRouter>,
    _record: PhantomData<T>,
}

impl<T: ResourceRecord> SqlRepository<T> {
    /// Ensures the kind's table and indexes exist, then serves CRUD over
    /// them. The table name is the kind's plural.
    pub async fn new(
        kind: ResourceKind,
        router: Arc<DbRouter>,
        cluster_id: &str,
    ) -> StoreResult<Self> {
        let table = table_name(&kind)?;
        let me = Self {
            kind,
            table,
            cluster_id: cluster_id.to_string(),
            router,
            _record: PhantomData,
        };
        me.ensure_schema().await?;
        Ok(me)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let started = std::time::Instant::now();
        let ddl = if self.kind.namespaced {
            format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    name TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    cluster_id TEXT NOT NULL,
                    report JSONB NOT NULL,
                    PRIMARY KEY (name, namespace, cluster_id)
                )",
                t = self.table
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    name TEXT NOT NULL,
                    cluster_id TEXT NOT NULL,
                    report JSONB NOT NULL,
                    PRIMARY KEY (name, cluster_id)
                )",
                t = self.table
            )
        };
        let pool = self.router.write_db();
        sqlx::query(&ddl)
            .execute(pool)
            .await
            .map_err(|e| self.wrap_db("ddl", e))?;
        let mut indexes = vec![format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_cluster ON {t}(cluster_id)",
            t = self.table
        )];
        if self.kind.namespaced {
            indexes.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_namespace ON {t}(cluster_id, namespace)",
                t = self.table
            ));
        }
        for idx in indexes {
            let _ = sqlx::query(&idx).execute(pool).await;
        }
        histogram!("db_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(table = %self.table, "db: schema ready");
        Ok(())
    }

    /// Predicates for a point row: tenant, name, and for namespaced
    /// kinds the exact namespace column with unset normalized to "".
    fn point_builder(&self, namespace: Option<&str>, name: &str) -> QueryBuilder {
        let mut qb = QueryBuilder::new(&self.table);
        qb.apply_filter(&self.cluster_id, &Filter::new().with_name(name));
        if self.kind.namespaced {
            qb.predicate("namespace", namespace.unwrap_or(""));
        }
        qb
    }

    /// Cluster-scoped tables have no namespace column, so a filter that
    /// carries a namespace can match nothing. The key-path backends reach
    /// the same outcome because the namespace lands in a key no record
    /// lives under.
    fn namespace_mismatch(&self, filter: &Filter) -> bool {
        !self.kind.namespaced && filter.namespace().is_some()
    }

    fn identity_params(&self, obj: &T, report: serde_json::Value) -> Vec<SqlParam> {
        let mut params = vec![SqlParam::Text(obj.name().to_string())];
        if self.kind.namespaced {
            params.push(SqlParam::Text(obj.namespace().unwrap_or("").to_string()));
        }
        params.push(SqlParam::Text(self.cluster_id.clone()));
        params.push(SqlParam::Json(report));
        params
    }

    fn columns(&self) -> (&'static [&'static str], &'static [&'static str]) {
        if self.kind.namespaced {
            (&["name", "namespace", "cluster_id", "report"], &["name", "namespace", "cluster_id"])
        } else {
            (&["name", "cluster_id", "report"], &["name", "cluster_id"])
        }
    }

    fn encode(&self, obj: &T) -> StoreResult<serde_json::Value> {
        serde_json::to_value(obj)
            .map_err(|e| StoreError::InvalidObject(format!("encode {}: {}", self.table, e)))
    }

    fn decode(&self, raw: serde_json::Value) -> StoreResult<T> {
        serde_json::from_value(raw)
            .map_err(|e| StoreError::InvalidObject(format!("decode {}: {}", self.table, e)))
    }

    fn not_found(&self, namespace: Option<&str>, name: &str) -> StoreError {
        StoreError::NotFound(format!("{} {}", self.kind.plural, storage_key(namespace, name)))
    }

    fn wrap_db(&self, op: &str, e: sqlx::Error) -> StoreError {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Connection(format!("db {} {}: {}", op, self.table, e))
            }
            other => StoreError::Internal(format!("db {} {}: {}", op, self.table, other)),
        }
    }

    async fn fetch_point(&self, pool: &sqlx::PgPool, namespace: Option<&str>, name: &str, op: &str)
        -> StoreResult<Option<serde_json::Value>>
    {
        let (sql, params) = self.point_builder(namespace, name).build_select();
        let mut q = sqlx::query_scalar::<_, serde_json::Value>(&sql);
        for p in &params {
            q = match p {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Json(v) => q.bind(v.clone()),
            };
        }
        q.fetch_optional(pool).await.map_err(|e| self.wrap_db(op, e))
    }
}

#[async_trait]
impl<T: ResourceRecord> Repository<T> for SqlRepository<T> {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    async fn get(&self, filter: &Filter) -> StoreResult<T> {
        let started = std::time::Instant::now();
        let name = filter.require_name("get")?;
        if self.namespace_mismatch(filter) {
            return Err(self.not_found(filter.namespace(), name));
        }
        let pool = self.router.read_db().await;
        let row = self.fetch_point(pool, filter.namespace(), name, "get").await?;
        histogram!("db_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match row {
            Some(raw) => self.decode(raw),
            None => Err(self.not_found(filter.namespace(), name)),
        }
    }

    async fn list(&self, filter: &Filter) -> StoreResult<Vec<T>> {
        let started = std::time::Instant::now();
        if self.namespace_mismatch(filter) {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new(&self.table);
        qb.apply_filter(&self.cluster_id, filter);
        let (sql, params) = qb.build_select();
        let pool = self.router.read_db().await;
        let mut q = sqlx::query_scalar::<_, serde_json::Value>(&sql);
        for p in &params {
            q = match p {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Json(v) => q.bind(v.clone()),
            };
        }
        let rows = q.fetch_all(pool).await.map_err(|e| self.wrap_db("list", e))?;
        let mut out = Vec::with_capacity(rows.len());
        for raw in rows {
            out.push(self.decode(raw)?);
        }
        histogram!("db_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn create(&self, obj: &T) -> StoreResult<()> {
        let started = std::time::Instant::now();
        let suffix = object_key(obj)?;
        let report = self.encode(obj)?;
        // existence check on the primary: a stale replica must not be
        // the reason a duplicate insert slips through
        let pool = self.router.write_db();
        if self.fetch_point(pool, obj.namespace(), obj.name(), "create").await?.is_some() {
            return Err(StoreError::AlreadyExists(format!("{} {}", self.kind.plural, suffix)));
        }
        let (cols, keys) = self.columns();
        let sql = QueryBuilder::new(&self.table).build_insert(cols, keys, false);
        let params = self.identity_params(obj, report);
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = match p {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Json(v) => q.bind(v.clone()),
            };
        }
        q.execute(pool).await.map_err(|e| self.wrap_db("create", e))?;
        histogram!("db_create_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("db_write_total", 1u64);
        Ok(())
    }

    async fn update(&self, obj: &T) -> StoreResult<()> {
        let started = std::time::Instant::now();
        let suffix = object_key(obj)?;
        let report = self.encode(obj)?;
        let qb = self.point_builder(obj.namespace(), obj.name());
        let (sql, params) = qb.build_update(SqlParam::Json(report))?;
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = match p {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Json(v) => q.bind(v.clone()),
            };
        }
        let res = q
            .execute(self.router.write_db())
            .await
            .map_err(|e| self.wrap_db("update", e))?;
        histogram!("db_update_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("{} {}", self.kind.plural, suffix)));
        }
        counter!("db_write_total", 1u64);
        Ok(())
    }

    async fn delete(&self, filter: &Filter) -> StoreResult<()> {
        let started = std::time::Instant::now();
        let name = filter.require_name("delete")?;
        if self.namespace_mismatch(filter) {
            return Err(self.not_found(filter.namespace(), name));
        }
        let qb = self.point_builder(filter.namespace(), name);
        let (sql, params) = qb.build_delete()?;
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = match p {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Json(v) => q.bind(v.clone()),
            };
        }
        let res = q
            .execute(self.router.write_db())
            .await
            .map_err(|e| self.wrap_db("delete", e))?;
        histogram!("db_delete_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.rows_affected() == 0 {
            return Err(self.not_found(filter.namespace(), name));
        }
        counter!("db_write_total", 1u64);
        Ok(())
    }
}

/// Table identifiers are interpolated into DDL and queries; keep them
/// boring. Kinds come from code, not user input, so this is a guard
/// against typos rather than injection.
fn table_name(kind: &ResourceKind) -> StoreResult<String> {
    let t = kind.plural.replace('-', "_");
    if t.is_empty()
        || !t.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(StoreError::InvalidObject(format!("unusable table name {:?}", kind.plural)));
    }
    Ok(t)
}
