//! SQLite-backed structured store.
//!
//! The [`Store`] is the sole gateway to `armitage.db`. Reads go directly
//! through the connection pool (concurrent). Writes go through a
//! single-writer actor backed by an [`mpsc`](tokio::sync::mpsc) channel to
//! prevent SQLite write contention; each write is acked so callers observe
//! their own writes.
//!
//! Every query on a tenant-owned table filters by `tenant_id`; there is no
//! cross-tenant path through this module.

pub mod integrations;
pub mod memories;
pub mod notifications;
pub mod sessions;
pub(crate) mod writer;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::types::{InvalidEnum, Tenant, User, UserRole};

use self::writer::{WriteOp, WriteRequest};

/// Writer channel capacity — bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Write channel is closed (writer actor stopped).
    #[error("store writer channel closed")]
    WriterClosed,

    /// A stored enum column held an unknown value.
    #[error(transparent)]
    InvalidEnum(#[from] InvalidEnum),

    /// A stored id or JSON column could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Idempotent schema, applied at startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    schema_tag  TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL REFERENCES tenants(id),
    email       TEXT NOT NULL,
    role        TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,
    verified    INTEGER NOT NULL DEFAULT 0,
    UNIQUE(tenant_id, email)
);

CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    title       TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'active',
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(tenant_id, user_id);

CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    session_id  TEXT NOT NULL,
    tenant_id   TEXT NOT NULL,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    tool_calls  TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(tenant_id, session_id, seq);

CREATE TABLE IF NOT EXISTS memories_medium (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    tenant_id   TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_medium_session ON memories_medium(tenant_id, session_id);
CREATE INDEX IF NOT EXISTS idx_memories_medium_expiry ON memories_medium(expires_at);

CREATE TABLE IF NOT EXISTS memories_long (
    id           TEXT PRIMARY KEY,
    tenant_id    TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    content      TEXT NOT NULL,
    importance   REAL NOT NULL,
    learned_from TEXT NOT NULL DEFAULT '[]',
    created_at   TEXT NOT NULL,
    UNIQUE(user_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_memories_long_user ON memories_long(tenant_id, user_id);

CREATE TABLE IF NOT EXISTS notifications (
    id           TEXT PRIMARY KEY,
    tenant_id    TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    session_id   TEXT,
    kind         TEXT NOT NULL,
    priority     TEXT NOT NULL,
    channel      TEXT NOT NULL,
    payload      TEXT NOT NULL DEFAULT '{}',
    reference_id TEXT,
    read         INTEGER NOT NULL DEFAULT 0,
    resolved_at  TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(tenant_id, user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_notifications_dedupe ON notifications(kind, user_id, reference_id, created_at);

CREATE TABLE IF NOT EXISTS integrations (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    service     TEXT NOT NULL,
    server_url  TEXT NOT NULL DEFAULT '',
    enabled     INTEGER NOT NULL DEFAULT 1,
    credentials TEXT NOT NULL DEFAULT '',
    metadata    TEXT NOT NULL DEFAULT '{}',
    UNIQUE(tenant_id, user_id, service, server_url)
);

CREATE TABLE IF NOT EXISTS files (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    session_id  TEXT,
    name        TEXT NOT NULL,
    mime        TEXT NOT NULL,
    storage_ref TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_user ON files(tenant_id, user_id);
"#;

/// Central structured store over SQLite.
pub struct Store {
    /// Connection pool for reads.
    db: SqlitePool,
    /// Channel to the single-writer actor.
    writer_tx: mpsc::Sender<WriteRequest>,
    /// Writer actor join handle (held so shutdown can drain it).
    writer_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(db).await
    }

    /// Open an in-memory database (used by tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single connection: each in-memory connection is its own database.
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(db).await
    }

    async fn from_pool(db: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&db).await?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_pool = db.clone();
        let writer_handle = tokio::spawn(writer::run_writer(writer_pool, writer_rx));

        info!("structured store initialised");

        Ok(Self {
            db,
            writer_tx,
            writer_handle,
        })
    }

    /// Returns the underlying pool (reads only).
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Send a write operation to the actor and await its ack.
    ///
    /// Returns the number of rows affected.
    pub(crate) async fn execute(&self, op: WriteOp) -> Result<u64, StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send((op, ack_tx))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        ack_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Gracefully shut down the writer actor, draining pending writes.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
        info!("structured store shut down");
    }

    // -- tenants and users --------------------------------------------------

    /// Insert a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.execute(WriteOp::InsertTenant(tenant)).await?;
        Ok(())
    }

    /// Insert a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including duplicate email
    /// within the tenant).
    pub async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.execute(WriteOp::InsertUser(user)).await?;
        Ok(())
    }

    /// Fetch a user by id within a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn get_user(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<(String, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, tenant_id, email, role, active, verified \
             FROM users WHERE tenant_id = ?1 AND id = ?2",
        )
        .bind(tenant_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(|(id, tenant_id, email, role, active, verified)| {
            Ok(User {
                id: parse_uuid(&id)?,
                tenant_id: parse_uuid(&tenant_id)?,
                email,
                role: UserRole::parse(&role)?,
                active: active != 0,
                verified: verified != 0,
            })
        })
        .transpose()
    }

    /// List active tenants.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or corrupt rows.
    pub async fn list_active_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<(String, String, String, i64)> =
            sqlx::query_as("SELECT id, name, schema_tag, active FROM tenants WHERE active = 1")
                .fetch_all(&self.db)
                .await?;

        rows.into_iter()
            .map(|(id, name, schema_tag, active)| {
                Ok(Tenant {
                    id: parse_uuid(&id)?,
                    name,
                    schema_tag,
                    active: active != 0,
                })
            })
            .collect()
    }
}

/// Parse a stored UUID column, mapping failures to [`StoreError::Corrupt`].
pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s:?}: {e}")))
}

/// Parse a stored RFC3339 timestamp column.
pub(crate) fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}
