//! SQLite persistence and vector memory.
//!
//! The store owns a single-writer SQLite pool (WAL mode) holding
//! sessions, artifacts, configuration, and memories, plus a filesystem
//! artifact root. Every artifact read and write goes through one path
//! sanitizer that confines access strictly to the root. Higher layers
//! must not issue two mutating calls for the same session concurrently;
//! concurrent readers are fine.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

pub mod memory;

pub use memory::MemoryItem;

use memory::VectorIndex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid artifact path: {0}")]
    PathTraversal(String),

    #[error("unknown session status: {0}")]
    UnknownStatus(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle status. Transitions move monotonically toward a
/// terminal state; `Running` and `Initialized` may alternate during
/// setup only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initialized,
    Running,
    Halted,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initialized => "initialized",
            SessionStatus::Running => "running",
            SessionStatus::Halted => "halted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "initialized" => Ok(SessionStatus::Initialized),
            "running" => Ok(SessionStatus::Running),
            "halted" => Ok(SessionStatus::Halted),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }

    /// Terminal states are sticky; a session never leaves one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Halted | SessionStatus::Completed | SessionStatus::Failed
        )
    }
}

/// One execution run. Retained forever for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: SessionStatus,
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Fresh session in `Initialized` state.
    pub fn new(id: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        let now = now_secs();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Initialized,
            metadata,
        }
    }
}

/// A file generated during execution, confined to the artifact root.
/// Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub session_id: String,
    /// Relative path inside the artifact root.
    pub path: String,
    /// e.g. "tool_output"
    pub kind: String,
    pub created_at: i64,
    /// Hex sha-256 of the content.
    pub digest: String,
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Keys whose values higher layers must encrypt before storing.
/// The store itself treats all values as opaque.
pub fn is_sensitive_key(key: &str) -> bool {
    key == "api_key" || key.ends_with("_api_key") || key.ends_with("_secret")
}

/// Validate a relative artifact path and resolve it under the root.
///
/// Refuses absolute paths, any `..` component, and anything that would
/// resolve outside the root. Called from every artifact read and write
/// site.
pub fn sanitize_artifact_path(root: &Path, path: &str) -> Result<PathBuf, StoreError> {
    let rel = Path::new(path);
    if rel.is_absolute() {
        return Err(StoreError::PathTraversal(path.to_string()));
    }

    let mut clean = PathBuf::new();
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(c) => clean.push(c),
            _ => return Err(StoreError::PathTraversal(path.to_string())),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(StoreError::PathTraversal(path.to_string()));
    }

    let full = root.join(&clean);
    if !full.starts_with(root) {
        return Err(StoreError::PathTraversal(path.to_string()));
    }

    Ok(full)
}

/// Durable store: SQLite metadata plus filesystem artifacts plus the
/// in-process vector index cache.
pub struct Store {
    pool: SqlitePool,
    artifact_root: PathBuf,
    index: VectorIndex,
}

impl Store {
    /// Open (or create) the store at the given database path and
    /// artifact root.
    ///
    /// Enables WAL mode and pins the pool to a single connection: the
    /// store contract is one writer with any number of in-process
    /// readers.
    pub async fn open(db_path: &Path, artifact_root: &Path) -> Result<Self, StoreError> {
        info!("Opening store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(artifact_root).await?;
        set_owner_only_dir(artifact_root).await?;

        // Canonicalize once; every artifact path resolves against this.
        let artifact_root = tokio::fs::canonicalize(artifact_root).await?;

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&pool)
            .await?;

        debug!("Store schema ready");

        Ok(Self {
            pool,
            artifact_root,
            index: VectorIndex::new(),
        })
    }

    /// The canonicalized artifact root directory.
    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Checkpoint the WAL and close all connections.
    pub async fn close(self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        self.pool.close().await;
        Ok(())
    }

    // Sessions

    pub async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&session.metadata)?;

        sqlx::query(
            "INSERT INTO sessions (id, created_at, updated_at, status, metadata) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.status.as_str())
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let row = sqlx::query(
            "SELECT id, created_at, updated_at, status, metadata FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

        let status: String = row.get("status");
        let metadata: String = row.get("metadata");

        Ok(Session {
            id: row.get("id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            status: SessionStatus::parse(&status)?,
            metadata: serde_json::from_str(&metadata)?,
        })
    }

    /// Persist status and metadata; `updated_at` is stamped here.
    pub async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&session.metadata)?;

        sqlx::query("UPDATE sessions SET updated_at = ?, status = ?, metadata = ? WHERE id = ?")
            .bind(now_secs())
            .bind(session.status.as_str())
            .bind(metadata)
            .bind(&session.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // Artifacts

    /// Persist artifact content and its metadata row atomically enough
    /// for the runtime's needs: the file is written before the row, so a
    /// row never exists without its content.
    pub async fn save_artifact(
        &self,
        artifact: &Artifact,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let full_path = sanitize_artifact_path(&self.artifact_root, &artifact.path)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            set_owner_only_dir(parent).await?;
        }
        write_owner_only(&full_path, content).await?;

        sqlx::query(
            "INSERT INTO artifacts (id, session_id, path, kind, created_at, digest) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&artifact.id)
        .bind(&artifact.session_id)
        .bind(&artifact.path)
        .bind(&artifact.kind)
        .bind(artifact.created_at)
        .bind(&artifact.digest)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_artifact(&self, id: &str) -> Result<(Artifact, Vec<u8>), StoreError> {
        let row = sqlx::query(
            "SELECT id, session_id, path, kind, created_at, digest FROM artifacts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::ArtifactNotFound(id.to_string()))?;

        let artifact = Artifact {
            id: row.get("id"),
            session_id: row.get("session_id"),
            path: row.get("path"),
            kind: row.get("kind"),
            created_at: row.get("created_at"),
            digest: row.get("digest"),
        };

        // Paths from the database are untrusted too.
        let full_path = sanitize_artifact_path(&self.artifact_root, &artifact.path)?;
        let content = tokio::fs::read(&full_path).await?;

        Ok((artifact, content))
    }

    pub async fn list_artifacts(&self, session_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, path, kind, created_at, digest FROM artifacts WHERE session_id = ? ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Artifact {
                id: row.get("id"),
                session_id: row.get("session_id"),
                path: row.get("path"),
                kind: row.get("kind"),
                created_at: row.get("created_at"),
                digest: row.get("digest"),
            })
            .collect())
    }

    // Configuration

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO configuration (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM configuration WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("value")))
    }
}

async fn set_owner_only_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn write_owner_only(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        use tokio::io::AsyncWriteExt;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true).mode(0o600);
        let mut file = tokio::fs::OpenOptions::from(options).open(path).await?;
        file.write_all(content).await?;
        file.flush().await
    }
    #[cfg(not(unix))]
    {
        tokio::fs::write(path, content).await
    }
}
