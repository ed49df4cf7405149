//! Audit trail of administrative actions
//!
//! Workflows report every mutation to an [`AuditSink`]. Recording is
//! fire-and-forget: a failing sink is logged and never fails the
//! workflow it describes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

/// Entries returned by [`AuditLog::entries`] when no limit is given.
pub const DEFAULT_ENTRY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

impl FromStr for AuditStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(Error::Audit(format!("unknown audit status: {other}"))),
        }
    }
}

/// What happened, before the sink assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub target: String,
    pub status: AuditStatus,
    pub details: String,
}

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub status: AuditStatus,
    #[serde(default)]
    pub details: String,
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Implementation specific. Callers log and ignore failures.
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// `id, timestamp, actor, action, target, status, details`
type AuditRow = (i64, String, String, String, String, String, String);

/// Audit trail in a local SQLite database.
pub struct AuditLog {
    path: PathBuf,
    db: SqlitePool,
}

impl AuditLog {
    /// Open (or create) the database at `path`, creating parent
    /// directories and the `audit_log` table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created, or
    /// [`Error::Database`] if the database cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let db = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT ''
            )
            ",
        )
        .execute(&db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp)")
            .execute(&db)
            .await?;

        Ok(Self { path, db })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent entries first. A `limit` of 0 means
    /// [`DEFAULT_ENTRY_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the query fails, or
    /// [`Error::Audit`] for a row that cannot be decoded.
    pub async fn entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let limit = if limit == 0 { DEFAULT_ENTRY_LIMIT } else { limit };

        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, timestamp, actor, action, target, status, details FROM audit_log \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(id, timestamp, actor, action, target, status, details)| -> Result<AuditEntry> {
                Ok(AuditEntry {
                    id,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| Error::Audit(format!("bad timestamp on entry {id}: {e}")))?
                        .with_timezone(&Utc),
                    actor,
                    action,
                    target,
                    status: status.parse()?,
                    details,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, actor, action, target, status, details) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(&event.actor)
        .bind(&event.action)
        .bind(&event.target)
        .bind(event.status.to_string())
        .bind(&event.details)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Optional sink shared by the workflow services.
#[derive(Clone, Default)]
pub struct Auditor {
    sink: Option<Arc<dyn AuditSink>>,
}

impl Auditor {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// An auditor that drops every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Record the outcome of a workflow. Sink errors are logged only.
    pub async fn outcome<T: Sync>(&self, actor: &str, action: &str, target: &str, result: &Result<T>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let (status, details) = match result {
            Ok(_) => (AuditStatus::Success, String::new()),
            Err(e) => (AuditStatus::Failure, e.to_string()),
        };

        let event = AuditEvent {
            actor: actor.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            status,
            details,
        };

        if let Err(e) = sink.record(event).await {
            warn!("Failed to record audit entry for {} {}: {}", action, target, e);
        }
    }
}
