//! Durable job store backing the schedule engine.
//!
//! Jobs are plain rows (id, kind, loop id, due time) — no captured state, so
//! a row written before a crash is executable after restart against the
//! then-current config.  One row per id: scheduling an existing id replaces
//! it atomically.
//!
//! Opening follows a recovery ladder that favors availability over
//! durability: a corrupt store file is deleted and recreated, and if even
//! that fails the store falls back to a non-durable in-memory database.
//! The controller always comes up.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Start,
    Stop,
}

impl JobKind {
    fn as_str(self) -> &'static str {
        match self {
            JobKind::Start => "start",
            JobKind::Stop => "stop",
        }
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(JobKind::Start),
            "stop" => Ok(JobKind::Stop),
            other => anyhow::bail!("unknown job kind '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub loop_id: String,
    pub due_unix: i64,
}

impl Job {
    pub fn new(kind: JobKind, loop_id: &str, due_unix: i64) -> Self {
        Job {
            id: format!("{loop_id}_{}", kind.as_str()),
            kind,
            loop_id: loop_id.to_string(),
            due_unix,
        }
    }
}

#[derive(Clone)]
pub struct JobStore {
    pool: Pool<Sqlite>,
    durable: bool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id       TEXT PRIMARY KEY,
  kind     TEXT NOT NULL,
  loop_id  TEXT NOT NULL,
  due_unix INTEGER NOT NULL
)
"#;

impl JobStore {
    /// Open the store at `path`, walking the recovery ladder if needed.
    /// Only a failure to create the in-memory fallback is fatal.
    pub async fn open(path: &Path) -> Result<Self> {
        match Self::open_file(path).await {
            Ok(store) => Ok(store),
            Err(first) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{first:#}"),
                    "job store unusable; deleting and recreating"
                );
                remove_store_files(path);
                match Self::open_file(path).await {
                    Ok(store) => Ok(store),
                    Err(second) => {
                        tracing::error!(
                            path = %path.display(),
                            error = %format!("{second:#}"),
                            "recreating job store failed; falling back to in-memory store"
                        );
                        Self::open_memory().await
                    }
                }
            }
        }
    }

    async fn open_file(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = Self::connect(options).await?;
        Ok(JobStore {
            pool,
            durable: true,
        })
    }

    /// Non-durable fallback: jobs vanish on restart, but scheduling works.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory connection string")?;
        let pool = Self::connect(options).await?;
        Ok(JobStore {
            pool,
            durable: false,
        })
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Pool<Sqlite>> {
        // Single connection: the store is a serial consumer, and the
        // in-memory database only exists on one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to connect to job store")?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply job store schema")?;
        Ok(pool)
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Insert or atomically replace the job with the same id.
    pub async fn schedule(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, loop_id, due_unix)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              kind=excluded.kind,
              loop_id=excluded.loop_id,
              due_unix=excluded.due_unix
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(&job.loop_id)
        .bind(job.due_unix)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to schedule job '{}'", job.id))?;
        Ok(())
    }

    /// Jobs whose due time has passed, oldest first.
    pub async fn due(&self, now_unix: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, kind, loop_id, due_unix FROM jobs WHERE due_unix <= ? ORDER BY due_unix, id",
        )
        .bind(now_unix)
        .fetch_all(&self.pool)
        .await
        .context("failed to query due jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    /// Every pending job, for restart recovery and inspection.
    pub async fn all(&self) -> Result<Vec<Job>> {
        let rows =
            sqlx::query("SELECT id, kind, loop_id, due_unix FROM jobs ORDER BY due_unix, id")
                .fetch_all(&self.pool)
                .await
                .context("failed to list jobs")?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove job '{id}'"))?;
        Ok(())
    }

    /// Drop all jobs for one loop (used when a loop is disabled).
    pub async fn remove_loop(&self, loop_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE loop_id = ?")
            .bind(loop_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove jobs for loop '{loop_id}'"))?;
        Ok(())
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let kind: String = row.try_get("kind")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        loop_id: row.try_get("loop_id")?,
        due_unix: row.try_get("due_unix")?,
    })
}

fn remove_store_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut p = PathBuf::from(path.as_os_str());
        if !suffix.is_empty() {
            let mut name = p.file_name().map(|n| n.to_os_string()).unwrap_or_default();
            name.push(suffix);
            p.set_file_name(name);
        }
        let _ = std::fs::remove_file(&p);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
