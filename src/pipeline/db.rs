use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::events::ProgressEvent;
use super::models::{RunContext, RunStatus};
use super::sink::{ContextDelta, StateSink};

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For start-up, CLI reads
    /// and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A stored run row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub url: String,
    pub status: RunStatus,
    pub phase: String,
    pub error_message: Option<String>,
    pub story_source: Option<String>,
    pub pages_count: Option<i64>,
    pub elements_count: Option<i64>,
    pub healing_attempts: i64,
    pub is_healed: bool,
    pub created_at: String,
    pub updated_at: String,
    /// Latest full context, with the row's status columns applied on top.
    pub context: Option<RunContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub payload: String,
    pub created_at: String,
}

struct RunRow {
    run_id: String,
    url: String,
    status: String,
    phase: String,
    error_message: Option<String>,
    story_source: Option<String>,
    pages_count: Option<i64>,
    elements_count: Option<i64>,
    healing_attempts: i64,
    is_healed: bool,
    created_at: String,
    updated_at: String,
    context: Option<String>,
}

impl RunRow {
    const COLUMNS: &'static str = "run_id, url, status, phase, error_message, story_source, pages_count, \
         elements_count, healing_attempts, is_healed, created_at, updated_at, context";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            url: row.get(1)?,
            status: row.get(2)?,
            phase: row.get(3)?,
            error_message: row.get(4)?,
            story_source: row.get(5)?,
            pages_count: row.get(6)?,
            elements_count: row.get(7)?,
            healing_attempts: row.get(8)?,
            is_healed: row.get::<_, i64>(9)? != 0,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            context: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!("run {}: {}", self.run_id, e))?;
        let context = match self.context {
            Some(json) => {
                let mut ctx: RunContext =
                    serde_json::from_str(&json).context("Failed to decode stored run context")?;
                ctx.status = status;
                ctx.phase = self.phase.clone();
                ctx.error_message = self.error_message.clone();
                Some(ctx)
            }
            None => None,
        };
        Ok(RunRecord {
            run_id: self.run_id,
            url: self.url,
            status,
            phase: self.phase,
            error_message: self.error_message,
            story_source: self.story_source,
            pages_count: self.pages_count,
            elements_count: self.elements_count,
            healing_attempts: self.healing_attempts,
            is_healed: self.is_healed,
            created_at: self.created_at,
            updated_at: self.updated_at,
            context,
        })
    }
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    phase TEXT NOT NULL DEFAULT 'queued',
                    error_message TEXT,
                    story_source TEXT,
                    pages_count INTEGER,
                    elements_count INTEGER,
                    healing_attempts INTEGER NOT NULL DEFAULT 0,
                    is_healed INTEGER NOT NULL DEFAULT 0,
                    context TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Fold a delta into the run's row. Rows are created from a snapshot;
    /// a delta without one for an unknown run is ignored and returns false.
    pub fn apply_delta(&self, run_id: &str, delta: &ContextDelta) -> Result<bool> {
        if let Some(snapshot) = &delta.snapshot {
            let json = serde_json::to_string(snapshot).context("Failed to encode run context")?;
            self.conn
                .execute(
                    "INSERT INTO runs (run_id, url, status, phase, context) VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(run_id) DO UPDATE SET context = excluded.context",
                    params![
                        run_id,
                        snapshot.request.url,
                        snapshot.status.as_str(),
                        snapshot.phase,
                        json
                    ],
                )
                .context("Failed to upsert run")?;
        }

        let changed = self
            .conn
            .execute(
                "UPDATE runs SET
                    status = COALESCE(?2, status),
                    phase = COALESCE(?3, phase),
                    error_message = COALESCE(?4, error_message),
                    story_source = COALESCE(?5, story_source),
                    pages_count = COALESCE(?6, pages_count),
                    elements_count = COALESCE(?7, elements_count),
                    healing_attempts = COALESCE(?8, healing_attempts),
                    is_healed = COALESCE(?9, is_healed),
                    updated_at = datetime('now')
                 WHERE run_id = ?1",
                params![
                    run_id,
                    delta.status.map(|s| s.as_str()),
                    delta.phase,
                    delta.error_message,
                    delta.story_source.map(|s| s.as_str()),
                    delta.pages_count.map(|n| n as i64),
                    delta.elements_count.map(|n| n as i64),
                    delta.healing_attempts.map(i64::from),
                    delta.is_healed.map(i64::from),
                ],
            )
            .context("Failed to update run")?;
        Ok(changed > 0)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs WHERE run_id = ?1", RunRow::COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![run_id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_record).transpose()
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RunRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_record()?);
        }
        Ok(runs)
    }

    /// Runs left `queued` or `running` by a previous process are failed:
    /// their in-flight work did not survive the restart.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "UPDATE runs SET status = 'failed', phase = 'failed',
                    error_message = 'interrupted by restart', updated_at = datetime('now')
                 WHERE status IN ('queued', 'running')",
                [],
            )
            .context("Failed to recover interrupted runs")?;
        Ok(n)
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn append_event(&self, run_id: &str, event: &ProgressEvent) -> Result<()> {
        let payload = serde_json::to_string(event).context("Failed to encode event")?;
        self.conn
            .execute(
                "INSERT INTO run_events (run_id, event_type, payload) VALUES (?1, ?2, ?3)",
                params![run_id, event.kind(), payload],
            )
            .context("Failed to insert run event")?;
        Ok(())
    }

    pub fn list_events(&self, run_id: &str) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, event_type, payload, created_at FROM run_events
                 WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query run events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }
}

/// The persistent State Sink.
#[derive(Clone)]
pub struct RunStore {
    db: DbHandle,
}

impl RunStore {
    pub fn new(db: RunDb) -> Self {
        Self {
            db: DbHandle::new(db),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(RunDb::new(path)?))
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run_id = run_id.to_string();
        self.db.call(move |db| db.get_run(&run_id)).await
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.db.call(move |db| db.list_runs(limit)).await
    }

    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.db.call(|db| db.recover_interrupted()).await
    }
}

#[async_trait]
impl StateSink for RunStore {
    async fn persist(&self, run_id: &str, delta: ContextDelta) {
        let id = run_id.to_string();
        match self.db.call(move |db| db.apply_delta(&id, &delta)).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id, "dropped state delta for unknown run"),
            Err(e) => warn!(run_id, error = %e, "failed to persist run state"),
        }
    }

    async fn notify(&self, run_id: &str, event: ProgressEvent) {
        let id = run_id.to_string();
        if let Err(e) = self.db.call(move |db| db.append_event(&id, &event)).await {
            warn!(run_id, error = %e, "failed to store run event");
        }
    }
}
