use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{ApprovalRequest, ApprovalStatus, Task, TaskStatus, TaskType};

/// Async SQLite-backed store for queue tasks and approval requests.
///
/// This is the single point of cross-process mutual exclusion: the claim
/// statement transitions a batch of rows `pending -> processing` atomically,
/// so two workers polling the same database file never claim the same task.
pub struct CoreDb {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

// Fixed sub-second precision keeps lexicographic ordering of the stored
// strings identical to chronological ordering, which the claim query's
// `scheduled_for <= now` comparison relies on.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

const TASK_COLUMNS: &str = "id, agent_id, task_type, payload, priority, status, attempts, \
     max_attempts, scheduled_for, created_at, started_at, completed_at, error";

const APPROVAL_COLUMNS: &str = "id, agent_id, action_type, action_payload, reason, \
     context_summary, status, decided_by, decision_reason, expires_at, created_at, decided_at";

impl CoreDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref().to_owned()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id            TEXT PRIMARY KEY,
                        agent_id      TEXT NOT NULL,
                        task_type     TEXT NOT NULL,
                        payload       TEXT NOT NULL,
                        priority      INTEGER NOT NULL DEFAULT 0,
                        status        TEXT NOT NULL,
                        attempts      INTEGER NOT NULL DEFAULT 0,
                        max_attempts  INTEGER NOT NULL DEFAULT 3,
                        scheduled_for TEXT NOT NULL,
                        created_at    TEXT NOT NULL,
                        started_at    TEXT,
                        completed_at  TEXT,
                        error         TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_claim
                        ON tasks(status, scheduled_for, priority);

                    CREATE TABLE IF NOT EXISTS approvals (
                        id              TEXT PRIMARY KEY,
                        agent_id        TEXT NOT NULL,
                        action_type     TEXT NOT NULL,
                        action_payload  TEXT NOT NULL,
                        reason          TEXT NOT NULL,
                        context_summary TEXT,
                        status          TEXT NOT NULL,
                        decided_by      TEXT,
                        decision_reason TEXT,
                        expires_at      TEXT NOT NULL,
                        created_at      TEXT NOT NULL,
                        decided_at      TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_approvals_status
                        ON approvals(status, expires_at);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Task CRUD + claim
    // -----------------------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> Result<(), tokio_rusqlite::Error> {
        let id = task.id.to_string();
        let agent_id = task.agent_id.to_string();
        let task_type = task.task_type.as_str().to_string();
        let payload = task.payload.to_string();
        let priority = task.priority;
        let status = enum_to_sql(&task.status);
        let attempts = task.attempts;
        let max_attempts = task.max_attempts;
        let scheduled_for = ts_to_sql(&task.scheduled_for);
        let created_at = ts_to_sql(&task.created_at);
        let started_at = task.started_at.as_ref().map(ts_to_sql);
        let completed_at = task.completed_at.as_ref().map(ts_to_sql);
        let error = task.error.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, agent_id, task_type, payload, priority, status,
                        attempts, max_attempts, scheduled_for, created_at, started_at,
                        completed_at, error)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    rusqlite::params![
                        id,
                        agent_id,
                        task_type,
                        payload,
                        priority,
                        status,
                        attempts,
                        max_attempts,
                        scheduled_for,
                        created_at,
                        started_at,
                        completed_at,
                        error,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Atomically claim up to `limit` due tasks.
    ///
    /// The whole select-order-limit-update runs as one statement, so a
    /// concurrent claimer on another connection either sees a row as already
    /// `processing` or takes it itself, never both. Claiming counts as an
    /// attempt.
    pub async fn claim_due(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, tokio_rusqlite::Error> {
        let now_str = ts_to_sql(&now);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "UPDATE tasks
                     SET status = 'processing', started_at = ?1, attempts = attempts + 1
                     WHERE id IN (
                         SELECT id FROM tasks
                         WHERE status = 'pending' AND scheduled_for <= ?1
                         ORDER BY priority DESC, scheduled_for ASC
                         LIMIT ?2
                     )
                     RETURNING {TASK_COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![now_str, limit])?;
                let mut claimed = Vec::new();
                while let Some(row) = rows.next()? {
                    claimed.push(row_to_task(row)?);
                }
                // RETURNING does not guarantee row order; restore the claim
                // ordering for dispatch.
                claimed.sort_by(|a: &Task, b: &Task| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.scheduled_for.cmp(&b.scheduled_for))
                });
                Ok(claimed)
            })
            .await
            .inspect(|claimed| {
                if !claimed.is_empty() {
                    tracing::debug!(count = claimed.len(), "tasks claimed");
                }
            })
    }

    /// Mark a task completed. Conditional on the row still being
    /// `processing`, so a worker whose task was stale-recovered in the
    /// meantime cannot clobber the newer state. Returns whether the row was
    /// updated.
    pub async fn complete_task(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let now_str = ts_to_sql(&now);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'completed', completed_at = ?2, error = NULL
                     WHERE id = ?1 AND status = 'processing'",
                    rusqlite::params![id_str, now_str],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Mark a task permanently failed. Same conditional-update semantics as
    /// [`complete_task`](Self::complete_task).
    pub async fn fail_task(
        &self,
        id: Uuid,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let now_str = ts_to_sql(&now);
        let error = error.into();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'failed', completed_at = ?2, error = ?3
                     WHERE id = ?1 AND status = 'processing'",
                    rusqlite::params![id_str, now_str, error],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Return a task to `pending` for a later attempt. The update predicate
    /// includes `attempts < max_attempts`, so a task at its attempt cap can
    /// never re-enter the queue through this path.
    pub async fn retry_task(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let next_str = ts_to_sql(&next_attempt_at);
        let error = error.into();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks
                     SET status = 'pending', scheduled_for = ?2, started_at = NULL, error = ?3
                     WHERE id = ?1 AND status = 'processing' AND attempts < max_attempts",
                    rusqlite::params![id_str, next_str, error],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Recover tasks stuck in `processing` since before `cutoff`.
    ///
    /// Tasks with attempts remaining go back to `pending` (eligible
    /// immediately); the rest are force-failed. Returns `(retried,
    /// force_failed)` ids.
    pub async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Uuid>, Vec<Uuid>), tokio_rusqlite::Error> {
        let cutoff_str = ts_to_sql(&cutoff);
        let now_str = ts_to_sql(&now);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut retried = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "UPDATE tasks
                         SET status = 'pending', started_at = NULL,
                             error = 'recovered: processing timed out'
                         WHERE status = 'processing' AND started_at <= ?1
                               AND attempts < max_attempts
                         RETURNING id",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cutoff_str])?;
                    while let Some(row) = rows.next()? {
                        let id: String = row.get(0)?;
                        retried.push(Uuid::parse_str(&id).expect("valid uuid"));
                    }
                }
                let mut failed = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "UPDATE tasks
                         SET status = 'failed', completed_at = ?2,
                             error = 'abandoned: processing timed out with no attempts left'
                         WHERE status = 'processing' AND started_at <= ?1
                         RETURNING id",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cutoff_str, now_str])?;
                    while let Some(row) = rows.next()? {
                        let id: String = row.get(0)?;
                        failed.push(Uuid::parse_str(&id).expect("valid uuid"));
                    }
                }
                tx.commit()?;
                Ok((retried, failed))
            })
            .await
    }

    pub async fn count_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<u64, tokio_rusqlite::Error> {
        let status_str = enum_to_sql(&status);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT COUNT(*) FROM tasks WHERE status = ?1")?;
                let n: u64 = stmt.query_row(rusqlite::params![status_str], |r| r.get(0))?;
                Ok(n)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Approval CRUD
    // -----------------------------------------------------------------------

    pub async fn insert_approval(
        &self,
        req: &ApprovalRequest,
    ) -> Result<(), tokio_rusqlite::Error> {
        let id = req.id.to_string();
        let agent_id = req.agent_id.to_string();
        let action_type = req.action_type.clone();
        let action_payload = req.action_payload.to_string();
        let reason = req.reason.clone();
        let context_summary = req.context_summary.clone();
        let status = enum_to_sql(&req.status);
        let decided_by = req.decided_by.clone();
        let decision_reason = req.decision_reason.clone();
        let expires_at = ts_to_sql(&req.expires_at);
        let created_at = ts_to_sql(&req.created_at);
        let decided_at = req.decided_at.as_ref().map(ts_to_sql);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO approvals (id, agent_id, action_type, action_payload, reason,
                        context_summary, status, decided_by, decision_reason, expires_at,
                        created_at, decided_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        id,
                        agent_id,
                        action_type,
                        action_payload,
                        reason,
                        context_summary,
                        status,
                        decided_by,
                        decision_reason,
                        expires_at,
                        created_at,
                        decided_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_approval(
        &self,
        id: Uuid,
    ) -> Result<Option<ApprovalRequest>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_approval(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Record a decision on a pending request.
    ///
    /// The `status = 'pending'` predicate is the optimistic-concurrency
    /// guard: of two near-simultaneous deciders, exactly one update lands.
    /// Returns whether this caller won.
    pub async fn decide_approval(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        decided_by: Option<String>,
        decision_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let status_str = enum_to_sql(&status);
        let now_str = ts_to_sql(&now);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE approvals
                     SET status = ?2, decided_by = ?3, decision_reason = ?4, decided_at = ?5
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id_str, status_str, decided_by, decision_reason, now_str],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Flip every pending request past its expiry to `expired`, returning
    /// the affected rows so callers can fan out notifications.
    pub async fn expire_stale_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, tokio_rusqlite::Error> {
        let now_str = ts_to_sql(&now);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "UPDATE approvals
                     SET status = 'expired', decided_at = ?1
                     WHERE status = 'pending' AND expires_at <= ?1
                     RETURNING {APPROVAL_COLUMNS}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![now_str])?;
                let mut expired = Vec::new();
                while let Some(row) = rows.next()? {
                    expired.push(row_to_approval(row)?);
                }
                Ok(expired)
            })
            .await
    }

    pub async fn list_approvals_by_status(
        &self,
        status: ApprovalStatus,
    ) -> Result<Vec<ApprovalRequest>, tokio_rusqlite::Error> {
        let status_str = enum_to_sql(&status);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE status = ?1 ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![status_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_approval(row)?);
                }
                Ok(out)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_str: String = row.get(0)?;
    let agent_id_str: String = row.get(1)?;
    let task_type_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let status_str: String = row.get(5)?;
    let scheduled_for_str: String = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let started_at_str: Option<String> = row.get(10)?;
    let completed_at_str: Option<String> = row.get(11)?;

    Ok(Task {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        agent_id: Uuid::parse_str(&agent_id_str).expect("valid uuid"),
        task_type: TaskType::parse(&task_type_str),
        payload: serde_json::from_str(&payload_str).expect("valid json"),
        priority: row.get(4)?,
        status: enum_from_sql(&status_str),
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        scheduled_for: ts_from_sql(&scheduled_for_str),
        created_at: ts_from_sql(&created_at_str),
        started_at: started_at_str.map(|s| ts_from_sql(&s)),
        completed_at: completed_at_str.map(|s| ts_from_sql(&s)),
        error: row.get(12)?,
    })
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let id_str: String = row.get(0)?;
    let agent_id_str: String = row.get(1)?;
    let action_payload_str: String = row.get(3)?;
    let status_str: String = row.get(6)?;
    let expires_at_str: String = row.get(9)?;
    let created_at_str: String = row.get(10)?;
    let decided_at_str: Option<String> = row.get(11)?;

    Ok(ApprovalRequest {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        agent_id: Uuid::parse_str(&agent_id_str).expect("valid uuid"),
        action_type: row.get(2)?,
        action_payload: serde_json::from_str(&action_payload_str).expect("valid json"),
        reason: row.get(4)?,
        context_summary: row.get(5)?,
        status: enum_from_sql(&status_str),
        decided_by: row.get(7)?,
        decision_reason: row.get(8)?,
        expires_at: ts_from_sql(&expires_at_str),
        created_at: ts_from_sql(&created_at_str),
        decided_at: decided_at_str.map(|s| ts_from_sql(&s)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
