//! drover-store — the durable state layer.
//!
//! Async SQLite-backed store for projects, tickets, dependencies, messages,
//! extractions, execution sessions, approved permissions, and the daemon
//! liveness record. Every multi-step write runs inside a transaction, and
//! ticket state transitions are conditional updates on the current status,
//! which makes them linearizable under concurrent loops.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use drover_core::clock::Clock;
use drover_core::types::{
    estimate_tokens, format_ticket_number, ApprovedPermission, AwaitingReason, DaemonState,
    DaemonStatus, ExecutionSession, Extraction, Message, MessageRole, NewProject, NewTicket,
    Project, SessionStatus, Ticket, TicketStatus,
};
use tokio_rusqlite::Connection;

mod rows;
use rows::{row_to_extraction, row_to_message, row_to_project, row_to_session, row_to_ticket};

pub use rows::{enum_from_sql, enum_to_sql};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TicketStatus, to: TicketStatus },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency cycle involving ticket {0}")]
    DependencyCycle(i64),
    #[error("ticket depends on itself: {0}")]
    SelfDependency(i64),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Db(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Optional per-message metadata for `append_message`.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    /// Exact token count when the producer has one; estimated otherwise.
    pub token_count: Option<i64>,
}

/// Fields for inserting an extraction row.
#[derive(Debug, Clone)]
pub struct NewExtraction {
    pub ticket_id: i64,
    pub from_msg_id: i64,
    pub to_msg_id: i64,
    pub decisions: String,
    pub problems_solved: String,
    pub files_modified: Vec<String>,
    pub tests_status: String,
    pub error_patterns: String,
    pub important_notes: String,
    pub tokens_before: i64,
    pub tokens_after: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn, clock };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn, clock };
        store.init_schema().await?;
        Ok(store)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS projects (
                        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                        code                   TEXT NOT NULL UNIQUE,
                        name                   TEXT NOT NULL,
                        web_path               TEXT,
                        app_path               TEXT,
                        default_execution_mode TEXT NOT NULL,
                        model_tier             TEXT NOT NULL,
                        git_enabled            INTEGER NOT NULL DEFAULT 0,
                        archived               INTEGER NOT NULL DEFAULT 0,
                        project_knowledge      TEXT NOT NULL DEFAULT '',
                        project_map            TEXT,
                        map_generated_at       TEXT,
                        next_ticket_seq        INTEGER NOT NULL DEFAULT 1,
                        created_at             TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tickets (
                        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id            INTEGER NOT NULL REFERENCES projects(id),
                        ticket_number         TEXT NOT NULL UNIQUE,
                        title                 TEXT NOT NULL,
                        description           TEXT NOT NULL DEFAULT '',
                        ticket_type           TEXT NOT NULL,
                        priority              TEXT NOT NULL,
                        sequence_order        INTEGER,
                        parent_ticket_id      INTEGER REFERENCES tickets(id),
                        is_forced             INTEGER NOT NULL DEFAULT 0,
                        execution_mode        TEXT,
                        deps_include_awaiting INTEGER NOT NULL DEFAULT 0,
                        model_tier            TEXT,
                        max_retries           INTEGER NOT NULL DEFAULT 3,
                        retry_count           INTEGER NOT NULL DEFAULT 0,
                        retry_after           TEXT,
                        review_scheduled_at   TEXT,
                        review_attempts       INTEGER NOT NULL DEFAULT 0,
                        awaiting_reason       TEXT,
                        status                TEXT NOT NULL DEFAULT 'open',
                        result_summary        TEXT,
                        total_tokens          INTEGER NOT NULL DEFAULT 0,
                        created_at            TEXT NOT NULL,
                        updated_at            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tickets_project_status
                        ON tickets(project_id, status);
                    CREATE INDEX IF NOT EXISTS idx_tickets_review
                        ON tickets(review_scheduled_at);

                    CREATE TABLE IF NOT EXISTS ticket_dependencies (
                        ticket_id            INTEGER NOT NULL REFERENCES tickets(id),
                        depends_on_ticket_id INTEGER NOT NULL REFERENCES tickets(id),
                        PRIMARY KEY (ticket_id, depends_on_ticket_id)
                    );

                    CREATE TABLE IF NOT EXISTS messages (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        ticket_id     INTEGER NOT NULL REFERENCES tickets(id),
                        role          TEXT NOT NULL,
                        content       TEXT NOT NULL,
                        tool_name     TEXT,
                        tool_input    TEXT,
                        token_count   INTEGER NOT NULL DEFAULT 0,
                        is_summarized INTEGER NOT NULL DEFAULT 0,
                        created_at    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_ticket
                        ON messages(ticket_id, id);

                    CREATE TABLE IF NOT EXISTS extractions (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        ticket_id       INTEGER NOT NULL REFERENCES tickets(id),
                        from_msg_id     INTEGER NOT NULL,
                        to_msg_id       INTEGER NOT NULL,
                        decisions       TEXT NOT NULL DEFAULT '',
                        problems_solved TEXT NOT NULL DEFAULT '',
                        files_modified  TEXT NOT NULL DEFAULT '[]',
                        tests_status    TEXT NOT NULL DEFAULT '',
                        error_patterns  TEXT NOT NULL DEFAULT '',
                        important_notes TEXT NOT NULL DEFAULT '',
                        tokens_before   INTEGER NOT NULL DEFAULT 0,
                        tokens_after    INTEGER NOT NULL DEFAULT 0,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_extractions_ticket
                        ON extractions(ticket_id, from_msg_id);

                    CREATE TABLE IF NOT EXISTS sessions (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        ticket_id     INTEGER NOT NULL REFERENCES tickets(id),
                        status        TEXT NOT NULL,
                        input_tokens  INTEGER NOT NULL DEFAULT 0,
                        output_tokens INTEGER NOT NULL DEFAULT 0,
                        api_calls     INTEGER NOT NULL DEFAULT 0,
                        started_at    TEXT NOT NULL,
                        ended_at      TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_ticket
                        ON sessions(ticket_id, status);

                    CREATE TABLE IF NOT EXISTS approved_permissions (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        ticket_id  INTEGER NOT NULL REFERENCES tickets(id),
                        tool       TEXT NOT NULL,
                        pattern    TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        UNIQUE (ticket_id, tool, pattern)
                    );

                    CREATE TABLE IF NOT EXISTS daemon_status (
                        id                INTEGER PRIMARY KEY CHECK (id = 1),
                        state             TEXT NOT NULL,
                        current_ticket_id INTEGER,
                        last_heartbeat    TEXT NOT NULL,
                        version           TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        let now = self.now();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (code, name, web_path, app_path,
                        default_execution_mode, model_tier, git_enabled, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        new.code,
                        new.name,
                        new.web_path,
                        new.app_path,
                        enum_to_sql(&new.default_execution_mode),
                        enum_to_sql(&new.model_tier),
                        new.git_enabled as i64,
                        now.to_rfc3339(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.get_project(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, code, name, web_path, app_path, default_execution_mode,
                            model_tier, git_enabled, archived, project_knowledge,
                            project_map, map_generated_at, created_at
                     FROM projects WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn get_project_by_code(&self, code: &str) -> Result<Option<Project>> {
        let code = code.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, code, name, web_path, app_path, default_execution_mode,
                            model_tier, git_enabled, archived, project_knowledge,
                            project_map, map_generated_at, created_at
                     FROM projects WHERE code = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![code])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    /// Unarchived projects in id order; the scheduler rotates over these.
    pub async fn list_active_projects(&self) -> Result<Vec<Project>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, code, name, web_path, app_path, default_execution_mode,
                            model_tier, git_enabled, archived, project_knowledge,
                            project_map, map_generated_at, created_at
                     FROM projects WHERE archived = 0 ORDER BY id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn archive_project(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute("UPDATE projects SET archived = 1 WHERE id = ?1", [id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_project_map(&self, id: i64, map: String) -> Result<()> {
        let now = self.now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projects SET project_map = ?2, map_generated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, map, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Append a block to the project's accumulated knowledge.
    pub async fn fold_into_knowledge(&self, id: i64, addition: &str) -> Result<()> {
        let addition = addition.trim().to_string();
        if addition.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projects
                     SET project_knowledge = CASE
                         WHEN project_knowledge = '' THEN ?2
                         ELSE project_knowledge || char(10) || ?2
                     END
                     WHERE id = ?1",
                    rusqlite::params![id, addition],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tickets — creation and lookup
    // -----------------------------------------------------------------------

    /// Create a ticket, allocating the next `{CODE}-NNNN` number for its
    /// project inside one transaction.
    pub async fn create_ticket(&self, new: NewTicket) -> Result<Ticket> {
        let now = self.now();
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let (code, seq): (String, i64) = tx.query_row(
                    "SELECT code, next_ticket_seq FROM projects WHERE id = ?1",
                    [new.project_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                tx.execute(
                    "UPDATE projects SET next_ticket_seq = next_ticket_seq + 1 WHERE id = ?1",
                    [new.project_id],
                )?;
                let number = format_ticket_number(&code, seq);
                tx.execute(
                    "INSERT INTO tickets (project_id, ticket_number, title, description,
                        ticket_type, priority, sequence_order, parent_ticket_id, is_forced,
                        execution_mode, deps_include_awaiting, model_tier, max_retries,
                        status, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,'open',?14,?14)",
                    rusqlite::params![
                        new.project_id,
                        number,
                        new.title,
                        new.description,
                        enum_to_sql(&new.ticket_type),
                        enum_to_sql(&new.priority),
                        new.sequence_order,
                        new.parent_ticket_id,
                        new.is_forced as i64,
                        new.execution_mode.as_ref().map(enum_to_sql),
                        new.deps_include_awaiting as i64,
                        new.model_tier.as_ref().map(enum_to_sql),
                        new.max_retries as i64,
                        now.to_rfc3339(),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;
        self.get_ticket(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {id}")))
    }

    pub async fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets WHERE id = ?1",
                    rows::TICKET_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_ticket(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn get_ticket_by_number(&self, number: &str) -> Result<Option<Ticket>> {
        let number = number.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets WHERE ticket_number = ?1",
                    rows::TICKET_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![number])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_ticket(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn tickets_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>> {
        let status = enum_to_sql(&status);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets WHERE status = ?1 ORDER BY id",
                    rows::TICKET_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn tickets_in_progress(&self) -> Result<Vec<Ticket>> {
        self.tickets_by_status(TicketStatus::InProgress).await
    }

    // -----------------------------------------------------------------------
    // Tickets — scheduling
    // -----------------------------------------------------------------------

    /// Return the single best eligible ticket for a project, or none.
    ///
    /// Eligibility: dispatchable status, cooldown expired, all dependencies
    /// satisfied (relaxed mode also accepts `awaiting_input`), parent (if
    /// any) terminal. Ordering: forced first, then sequence_order with NULL
    /// last, then priority, then id.
    ///
    /// Externally seeded rows may carry the legacy literal statuses 'new'
    /// or 'pending'; both dispatch like 'open'.
    pub async fn select_next_ticket(&self, project_id: i64) -> Result<Option<Ticket>> {
        let now = self.now().to_rfc3339();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets t
                     WHERE t.project_id = ?1
                       AND t.status IN ('open','new','pending')
                       AND (t.retry_after IS NULL OR t.retry_after <= ?2)
                       AND (t.parent_ticket_id IS NULL OR EXISTS (
                             SELECT 1 FROM tickets p
                             WHERE p.id = t.parent_ticket_id
                               AND p.status IN ('done','skipped')))
                       AND NOT EXISTS (
                             SELECT 1 FROM ticket_dependencies d
                             JOIN tickets dep ON dep.id = d.depends_on_ticket_id
                             WHERE d.ticket_id = t.id
                               AND dep.status NOT IN ('done','skipped')
                               AND NOT (t.deps_include_awaiting = 1
                                        AND dep.status = 'awaiting_input'))
                     ORDER BY t.is_forced DESC,
                              CASE WHEN t.sequence_order IS NULL THEN 1 ELSE 0 END,
                              t.sequence_order ASC,
                              CASE t.priority
                                  WHEN 'critical' THEN 0
                                  WHEN 'high' THEN 1
                                  WHEN 'medium' THEN 2
                                  ELSE 3
                              END,
                              t.id ASC
                     LIMIT 1",
                    rows::ticket_columns_qualified("t")
                ))?;
                let mut rows = stmt.query(rusqlite::params![project_id, now])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_ticket(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    /// Atomically transition `open -> in_progress` and insert a fresh
    /// running session; returns the session id. Fails with `Conflict` when
    /// the ticket is no longer dispatchable.
    pub async fn claim_ticket(&self, ticket_id: i64) -> Result<i64> {
        let now = self.now().to_rfc3339();
        let claimed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE tickets
                     SET status = 'in_progress', awaiting_reason = NULL, updated_at = ?2
                     WHERE id = ?1 AND status IN ('open','new','pending')",
                    rusqlite::params![ticket_id, now],
                )?;
                if changed == 0 {
                    tx.rollback()?;
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO sessions (ticket_id, status, started_at)
                     VALUES (?1, 'running', ?2)",
                    rusqlite::params![ticket_id, now],
                )?;
                let session_id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Some(session_id))
            })
            .await?;
        match claimed {
            Some(session_id) => {
                tracing::debug!(ticket_id, session_id, "ticket claimed");
                Ok(session_id)
            }
            None => Err(StoreError::Conflict(format!(
                "ticket {ticket_id} is no longer dispatchable"
            ))),
        }
    }

    /// Validate and apply a status transition; writes `awaiting_reason`
    /// (clearing it when `None`). The update is conditional on the status
    /// read in the same transaction, so concurrent writers serialize.
    pub async fn transition_ticket(
        &self,
        ticket_id: i64,
        new_status: TicketStatus,
        reason: Option<AwaitingReason>,
    ) -> Result<()> {
        let now = self.now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current_raw: String = tx.query_row(
                    "SELECT status FROM tickets WHERE id = ?1",
                    [ticket_id],
                    |r| r.get(0),
                )?;
                let current = rows::ticket_status_from_sql(&current_raw);
                if !current.can_transition_to(&new_status) {
                    tx.rollback()?;
                    return Ok(Err(StoreError::InvalidTransition {
                        from: current,
                        to: new_status,
                    }));
                }
                let changed = tx.execute(
                    "UPDATE tickets
                     SET status = ?2, awaiting_reason = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = ?5",
                    rusqlite::params![
                        ticket_id,
                        enum_to_sql(&new_status),
                        reason.as_ref().map(enum_to_sql),
                        now,
                        current_raw,
                    ],
                )?;
                if changed == 0 {
                    tx.rollback()?;
                    return Ok(Err(StoreError::Conflict(format!(
                        "ticket {ticket_id} changed status concurrently"
                    ))));
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;
        Ok(())
    }

    /// Overwrite the awaiting reason without a status change (reviewer
    /// verdicts on tickets that stay in `awaiting_input`).
    pub async fn set_awaiting_reason(
        &self,
        ticket_id: i64,
        reason: Option<AwaitingReason>,
    ) -> Result<()> {
        let now = self.now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET awaiting_reason = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![ticket_id, reason.as_ref().map(enum_to_sql), now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record a result summary (clamped to 2,000 chars) for parent-chain
    /// prompts.
    pub async fn set_result_summary(&self, ticket_id: i64, summary: &str) -> Result<()> {
        let mut summary = summary.to_string();
        if summary.len() > 2_000 {
            let cut = summary
                .char_indices()
                .take_while(|(i, _)| *i < 2_000)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            summary.truncate(cut);
        }
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET result_summary = ?2 WHERE id = ?1",
                    rusqlite::params![ticket_id, summary],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Increment `retry_count`, returning the new value.
    pub async fn bump_retry(&self, ticket_id: i64) -> Result<u32> {
        let count = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET retry_count = retry_count + 1 WHERE id = ?1",
                    [ticket_id],
                )?;
                let count: i64 = conn.query_row(
                    "SELECT retry_count FROM tickets WHERE id = ?1",
                    [ticket_id],
                    |r| r.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count as u32)
    }

    pub async fn set_retry_after(
        &self,
        ticket_id: i64,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET retry_after = ?2 WHERE id = ?1",
                    rusqlite::params![ticket_id, until.map(|d| d.to_rfc3339())],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tickets — review scheduling
    // -----------------------------------------------------------------------

    pub async fn schedule_review(&self, ticket_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET review_scheduled_at = ?2 WHERE id = ?1",
                    rusqlite::params![ticket_id, at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn cancel_review(&self, ticket_id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET review_scheduled_at = NULL, review_attempts = 0
                     WHERE id = ?1",
                    [ticket_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn bump_review_attempts(&self, ticket_id: i64) -> Result<u32> {
        let count = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tickets SET review_attempts = review_attempts + 1 WHERE id = ?1",
                    [ticket_id],
                )?;
                let count: i64 = conn.query_row(
                    "SELECT review_attempts FROM tickets WHERE id = ?1",
                    [ticket_id],
                    |r| r.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count as u32)
    }

    /// Tickets whose scheduled review time has arrived.
    pub async fn due_reviews(&self) -> Result<Vec<Ticket>> {
        let now = self.now().to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets
                     WHERE review_scheduled_at IS NOT NULL AND review_scheduled_at <= ?1
                     ORDER BY review_scheduled_at",
                    rows::TICKET_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![now])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Tickets awaiting input since before `cutoff` (deadline sweep).
    pub async fn stale_awaiting(&self, cutoff: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let cutoff = cutoff.to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets
                     WHERE status = 'awaiting_input' AND updated_at <= ?1
                     ORDER BY updated_at",
                    rows::TICKET_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Add a dependency edge. Self-loops and cycles are rejected; the cycle
    /// walk follows existing edges from `depends_on` looking for `ticket_id`.
    pub async fn add_dependency(&self, ticket_id: i64, depends_on: i64) -> Result<()> {
        if ticket_id == depends_on {
            return Err(StoreError::SelfDependency(ticket_id));
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                // Walk transitively from depends_on; reaching ticket_id
                // means the new edge would close a cycle.
                let mut frontier = vec![depends_on];
                let mut seen = std::collections::HashSet::new();
                while let Some(current) = frontier.pop() {
                    if current == ticket_id {
                        tx.rollback()?;
                        return Ok(Err(StoreError::DependencyCycle(ticket_id)));
                    }
                    if !seen.insert(current) {
                        continue;
                    }
                    let mut stmt = tx.prepare(
                        "SELECT depends_on_ticket_id FROM ticket_dependencies
                         WHERE ticket_id = ?1",
                    )?;
                    let mut edge_rows = stmt.query([current])?;
                    while let Some(row) = edge_rows.next()? {
                        frontier.push(row.get(0)?);
                    }
                }
                tx.execute(
                    "INSERT OR IGNORE INTO ticket_dependencies
                        (ticket_id, depends_on_ticket_id) VALUES (?1, ?2)",
                    rusqlite::params![ticket_id, depends_on],
                )?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;
        Ok(())
    }

    pub async fn dependencies_of(&self, ticket_id: i64) -> Result<Vec<Ticket>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets t
                     JOIN ticket_dependencies d ON d.depends_on_ticket_id = t.id
                     WHERE d.ticket_id = ?1 ORDER BY t.id",
                    rows::ticket_columns_qualified("t")
                ))?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Insert-only append; returns the new message id and rolls the token
    /// count up into the ticket aggregate.
    pub async fn append_message(
        &self,
        ticket_id: i64,
        role: MessageRole,
        content: &str,
        meta: MessageMeta,
    ) -> Result<i64> {
        let now = self.now().to_rfc3339();
        let content = content.to_string();
        let tokens = meta.token_count.unwrap_or_else(|| estimate_tokens(&content));
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO messages (ticket_id, role, content, tool_name,
                        tool_input, token_count, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        ticket_id,
                        enum_to_sql(&role),
                        content,
                        meta.tool_name,
                        meta.tool_input.as_ref().map(|v| v.to_string()),
                        tokens,
                        now,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE tickets SET total_tokens = total_tokens + ?2 WHERE id = ?1",
                    rusqlite::params![ticket_id, tokens],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    pub async fn messages(&self, ticket_id: i64) -> Result<Vec<Message>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE ticket_id = ?1 ORDER BY id",
                    rows::MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// The last `n` messages in chronological order.
    pub async fn recent_messages(&self, ticket_id: i64, n: usize) -> Result<Vec<Message>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM (
                         SELECT {} FROM messages WHERE ticket_id = ?1
                         ORDER BY id DESC LIMIT ?2
                     ) ORDER BY id",
                    rows::MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![ticket_id, n as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn last_message(&self, ticket_id: i64) -> Result<Option<Message>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE ticket_id = ?1 ORDER BY id DESC LIMIT 1",
                    rows::MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_message(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn unsummarized_messages(&self, ticket_id: i64) -> Result<Vec<Message>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE ticket_id = ?1 AND is_summarized = 0 ORDER BY id",
                    rows::MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    pub async fn unsummarized_token_total(&self, ticket_id: i64) -> Result<i64> {
        let total = self
            .conn
            .call(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(token_count), 0) FROM messages
                     WHERE ticket_id = ?1 AND is_summarized = 0",
                    [ticket_id],
                    |r| r.get(0),
                )?;
                Ok(total)
            })
            .await?;
        Ok(total)
    }

    pub async fn message_count(&self, ticket_id: i64) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE ticket_id = ?1",
                    [ticket_id],
                    |r| r.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count as usize)
    }

    pub async fn mark_summarized(&self, ticket_id: i64, from: i64, to: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET is_summarized = 1
                     WHERE ticket_id = ?1 AND id >= ?2 AND id <= ?3",
                    rusqlite::params![ticket_id, from, to],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Extractions
    // -----------------------------------------------------------------------

    pub async fn insert_extraction(&self, new: NewExtraction) -> Result<i64> {
        let now = self.now().to_rfc3339();
        let files = serde_json::to_string(&new.files_modified)
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO extractions (ticket_id, from_msg_id, to_msg_id,
                        decisions, problems_solved, files_modified, tests_status,
                        error_patterns, important_notes, tokens_before, tokens_after,
                        created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        new.ticket_id,
                        new.from_msg_id,
                        new.to_msg_id,
                        new.decisions,
                        new.problems_solved,
                        files,
                        new.tests_status,
                        new.error_patterns,
                        new.important_notes,
                        new.tokens_before,
                        new.tokens_after,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Extractions for a ticket in range order.
    pub async fn extractions(&self, ticket_id: i64) -> Result<Vec<Extraction>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, from_msg_id, to_msg_id, decisions,
                            problems_solved, files_modified, tests_status,
                            error_patterns, important_notes, tokens_before,
                            tokens_after, created_at
                     FROM extractions WHERE ticket_id = ?1 ORDER BY from_msg_id",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_extraction(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    /// Tickets whose unsummarized token total exceeds the threshold and
    /// whose status is neither terminal nor `in_progress` (summarizing a
    /// live conversation would race the runner's appends).
    pub async fn summarize_candidates(&self, threshold: i64) -> Result<Vec<Ticket>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tickets t
                     WHERE t.status NOT IN ('done','skipped','in_progress')
                       AND (SELECT COALESCE(SUM(m.token_count), 0) FROM messages m
                            WHERE m.ticket_id = t.id AND m.is_summarized = 0) > ?1
                     ORDER BY t.id",
                    rows::ticket_columns_qualified("t")
                ))?;
                let mut rows = stmt.query(rusqlite::params![threshold])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn finish_session(&self, session_id: i64, status: SessionStatus) -> Result<()> {
        let now = self.now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = ?2, ended_at = ?3 WHERE id = ?1",
                    rusqlite::params![session_id, enum_to_sql(&status), now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Accumulate a usage event into a session; each call counts one API
    /// call.
    pub async fn record_usage(
        &self,
        session_id: i64,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions
                     SET input_tokens = input_tokens + ?2,
                         output_tokens = output_tokens + ?3,
                         api_calls = api_calls + 1
                     WHERE id = ?1",
                    rusqlite::params![session_id, input_tokens, output_tokens],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<ExecutionSession>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, status, input_tokens, output_tokens,
                            api_calls, started_at, ended_at
                     FROM sessions WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![session_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn running_session(&self, ticket_id: i64) -> Result<Option<ExecutionSession>> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, status, input_tokens, output_tokens,
                            api_calls, started_at, ended_at
                     FROM sessions WHERE ticket_id = ?1 AND status = 'running'
                     ORDER BY id DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }

    pub async fn running_session_count(&self) -> Result<i64> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sessions WHERE status = 'running'",
                    [],
                    |r| r.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Approved permissions
    // -----------------------------------------------------------------------

    pub async fn add_approved_permission(
        &self,
        ticket_id: i64,
        tool: &str,
        pattern: &str,
    ) -> Result<()> {
        let now = self.now().to_rfc3339();
        let tool = tool.to_string();
        let pattern = pattern.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO approved_permissions
                        (ticket_id, tool, pattern, created_at)
                     VALUES (?1,?2,?3,?4)",
                    rusqlite::params![ticket_id, tool, pattern, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn approved_permissions(&self, ticket_id: i64) -> Result<Vec<ApprovedPermission>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, tool, pattern, created_at
                     FROM approved_permissions WHERE ticket_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let created_at: String = row.get(4)?;
                    out.push(ApprovedPermission {
                        id: row.get(0)?,
                        ticket_id: row.get(1)?,
                        tool: row.get(2)?,
                        pattern: row.get(3)?,
                        created_at: rows::parse_datetime(&created_at),
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Daemon status
    // -----------------------------------------------------------------------

    pub async fn update_daemon_status(
        &self,
        state: DaemonState,
        current_ticket_id: Option<i64>,
    ) -> Result<()> {
        let now = self.now().to_rfc3339();
        let version = env!("CARGO_PKG_VERSION").to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO daemon_status (id, state, current_ticket_id,
                        last_heartbeat, version)
                     VALUES (1, ?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        state = excluded.state,
                        current_ticket_id = excluded.current_ticket_id,
                        last_heartbeat = excluded.last_heartbeat,
                        version = excluded.version",
                    rusqlite::params![enum_to_sql(&state), current_ticket_id, now, version],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_daemon_status(&self) -> Result<Option<DaemonStatus>> {
        let row = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT state, current_ticket_id, last_heartbeat, version
                     FROM daemon_status WHERE id = 1",
                )?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => {
                        let state_raw: String = row.get(0)?;
                        let heartbeat_raw: String = row.get(2)?;
                        Ok(Some(DaemonStatus {
                            state: enum_from_sql(&state_raw),
                            current_ticket_id: row.get(1)?,
                            last_heartbeat: rows::parse_datetime(&heartbeat_raw),
                            version: row.get(3)?,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
