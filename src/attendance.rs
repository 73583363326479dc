// ABOUTME: Attendance log extension writing completed help sessions and helper sessions to SQLite.
// ABOUTME: Rows are keyed by server so the admin CLI can report per-community attendance.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use officehours_core::{HelpSessionEntry, HelperSession, ServerExtension, ServerView};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One student's completed help session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelpSessionRecord {
    pub id: String,
    pub server_id: String,
    pub student_id: String,
    pub helper_id: String,
    pub queue_id: String,
    pub wait_start: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub wait_time_ms: i64,
    pub duration_ms: i64,
}

/// One helper's closed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelperSessionRecord {
    pub id: String,
    pub server_id: String,
    pub helper_id: String,
    pub help_start: DateTime<Utc>,
    pub help_end: DateTime<Utc>,
    pub helped_count: usize,
    pub active_time_ms: i64,
}

pub struct AttendanceExtension {
    db: Arc<Mutex<Connection>>,
}

impl AttendanceExtension {
    /// Share a connection with another store, creating attendance tables if missing
    pub fn new(db: Arc<Mutex<Connection>>) -> Result<Self> {
        let ext = Self { db };
        ext.initialize_schema()?;
        Ok(ext)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    fn initialize_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS help_sessions (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                helper_id TEXT NOT NULL,
                queue_id TEXT NOT NULL,
                wait_start TEXT NOT NULL,
                session_start TEXT NOT NULL,
                session_end TEXT NOT NULL,
                wait_time_ms INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS helper_sessions (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                helper_id TEXT NOT NULL,
                help_start TEXT NOT NULL,
                help_end TEXT NOT NULL,
                helped_count INTEGER NOT NULL,
                active_time_ms INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_help_sessions_server
             ON help_sessions (server_id, session_end)",
            [],
        )?;
        Ok(())
    }

    fn insert_help_session(&self, server_id: &str, entry: &HelpSessionEntry) -> Result<()> {
        let Some(end) = entry.session_end else {
            tracing::debug!(student = %entry.student_id, "Skipping incomplete help session");
            return Ok(());
        };
        let db = self.lock()?;
        db.execute(
            "INSERT INTO help_sessions (id, server_id, student_id, helper_id, queue_id,
                wait_start, session_start, session_end, wait_time_ms, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                uuid::Uuid::new_v4().to_string(),
                server_id,
                entry.student_id.as_str(),
                entry.helper_id.as_str(),
                entry.queue_id.as_str(),
                entry.wait_start.to_rfc3339(),
                entry.session_start.to_rfc3339(),
                end.to_rfc3339(),
                entry.wait_time_ms,
                entry.duration_ms().unwrap_or(0),
            ],
        )?;
        Ok(())
    }

    fn insert_helper_session(&self, server_id: &str, session: &HelperSession) -> Result<()> {
        let Some(end) = session.help_end else {
            tracing::debug!(helper = %session.actor_id, "Skipping open helper session");
            return Ok(());
        };
        let db = self.lock()?;
        db.execute(
            "INSERT INTO helper_sessions (id, server_id, helper_id, help_start, help_end,
                helped_count, active_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                server_id,
                session.actor_id.as_str(),
                session.help_start.to_rfc3339(),
                end.to_rfc3339(),
                session.helped_waiters.len() as i64,
                session.active_time_ms,
            ],
        )?;
        Ok(())
    }

    /// Most recent completed help sessions for a server, newest first
    pub fn help_sessions(&self, server_id: &str, limit: usize) -> Result<Vec<HelpSessionRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, server_id, student_id, helper_id, queue_id, wait_start,
                    session_start, session_end, wait_time_ms, duration_ms
             FROM help_sessions WHERE server_id = ?1
             ORDER BY session_end DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![server_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, server_id, student_id, helper_id, queue_id, wait, start, end, wait_ms, dur)| {
                    Ok(HelpSessionRecord {
                        id,
                        server_id,
                        student_id,
                        helper_id,
                        queue_id,
                        wait_start: parse_timestamp(&wait)?,
                        session_start: parse_timestamp(&start)?,
                        session_end: parse_timestamp(&end)?,
                        wait_time_ms: wait_ms,
                        duration_ms: dur,
                    })
                },
            )
            .collect()
    }

    /// Most recent closed helper sessions for a server, newest first
    pub fn helper_sessions(&self, server_id: &str, limit: usize) -> Result<Vec<HelperSessionRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, server_id, helper_id, help_start, help_end, helped_count, active_time_ms
             FROM helper_sessions WHERE server_id = ?1
             ORDER BY help_end DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![server_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, server_id, helper_id, start, end, helped, active)| {
                Ok(HelperSessionRecord {
                    id,
                    server_id,
                    helper_id,
                    help_start: parse_timestamp(&start)?,
                    help_end: parse_timestamp(&end)?,
                    helped_count: usize::try_from(helped).unwrap_or(0),
                    active_time_ms: active,
                })
            })
            .collect()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in database: {}", value))?
        .with_timezone(&Utc))
}

#[async_trait]
impl ServerExtension for AttendanceExtension {
    fn name(&self) -> &str {
        "attendance"
    }

    async fn on_student_leave_presence(
        &self,
        server: &ServerView,
        entry: &HelpSessionEntry,
    ) -> Result<()> {
        self.insert_help_session(server.server_id().as_str(), entry)
            .context("Failed to record help session")
    }

    async fn on_helper_stop_helping(
        &self,
        server: &ServerView,
        session: &HelperSession,
    ) -> Result<()> {
        self.insert_helper_session(server.server_id().as_str(), session)
            .context("Failed to record helper session")
    }
}
