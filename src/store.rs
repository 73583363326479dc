// ABOUTME: SQLite-backed snapshot sink storing each server's queues as JSON rows.
// ABOUTME: Loads stored servers back for restore at startup and for the admin CLI.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use officehours_core::{QueueSnapshot, ServerId, ServerSnapshot, SnapshotSink};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Summary row for a stored server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredServer {
    pub server_id: ServerId,
    pub saved_at: DateTime<Utc>,
    pub queue_count: usize,
}

#[derive(Clone)]
pub struct SqliteSnapshotStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// Open (or create) the database file, creating parent directories as needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        let store = Self::from_connection(Arc::new(Mutex::new(conn)))?;
        tracing::info!(db = %path.display(), "Snapshot store initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// Wrap an existing shared connection, creating tables if missing
    pub fn from_connection(db: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = Self { db };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Shared database connection for other stores (like the attendance log)
    pub fn db_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    fn initialize_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS servers (
                server_id TEXT PRIMARY KEY,
                saved_at TEXT NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS queues (
                server_id TEXT NOT NULL,
                queue_id TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (server_id, queue_id)
            )",
            [],
        )?;
        Ok(())
    }

    /// Replace everything stored for a server with the given snapshot
    pub fn write_server(&self, snapshot: &ServerSnapshot) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let saved_at = snapshot.saved_at.to_rfc3339();
        tx.execute(
            "INSERT INTO servers (server_id, saved_at) VALUES (?1, ?2)
             ON CONFLICT(server_id) DO UPDATE SET saved_at = excluded.saved_at",
            params![snapshot.server_id.as_str(), &saved_at],
        )?;
        tx.execute(
            "DELETE FROM queues WHERE server_id = ?1",
            params![snapshot.server_id.as_str()],
        )?;
        for queue in &snapshot.queues {
            let json = serde_json::to_string(queue)?;
            tx.execute(
                "INSERT INTO queues (server_id, queue_id, snapshot, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot.server_id.as_str(),
                    queue.queue_id().as_str(),
                    json,
                    &saved_at
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(
            server_id = %snapshot.server_id,
            queues = snapshot.queues.len(),
            "Server snapshot saved"
        );
        Ok(())
    }

    /// Upsert a single queue row
    pub fn write_queue(&self, server_id: &ServerId, queue: &QueueSnapshot) -> Result<()> {
        let db = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(queue)?;
        db.execute(
            "INSERT INTO servers (server_id, saved_at) VALUES (?1, ?2)
             ON CONFLICT(server_id) DO UPDATE SET saved_at = excluded.saved_at",
            params![server_id.as_str(), &now],
        )?;
        db.execute(
            "INSERT INTO queues (server_id, queue_id, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(server_id, queue_id) DO UPDATE
             SET snapshot = excluded.snapshot, updated_at = excluded.updated_at",
            params![server_id.as_str(), queue.queue_id().as_str(), json, &now],
        )?;
        Ok(())
    }

    /// Load a stored server, or None if nothing was ever saved for it
    pub fn load_server(&self, server_id: &ServerId) -> Result<Option<ServerSnapshot>> {
        let db = self.lock()?;
        let saved_at = db.query_row(
            "SELECT saved_at FROM servers WHERE server_id = ?1",
            params![server_id.as_str()],
            |row| row.get::<_, String>(0),
        );
        let saved_at = match saved_at {
            Ok(s) => parse_timestamp(&s)?,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stmt = db.prepare(
            "SELECT snapshot FROM queues WHERE server_id = ?1 ORDER BY queue_id ASC",
        )?;
        let queues = stmt
            .query_map(params![server_id.as_str()], |row| {
                let json: String = row.get(0)?;
                serde_json::from_str::<QueueSnapshot>(&json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ServerSnapshot {
            server_id: server_id.clone(),
            saved_at,
            queues,
        }))
    }

    /// Every stored server, ordered by id
    pub fn list_servers(&self) -> Result<Vec<StoredServer>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT s.server_id, s.saved_at, COUNT(q.queue_id)
             FROM servers s LEFT JOIN queues q ON q.server_id = s.server_id
             GROUP BY s.server_id, s.saved_at
             ORDER BY s.server_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, saved_at, count)| {
                Ok(StoredServer {
                    server_id: ServerId::new(id),
                    saved_at: parse_timestamp(&saved_at)?,
                    queue_count: usize::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    /// Forget a server entirely. Returns true if it was stored.
    pub fn delete_server(&self, server_id: &ServerId) -> Result<bool> {
        let db = self.lock()?;
        db.execute(
            "DELETE FROM queues WHERE server_id = ?1",
            params![server_id.as_str()],
        )?;
        let removed = db.execute(
            "DELETE FROM servers WHERE server_id = ?1",
            params![server_id.as_str()],
        )?;
        if removed > 0 {
            tracing::info!(server_id = %server_id, "Stored server deleted");
        }
        Ok(removed > 0)
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in database: {}", value))?
        .with_timezone(&Utc))
}

#[async_trait]
impl SnapshotSink for SqliteSnapshotStore {
    async fn save_server(&self, snapshot: &ServerSnapshot) -> Result<()> {
        self.write_server(snapshot)
    }

    async fn save_queue(&self, server_id: &ServerId, queue: &QueueSnapshot) -> Result<()> {
        self.write_queue(server_id, queue)
    }
}
