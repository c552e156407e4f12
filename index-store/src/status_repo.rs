use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use offender_model::{IndexState, IndexStatus, SyncIndex};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{StatusStore, StoreError};

/// Fixed key of the singleton status row.
pub const STATUS_ID: &str = "STATUS";

/// SQLite-backed [`StatusStore`]. Writes are compare-and-swap on a version column.
pub struct SqliteStatusRepo {
    conn: Mutex<Connection>,
}

impl SqliteStatusRepo {
    /// Open an in-memory repository and initialize schema.
    pub fn new() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let repo = Self { conn: Mutex::new(conn) };
        repo.init()?;
        Ok(repo)
    }

    /// Open a file-backed repository at `path` and initialize schema if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let repo = Self { conn: Mutex::new(conn) };
        repo.init()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Backend("status connection poisoned".into()))
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"FULL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS index_status (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                current_index TEXT NOT NULL,
                current_index_state TEXT NOT NULL,
                current_index_start_build_time TEXT,
                current_index_end_build_time TEXT,
                other_index_state TEXT NOT NULL,
                other_index_start_build_time TEXT,
                other_index_end_build_time TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn bootstrap(conn: &Connection) -> Result<(), StoreError> {
        let initial = IndexStatus::new();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO index_status (
                id, version, current_index, current_index_state,
                current_index_start_build_time, current_index_end_build_time,
                other_index_state, other_index_start_build_time, other_index_end_build_time, updated_at
            ) VALUES (?1, 0, ?2, ?3, NULL, NULL, ?4, NULL, NULL, ?5)
            "#,
            params![
                STATUS_ID,
                initial.current_index.as_str(),
                initial.current_index_state.as_str(),
                initial.other_index_state.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl StatusStore for SqliteStatusRepo {
    fn load(&self) -> Result<(IndexStatus, i64), StoreError> {
        let conn = self.conn()?;
        Self::bootstrap(&conn)?;
        let row = conn
            .query_row(
                "SELECT version, current_index, current_index_state, current_index_start_build_time, current_index_end_build_time, other_index_state, other_index_start_build_time, other_index_end_build_time FROM index_status WHERE id = ?1",
                [STATUS_ID],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((version, current, current_state, cur_start, cur_end, other_state, other_start, other_end)) = row else {
            return Err(StoreError::Corrupt("status row missing after bootstrap".into()));
        };
        let status = IndexStatus {
            current_index: SyncIndex::parse(&current)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown index colour {current}")))?,
            current_index_state: parse_state(&current_state)?,
            current_index_start_build_time: parse_time(cur_start)?,
            current_index_end_build_time: parse_time(cur_end)?,
            other_index_state: parse_state(&other_state)?,
            other_index_start_build_time: parse_time(other_start)?,
            other_index_end_build_time: parse_time(other_end)?,
        };
        Ok((status, version))
    }

    fn save(&self, status: &IndexStatus, expected_version: i64) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Self::bootstrap(&conn)?;
        let n = conn.execute(
            r#"
            UPDATE index_status SET
                version = version + 1,
                current_index = ?1,
                current_index_state = ?2,
                current_index_start_build_time = ?3,
                current_index_end_build_time = ?4,
                other_index_state = ?5,
                other_index_start_build_time = ?6,
                other_index_end_build_time = ?7,
                updated_at = ?8
            WHERE id = ?9 AND version = ?10
            "#,
            params![
                status.current_index.as_str(),
                status.current_index_state.as_str(),
                status.current_index_start_build_time.map(|t| t.to_rfc3339()),
                status.current_index_end_build_time.map(|t| t.to_rfc3339()),
                status.other_index_state.as_str(),
                status.other_index_start_build_time.map(|t| t.to_rfc3339()),
                status.other_index_end_build_time.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                STATUS_ID,
                expected_version,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict { expected: expected_version });
        }
        Ok(expected_version + 1)
    }
}

fn parse_state(s: &str) -> Result<IndexState, StoreError> {
    IndexState::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown index state {s}")))
}

fn parse_time(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(&v)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| StoreError::Corrupt(format!("bad timestamp {v}: {e}"))),
    }
}
