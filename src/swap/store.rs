use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension as _, params};

use super::{JobId, SwapJob, SwapState};
use crate::error::StoreError;

/// Durable map from job id to the job record. One SQLite row per job, the
/// record itself stored as JSON next to its state.
#[derive(Debug)]
pub struct JobStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl JobStore {
    pub fn connect(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // An update is durable once it returns.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        migrate(&conn)?;

        tracing::debug!(path = %path.display(), "job store opened");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<SwapJob>, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM swap_jobs WHERE job_id = ?1",
                params![job_id.0],
                |row| row.get(0),
            )
            .optional()?;

        Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn insert(&self, job: &SwapJob) -> Result<(), StoreError> {
        let record = serde_json::to_string(job)?;
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let rows = conn.execute(
            r#"
INSERT OR IGNORE INTO swap_jobs (job_id, state, record, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                job.job_id.0,
                job.state.as_str(),
                record,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::AlreadyExists(job.job_id));
        }
        Ok(())
    }

    /// Replaces the stored record. Returns once the write is committed.
    pub fn update(&self, job: &SwapJob) -> Result<(), StoreError> {
        let record = serde_json::to_string(job)?;
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let rows = conn.execute(
            "UPDATE swap_jobs SET state = ?2, record = ?3, updated_at = ?4 WHERE job_id = ?1",
            params![
                job.job_id.0,
                job.state.as_str(),
                record,
                job.updated_at.to_rfc3339(),
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(job.job_id));
        }
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<SwapJob>, StoreError> {
        self.query_records("SELECT record FROM swap_jobs ORDER BY job_id")
    }

    /// Jobs that have not reached a terminal state yet.
    pub fn list_unfinished(&self) -> Result<Vec<SwapJob>, StoreError> {
        let terminal = SwapState::TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_records(&format!(
            "SELECT record FROM swap_jobs WHERE state NOT IN ({terminal}) ORDER BY job_id"
        ))
    }

    fn query_records(&self, sql: &str) -> Result<Vec<SwapJob>, StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Closes the connection. Later calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let Some(conn) = self.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::debug!(path = %self.path.display(), "job store closed");
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swap_jobs (
  job_id INTEGER PRIMARY KEY,
  state TEXT NOT NULL,
  record TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swap_jobs_state_idx ON swap_jobs(state);
"#,
    )?;
    Ok(())
}
