use crate::models::{
    AttendanceEntry, AttendanceRecord, AttendanceStatus, ClassSession, Cohort, Identity,
    NewIdentity,
};
use crate::{AttendanceStore, StoreError};
use chrono::{NaiveDate, Utc};
use roster_core::Embedding;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS identities (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT NOT NULL,
        external_id     TEXT NOT NULL,
        embedding       BLOB NOT NULL,
        thumbnail_path  TEXT,
        course          TEXT,
        year            TEXT,
        semester        TEXT,
        cohort_group    TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_identities_external_id ON identities(external_id);

    CREATE TABLE IF NOT EXISTS sessions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        owner           TEXT NOT NULL,
        course          TEXT,
        year            TEXT,
        semester        TEXT,
        cohort_group    TEXT,
        is_active       INTEGER NOT NULL DEFAULT 1,
        started_at      TEXT NOT NULL,
        ended_at        TEXT
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id     INTEGER NOT NULL REFERENCES identities(id),
        session_id      INTEGER NOT NULL REFERENCES sessions(id),
        date            TEXT NOT NULL,
        time            TEXT NOT NULL,
        status          TEXT NOT NULL,
        UNIQUE(identity_id, date)
    );
";

const IDENTITY_COLUMNS: &str = "id, name, external_id, embedding, thumbnail_path, \
                                course, year, semester, cohort_group, created_at";

const ENTRY_QUERY: &str = "
    SELECT a.id, i.name, i.external_id, a.identity_id, a.session_id, a.date, a.time, a.status
    FROM attendance a
    JOIN identities i ON i.id = a.identity_id";

const SESSION_COLUMNS: &str = "id, owner, course, year, semester, cohort_group, \
                               is_active, started_at, ended_at";

/// SQLite-backed [`AttendanceStore`].
///
/// The connection sits behind a mutex so the store can be shared with the
/// engine thread.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn cohort_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Cohort> {
    Ok(Cohort {
        course: row.get(first)?,
        year: row.get(first + 1)?,
        semester: row.get(first + 2)?,
        group: row.get(first + 3)?,
    })
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let blob: Vec<u8> = row.get(3)?;
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        external_id: row.get(2)?,
        embedding: Embedding::from_bytes(&blob),
        thumbnail_path: row.get(4)?,
        cohort: cohort_from_row(row, 5)?,
        created_at: row.get(9)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ClassSession> {
    Ok(ClassSession {
        id: row.get(0)?,
        owner: row.get(1)?,
        cohort: cohort_from_row(row, 2)?,
        is_active: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEntry> {
    Ok(AttendanceEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        external_id: row.get(2)?,
        record: AttendanceRecord {
            identity_id: row.get(3)?,
            session_id: row.get(4)?,
            date: row.get(5)?,
            time: row.get(6)?,
            status: status_from_row(row, 7)?,
        },
    })
}

fn status_from_row(row: &Row<'_>, idx: usize) -> rusqlite::Result<AttendanceStatus> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "status".into(), Type::Text))
}

fn require_text(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidValue(format!("{field} must not be empty")));
    }
    Ok(())
}

impl AttendanceStore for SqliteStore {
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id"
        ))?;
        let identities = stmt
            .query_map([], identity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(identities)
    }

    fn add_identity(&self, identity: &NewIdentity) -> Result<Identity, StoreError> {
        require_text("name", &identity.name)?;
        require_text("external id", &identity.external_id)?;

        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities
             (name, external_id, embedding, thumbnail_path,
              course, year, semester, cohort_group, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                identity.name,
                identity.external_id,
                identity.embedding.to_bytes(),
                identity.thumbnail_path,
                identity.cohort.course,
                identity.cohort.year,
                identity.cohort.semester,
                identity.cohort.group,
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(id, name = %identity.name, "identity stored");

        Ok(Identity {
            id,
            name: identity.name.clone(),
            external_id: identity.external_id.clone(),
            embedding: identity.embedding.clone(),
            thumbnail_path: identity.thumbnail_path.clone(),
            cohort: identity.cohort.clone(),
            created_at,
        })
    }

    fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        require_text("name", &identity.name)?;
        require_text("external id", &identity.external_id)?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE identities
             SET name = ?1, external_id = ?2, thumbnail_path = ?3,
                 course = ?4, year = ?5, semester = ?6, cohort_group = ?7
             WHERE id = ?8",
            params![
                identity.name,
                identity.external_id,
                identity.thumbnail_path,
                identity.cohort.course,
                identity.cohort.year,
                identity.cohort.semester,
                identity.cohort.group,
                identity.id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(identity.id));
        }
        Ok(())
    }

    fn delete_identity(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let records =
            tx.execute("DELETE FROM attendance WHERE identity_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        tx.commit()?;
        if removed > 0 {
            tracing::debug!(id, records, "identity deleted");
        }
        Ok(removed > 0)
    }

    fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let identity = conn
            .query_row(
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities
                     WHERE external_id = ?1 ORDER BY id LIMIT 1"
                ),
                params![external_id],
                identity_from_row,
            )
            .optional()?;
        Ok(identity)
    }

    fn has_attendance_on(&self, identity_id: i64, date: NaiveDate) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE identity_id = ?1 AND date = ?2",
            params![identity_id, date],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn mark_attendance(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO attendance (identity_id, session_id, date, time, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.identity_id,
                record.session_id,
                record.date,
                record.time,
                record.status.as_str(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn attendance_records(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{ENTRY_QUERY}
             WHERE ?1 IS NULL OR a.date = ?1
             ORDER BY a.date DESC, a.time DESC, a.id DESC"
        ))?;
        let entries = stmt
            .query_map(params![date], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn attendance_for_identity(
        &self,
        identity_id: i64,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{ENTRY_QUERY}
             WHERE a.identity_id = ?1
             ORDER BY a.date DESC, a.time DESC, a.id DESC"
        ))?;
        let entries = stmt
            .query_map(params![identity_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn list_active_sessions(&self) -> Result<Vec<ClassSession>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_active = 1 ORDER BY id"
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn start_session(&self, owner: &str, cohort: &Cohort) -> Result<ClassSession, StoreError> {
        require_text("owner", owner)?;

        let started_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions
             (owner, course, year, semester, cohort_group, is_active, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                owner,
                cohort.course,
                cohort.year,
                cohort.semester,
                cohort.group,
                started_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(id, owner, "class session started");

        Ok(ClassSession {
            id,
            owner: owner.to_string(),
            cohort: cohort.clone(),
            is_active: true,
            started_at,
            ended_at: None,
        })
    }

    fn end_session(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET is_active = 0, ended_at = ?1 WHERE id = ?2 AND is_active = 1",
            params![Utc::now(), id],
        )?;
        if changed > 0 {
            tracing::info!(id, "class session ended");
        }
        Ok(changed > 0)
    }

    fn sessions_for_owner(&self, owner: &str) -> Result<Vec<ClassSession>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE owner = ?1 ORDER BY started_at DESC, id DESC"
        ))?;
        let sessions = stmt
            .query_map(params![owner], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}
