use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

use super::{LockPolicy, RecordStore, WRITE_ATTEMPTS};
use crate::error::{StoreError, StoreResult};
use crate::models::{Record, Table};

/// The application table in an SQLite file. Same contract as the CSV store:
/// load everything, change it in memory, write everything back.
pub struct SqliteStore {
    path: PathBuf,
    policy: LockPolicy,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: LockPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn open(&self) -> StoreResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| StoreError::Io { path: parent.to_path_buf(), source })?;
            }
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(self.policy.load_wait)?;
        Ok(conn)
    }

    fn classify(&self, err: rusqlite::Error) -> StoreError {
        if is_busy(&err) {
            StoreError::Locked { path: self.path.clone() }
        } else {
            StoreError::Sqlite(err)
        }
    }

    fn init(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                position INTEGER PRIMARY KEY,
                status TEXT NOT NULL DEFAULT '',
                company TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                job_functions TEXT NOT NULL DEFAULT '',
                date_applied TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT ''
            );
            "#,
        )
    }

    fn has_url_column(conn: &Connection) -> rusqlite::Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('applications') WHERE name = 'url'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn read_all(conn: &Connection) -> rusqlite::Result<Table> {
        let mut stmt = conn.prepare(
            "SELECT status, company, title, location, job_functions, date_applied, url
             FROM applications ORDER BY position",
        )?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map(Table::new)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
        Ok(Record {
            status: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
            company: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            location: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            job_functions: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            date_applied: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            url: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        })
    }

    fn write_all(conn: &mut Connection, table: &Table) -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM applications", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO applications
                    (position, status, company, title, location, job_functions, date_applied, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (position, r) in table.rows() {
                insert.execute(params![
                    position as i64,
                    r.status,
                    r.company,
                    r.title,
                    r.location,
                    r.job_functions,
                    r.date_applied,
                    r.url
                ])?;
            }
        }
        tx.commit()
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn is_corrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt)
    )
}

impl RecordStore for SqliteStore {
    fn load_or_create(&self) -> StoreResult<Table> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No database yet, starting empty");
            return Ok(Table::default());
        }

        let conn = self.open()?;
        let has_url = match Self::init(&conn).and_then(|_| Self::has_url_column(&conn)) {
            Ok(has_url) => has_url,
            Err(e) if is_corrupt(&e) => {
                warn!(path = %self.path.display(), error = %e, "Error reading database, starting with an empty table");
                return Ok(Table::default());
            }
            Err(e) => return Err(self.classify(e)),
        };

        if !has_url {
            info!(path = %self.path.display(), "Adding url column to existing database");
            conn.execute(
                "ALTER TABLE applications ADD COLUMN url TEXT NOT NULL DEFAULT ''",
                [],
            )
            .map_err(|e| self.classify(e))?;
        }

        let table = Self::read_all(&conn).map_err(|e| self.classify(e))?;
        debug!(rows = table.len(), "Loaded table");
        Ok(table)
    }

    fn save(&self, table: &Table) -> StoreResult<()> {
        let mut last_error = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            let result = self.open().and_then(|mut conn| {
                Self::init(&conn)
                    .and_then(|_| Self::write_all(&mut conn, table))
                    .map_err(StoreError::from)
            });

            match result {
                Ok(()) => {
                    debug!(rows = table.len(), attempt, "Table written");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Write failed");
                    last_error = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        thread::sleep(self.policy.retry_wait);
                    }
                }
            }
        }

        Err(match last_error {
            Some(StoreError::Sqlite(e)) => self.classify(e),
            Some(e) => e,
            None => StoreError::Locked { path: self.path.clone() },
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
