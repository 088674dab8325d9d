//! Persistence for the application table.
//!
//! Every operation reloads the full table from disk and every mutation rewrites
//! it wholesale, so edits made by hand in a spreadsheet between two commands are
//! always picked up. Nothing serializes two writers of this program against each
//! other; the lock probe only notices other programs holding the file open.

pub mod csv_store;
pub mod sqlite_store;

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::models::{AppendOutcome, Record, RemovedRow, StatusChange, Table};

pub use csv_store::CsvStore;
pub use sqlite_store::SqliteStore;

/// Attempts made at the write step before giving up.
pub const WRITE_ATTEMPTS: usize = 3;

/// A table store. Implementors provide loading (with migration) and a
/// whole-table rewrite; the row operations are built on those two.
pub trait RecordStore {
    /// Loads the table, creating an empty one if the backing file is absent.
    fn load_or_create(&self) -> StoreResult<Table>;

    /// Rewrites the whole table.
    fn save(&self, table: &Table) -> StoreResult<()>;

    fn path(&self) -> &Path;

    /// Appends `record` unless a row with the same company and title exists.
    fn append(&self, record: Record) -> StoreResult<AppendOutcome> {
        let mut table = self.load_or_create()?;

        if let Some(existing) = table.find_duplicate(&record) {
            warn!(
                company = %existing.company,
                title = %existing.title,
                "Similar job already exists, not adding"
            );
            return Ok(AppendOutcome { added: false });
        }

        table.push(record);
        self.save(&table)?;
        info!(rows = table.len(), "Added job to table");
        Ok(AppendOutcome { added: true })
    }

    fn update_status(&self, row: usize, status: &str) -> StoreResult<StatusChange> {
        let mut table = self.load_or_create()?;
        let count = table.len();
        let record = table
            .row_mut(row)
            .ok_or(StoreError::RowOutOfRange { row, count })?;
        let previous = std::mem::replace(&mut record.status, status.to_string());

        self.save(&table)?;
        info!(row, status, "Updated row status");
        Ok(StatusChange { row, previous, status: status.to_string() })
    }

    fn delete_row(&self, row: usize) -> StoreResult<RemovedRow> {
        let mut table = self.load_or_create()?;
        let count = table.len();
        let removed = table
            .remove(row)
            .ok_or(StoreError::RowOutOfRange { row, count })?;

        self.save(&table)?;
        info!(row, company = %removed.company, title = %removed.title, "Deleted row");
        Ok(RemovedRow { row, company: removed.company, title: removed.title })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub poll_interval: Duration,
    /// Budget for the initial wait when loading.
    pub load_wait: Duration,
    /// Budget for the wait between write attempts.
    pub retry_wait: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            load_wait: Duration::from_secs(30),
            retry_wait: Duration::from_secs(10),
        }
    }
}

/// Detects whether another process holds the file exclusively.
pub trait LockProbe {
    fn is_locked(&self, path: &Path) -> bool;
}

/// Probes by opening the file for append without writing anything.
/// A missing file is never locked.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenForWrite;

impl LockProbe for OpenForWrite {
    fn is_locked(&self, path: &Path) -> bool {
        match OpenOptions::new().append(true).open(path) {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(_) => true,
        }
    }
}

/// Polls `probe` every `poll_interval` until the file is writable or `max_wait`
/// has elapsed. Returns whether the file became writable.
pub fn wait_until_unlocked(
    probe: &dyn LockProbe,
    path: &Path,
    poll_interval: Duration,
    max_wait: Duration,
) -> bool {
    let mut waited = Duration::ZERO;
    while waited < max_wait {
        if !probe.is_locked(path) {
            return true;
        }
        info!(
            path = %path.display(),
            "File is locked, waiting... ({}s/{}s)",
            waited.as_secs(),
            max_wait.as_secs()
        );
        thread::sleep(poll_interval);
        waited += poll_interval.max(Duration::from_millis(1));
    }
    !probe.is_locked(path)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::LockProbe;
    use std::cell::Cell;
    use std::path::Path;

    /// Reports locked for the first `locked_calls` probes, then unlocked.
    pub struct ScriptedProbe {
        locked_calls: usize,
        calls: Cell<usize>,
    }

    impl ScriptedProbe {
        pub fn locked_for(locked_calls: usize) -> Self {
            Self { locked_calls, calls: Cell::new(0) }
        }

        pub fn always_locked() -> Self {
            Self::locked_for(usize::MAX)
        }

        pub fn calls(&self) -> usize {
            self.calls.get()
        }
    }

    impl LockProbe for ScriptedProbe {
        fn is_locked(&self, _path: &Path) -> bool {
            let n = self.calls.get();
            self.calls.set(n + 1);
            n < self.locked_calls
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    const TICK: Duration = Duration::from_millis(1);

    #[test]
    fn test_open_for_write_missing_file_is_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!OpenForWrite.is_locked(&dir.path().join("missing.csv")));
    }

    #[test]
    fn test_open_for_write_plain_file_is_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        std::fs::write(&path, "Status\n").unwrap();
        assert!(!OpenForWrite.is_locked(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Status\n");
    }

    #[test]
    fn test_wait_returns_once_unlocked() {
        let probe = ScriptedProbe::locked_for(3);
        assert!(wait_until_unlocked(&probe, Path::new("x"), TICK, Duration::from_millis(50)));
        assert_eq!(probe.calls(), 4);
    }

    #[test]
    fn test_wait_gives_up_after_budget() {
        let probe = ScriptedProbe::always_locked();
        assert!(!wait_until_unlocked(&probe, Path::new("x"), TICK, Duration::from_millis(5)));
        // five polls inside the budget plus the final check
        assert_eq!(probe.calls(), 6);
    }

    #[test]
    fn test_zero_budget_still_checks_once() {
        let probe = ScriptedProbe::locked_for(0);
        assert!(wait_until_unlocked(&probe, Path::new("x"), TICK, Duration::ZERO));
        assert_eq!(probe.calls(), 1);
    }
}
