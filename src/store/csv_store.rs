use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{LockPolicy, LockProbe, OpenForWrite, RecordStore, WRITE_ATTEMPTS};
use crate::error::{StoreError, StoreResult};
use crate::models::{COLUMNS, Record, Table, URL_COLUMN};

/// The application table as a CSV file that a spreadsheet program may have
/// open at any moment.
pub struct CsvStore {
    path: PathBuf,
    policy: LockPolicy,
    probe: Box<dyn LockProbe>,
    backup_corrupt: bool,
}

struct LoadedTable {
    table: Table,
    has_url: bool,
}

enum ReadFailure {
    Io(io::Error),
    Corrupt(String),
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: LockPolicy::default(),
            probe: Box::new(OpenForWrite),
            backup_corrupt: false,
        }
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[cfg(test)]
    pub fn with_probe(mut self, probe: Box<dyn LockProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Copy an unreadable file aside before it gets replaced by an empty table.
    pub fn with_backup_corrupt(mut self, enabled: bool) -> Self {
        self.backup_corrupt = enabled;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.probe.is_locked(&self.path)
    }

    pub fn wait_until_unlocked(&self, max_wait: Duration) -> bool {
        super::wait_until_unlocked(self.probe.as_ref(), &self.path, self.policy.poll_interval, max_wait)
    }

    fn write_table(&self, table: &Table) -> StoreResult<()> {
        // Replace the file a symlink points at, not the link.
        let target = fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|source| StoreError::Io { path: dir.to_path_buf(), source })?;

        // Write beside the target and rename over it so readers never see half a table.
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|source| StoreError::Io { path: dir.to_path_buf(), source })?;
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(tmp.as_file_mut());
            writer.write_record(COLUMNS)?;
            for record in table.records() {
                writer.write_record(record.fields())?;
            }
            writer
                .flush()
                .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;
        }
        tmp.as_file_mut()
            .flush()
            .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;
        if let Ok(metadata) = fs::metadata(&target) {
            tmp.as_file()
                .set_permissions(metadata.permissions())
                .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;
        }
        tmp.persist(&target)
            .map_err(|e| StoreError::Io { path: self.path.clone(), source: e.error })?;
        Ok(())
    }

    fn backup_corrupt_file(&self) -> io::Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "applications".to_string());
        let name = match self.path.extension() {
            Some(ext) => format!("{}.corrupt-{}.{}", stem, stamp, ext.to_string_lossy()),
            None => format!("{}.corrupt-{}", stem, stamp),
        };
        let target = self.path.with_file_name(name);
        fs::copy(&self.path, &target)?;
        Ok(target)
    }

    fn recover_from_corrupt(&self, reason: &str) -> Table {
        warn!(path = %self.path.display(), reason, "Error reading table, starting with an empty one");
        if self.backup_corrupt {
            match self.backup_corrupt_file() {
                Ok(target) => info!(backup = %target.display(), "Saved a copy of the unreadable table"),
                Err(e) => warn!(error = %e, "Could not back up the unreadable table"),
            }
        }
        Table::default()
    }
}

impl RecordStore for CsvStore {
    fn load_or_create(&self) -> StoreResult<Table> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No table yet, starting empty");
            return Ok(Table::default());
        }

        if self.is_locked() {
            warn!(path = %self.path.display(), "Table is open in another program, waiting for it to close");
            if !self.wait_until_unlocked(self.policy.load_wait) {
                return Err(StoreError::Locked { path: self.path.clone() });
            }
        }

        let loaded = match read_table(&self.path) {
            Ok(loaded) => loaded,
            Err(ReadFailure::Io(e)) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(StoreError::Locked { path: self.path.clone() });
            }
            Err(ReadFailure::Io(source)) => {
                return Err(StoreError::Io { path: self.path.clone(), source });
            }
            Err(ReadFailure::Corrupt(reason)) => return Ok(self.recover_from_corrupt(&reason)),
        };
        debug!(rows = loaded.table.len(), "Loaded table");

        if !loaded.has_url {
            info!(path = %self.path.display(), "Adding URL column to existing table");
            self.save(&loaded.table)?;
        }

        Ok(loaded.table)
    }

    /// Writes the table, re-probing for a lock before every attempt since the
    /// file may have been opened since it was read.
    fn save(&self, table: &Table) -> StoreResult<()> {
        let mut last_error = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            if !self.wait_until_unlocked(self.policy.retry_wait) {
                warn!(attempt, "Table still locked, cannot write");
                last_error = None;
                continue;
            }

            match self.write_table(table) {
                Ok(()) => {
                    debug!(rows = table.len(), attempt, "Table written");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Write failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(StoreError::Io { source, .. }) if source.kind() == ErrorKind::PermissionDenied => {
                StoreError::Locked { path: self.path.clone() }
            }
            Some(e) => e,
            None => StoreError::Locked { path: self.path.clone() },
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn read_table(path: &Path) -> Result<LoadedTable, ReadFailure> {
    let bytes = fs::read(path).map_err(ReadFailure::Io)?;
    let text = String::from_utf8(bytes)
        .map_err(|e| ReadFailure::Corrupt(format!("not UTF-8 text: {}", e)))?;
    parse_table(&text).map_err(ReadFailure::Corrupt)
}

fn parse_table(text: &str) -> Result<LoadedTable, String> {
    // Spreadsheet programs like to prefix a byte-order mark.
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    if headers.is_empty() {
        return Ok(LoadedTable { table: Table::default(), has_url: false });
    }

    let missing: Vec<&str> = COLUMNS
        .iter()
        .copied()
        .filter(|column| *column != URL_COLUMN && !headers.iter().any(|h| h == *column))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing columns: {}", missing.join(", ")));
    }

    let extra: Vec<&str> = headers.iter().filter(|h| !COLUMNS.contains(h)).collect();
    if !extra.is_empty() {
        warn!(columns = ?extra, "Ignoring unknown columns; they will be dropped on the next write");
    }

    let has_url = headers.iter().any(|h| h == URL_COLUMN);
    let index: Vec<Option<usize>> = COLUMNS
        .iter()
        .map(|column| headers.iter().position(|h| h == *column))
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| e.to_string())?;
        records.push(record_from_row(&row, &index));
    }

    Ok(LoadedTable { table: Table::new(records), has_url })
}

/// Builds a record from `row`, where `index[i]` is the position of `COLUMNS[i]`.
/// Cells past the end of a short row read as empty.
fn record_from_row(row: &csv::StringRecord, index: &[Option<usize>]) -> Record {
    let cell = |column: usize| -> String {
        index[column]
            .and_then(|i| row.get(i))
            .unwrap_or("")
            .to_string()
    };
    Record {
        status: cell(0),
        company: cell(1),
        title: cell(2),
        location: cell(3),
        job_functions: cell(4),
        date_applied: cell(5),
        url: cell(6),
    }
}
