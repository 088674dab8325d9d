use serde::{Deserialize, Serialize};
use std::fmt;

pub const STATUS_APPLIED: &str = "Applied";
pub const STATUS_INTERVIEWED: &str = "Interviewed";
pub const STATUS_ACCEPTED: &str = "Accepted";
pub const STATUS_REJECTED: &str = "Rejected";
pub const STATUS_WAITING: &str = "Waiting";

pub const KNOWN_STATUSES: [&str; 5] = [
    STATUS_APPLIED,
    STATUS_INTERVIEWED,
    STATUS_ACCEPTED,
    STATUS_REJECTED,
    STATUS_WAITING,
];

/// Header row of the persisted table, in column order.
pub const COLUMNS: [&str; 7] = [
    "Status",
    "Company",
    "Job Title",
    "Location",
    "Job Functions",
    "Date Applied",
    "URL",
];

pub const URL_COLUMN: &str = "URL";

/// One job application. Field order matches `COLUMNS`; cells missing from a
/// hand-edited file read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    #[serde(rename = "Status")]
    pub status: String, // "Applied", "Interviewed", "Accepted", "Rejected", "Waiting", or anything else
    #[serde(rename = "Company")]
    pub company: String,
    #[serde(rename = "Job Title")]
    pub title: String,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Job Functions")]
    pub job_functions: String,
    #[serde(rename = "Date Applied")]
    pub date_applied: String, // YYYY-MM-DD
    #[serde(rename = "URL")]
    pub url: String,
}

impl Record {
    pub fn same_job(&self, other: &Record) -> bool {
        self.company == other.company && self.title == other.title
    }

    pub fn fields(&self) -> [&str; 7] {
        [
            &self.status,
            &self.company,
            &self.title,
            &self.location,
            &self.job_functions,
            &self.date_applied,
            &self.url,
        ]
    }
}

/// The full ordered set of records backing the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    records: Vec<Record>,
}

impl Table {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Rows paired with their 1-based row numbers.
    pub fn rows(&self) -> impl Iterator<Item = (usize, &Record)> {
        self.records.iter().enumerate().map(|(i, r)| (i + 1, r))
    }

    pub fn row(&self, row: usize) -> Option<&Record> {
        row.checked_sub(1).and_then(|i| self.records.get(i))
    }

    pub fn find_duplicate(&self, record: &Record) -> Option<&Record> {
        self.records.iter().find(|existing| existing.same_job(record))
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub(crate) fn row_mut(&mut self, row: usize) -> Option<&mut Record> {
        row.checked_sub(1).and_then(|i| self.records.get_mut(i))
    }

    pub(crate) fn remove(&mut self, row: usize) -> Option<Record> {
        let index = row.checked_sub(1)?;
        if index < self.records.len() {
            Some(self.records.remove(index))
        } else {
            None
        }
    }

    pub fn count_status(&self, status: &str) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub added: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub row: usize,
    pub previous: String,
    pub status: String,
}

impl fmt::Display for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row {} status updated to '{}'", self.row, self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedRow {
    pub row: usize,
    pub company: String,
    pub title: String,
}

impl fmt::Display for RemovedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deleted row {}: {} - {}", self.row, self.company, self.title)
    }
}
