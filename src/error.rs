use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{}' is open in another program. Close the file and try again.", .path.display())]
    Locked { path: PathBuf },

    #[error("{}", range_message(.row, .count))]
    RowOutOfRange { row: usize, count: usize },

    #[error("Failed to access '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

fn range_message(row: &usize, count: &usize) -> String {
    if *count == 0 {
        format!("Row number {} is out of range: the table has no rows", row)
    } else {
        format!(
            "Row number {} is out of range. Valid range: 1-{}",
            row, count
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("No API key for {provider}. Pass --api-key, set api_key in the config file, or export {env_hint}")]
    MissingCredential {
        provider: &'static str,
        env_hint: String,
    },

    #[error("Failed to reach {provider}: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} request failed with status {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("No content in {provider} response")]
    EmptyResponse { provider: &'static str },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
