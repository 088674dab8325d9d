use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::LockPolicy;

const APP_NAME: &str = "apptrack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Csv,
    Sqlite,
}

impl StoreBackend {
    fn default_file_name(self) -> &'static str {
        match self {
            StoreBackend::Csv => "applications.csv",
            StoreBackend::Sqlite => "applications.db",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store_path: Option<PathBuf>,
    pub backend: StoreBackend,
    pub model: String,
    pub api_key: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub lock_wait_secs: u64,
    pub retry_wait_secs: u64,
    pub poll_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub backup_corrupt: bool,
    pub page_text_only: bool,
}

impl Settings {
    /// Defaults, then the config file (if any), then `APPTRACK_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("backend", "csv")?
            .set_default("model", crate::ai::DEFAULT_MODEL)?
            .set_default("lock_wait_secs", 30)?
            .set_default("retry_wait_secs", 10)?
            .set_default("poll_interval_secs", 2)?
            .set_default("fetch_timeout_secs", crate::fetch::DEFAULT_TIMEOUT.as_secs())?
            .set_default("backup_corrupt", false)?
            .set_default("page_text_only", false)?;

        match config_file {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(path) = default_config_file() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        builder
            .add_source(config::Environment::with_prefix("APPTRACK"))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(path) => path.clone(),
            None => default_data_dir()
                .map(|dir| dir.join(self.backend.default_file_name()))
                .unwrap_or_else(|| PathBuf::from(self.backend.default_file_name())),
        }
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            load_wait: Duration::from_secs(self.lock_wait_secs),
            retry_wait: Duration::from_secs(self.retry_wait_secs),
        }
    }

    /// The configured prompt file, or `prompt.txt` in the config directory if it exists.
    pub fn prompt_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.prompt_file {
            return Some(path.clone());
        }
        let dirs = directories::ProjectDirs::from("", "", APP_NAME)?;
        let candidate = dirs.config_dir().join("prompt.txt");
        candidate.exists().then_some(candidate)
    }
}

fn default_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().to_path_buf())
}

// --- API credential ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Explicit,
    Configured,
    Environment(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub value: String,
    pub source: KeySource,
}

// Keep the secret out of logs.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Resolves the credential once: explicit override, then the configured default,
/// then each environment variable in order. Blank values are skipped.
pub fn resolve_api_key<F>(
    explicit: Option<&str>,
    configured: Option<&str>,
    env_vars: &[&str],
    lookup: F,
) -> Option<ApiKey>
where
    F: Fn(&str) -> Option<String>,
{
    let present = |value: &str| !value.trim().is_empty();

    if let Some(value) = explicit.filter(|v| present(v)) {
        return Some(ApiKey { value: value.trim().to_string(), source: KeySource::Explicit });
    }
    if let Some(value) = configured.filter(|v| present(v)) {
        return Some(ApiKey { value: value.trim().to_string(), source: KeySource::Configured });
    }
    env_vars.iter().find_map(|name| {
        lookup(name)
            .filter(|v| present(v))
            .map(|value| ApiKey {
                value: value.trim().to_string(),
                source: KeySource::Environment(name.to_string()),
            })
    })
}
