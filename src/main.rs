mod ai;
mod config;
mod error;
mod fetch;
mod models;
mod pipeline;
mod store;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::{Settings, StoreBackend};
use fetch::HttpFetcher;
use models::{Record, KNOWN_STATUSES, STATUS_ACCEPTED, STATUS_APPLIED, STATUS_INTERVIEWED, STATUS_REJECTED};
use pipeline::{ExtractionPipeline, ProcessOutcome};
use std::path::PathBuf;
use std::time::Duration;
use store::{CsvStore, OpenForWrite, RecordStore, SqliteStore};
use tracing_subscriber::EnvFilter;

const COUNTED_STATUSES: [&str; 4] = [STATUS_APPLIED, STATUS_REJECTED, STATUS_INTERVIEWED, STATUS_ACCEPTED];

#[derive(Parser)]
#[command(name = "apptrack")]
#[command(about = "Track job applications - paste a posting URL, keep the spreadsheet up to date")]
struct Cli {
    /// Config file (default: config.toml in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path of the application table
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Storage backend
    #[arg(long, global = true, value_enum)]
    backend: Option<StoreBackend>,

    /// Model used for extraction (gemini-2.5-flash, gemini-2.5-pro, claude-sonnet, claude-haiku, gpt-4o, gpt-4o-mini)
    #[arg(long, global = true)]
    model: Option<String>,

    /// API key for the model provider
    #[arg(long, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a job posting from its URL and add it to the table
    Add {
        /// URL of the job posting
        url: String,

        /// Instructions sent instead of the prompt template
        #[arg(short, long)]
        prompt: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List applications
    List {
        /// Filter by status (Applied, Interviewed, Accepted, Rejected, Waiting)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by company (case-insensitive substring)
        #[arg(short, long)]
        company: Option<String>,
    },

    /// Show one application
    Show {
        /// Row number (1-based)
        row: usize,
    },

    /// Change the status of an application
    Status {
        /// Row number (1-based)
        row: usize,

        /// New status
        status: String,
    },

    /// Delete an application
    Delete {
        /// Row number (1-based)
        row: usize,

        /// Delete without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Count applications by status
    Stats,

    /// Check whether another program holds the table open
    Check {
        /// Seconds to wait for the file to be released
        #[arg(short, long)]
        wait: Option<u64>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("apptrack=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_store(settings: &Settings) -> Box<dyn RecordStore> {
    let path = settings.store_path();
    match settings.backend {
        StoreBackend::Csv => Box::new(
            CsvStore::new(path)
                .with_policy(settings.lock_policy())
                .with_backup_corrupt(settings.backup_corrupt),
        ),
        StoreBackend::Sqlite => Box::new(SqliteStore::new(path).with_policy(settings.lock_policy())),
    }
}

fn load_template(settings: &Settings) -> Result<Option<String>> {
    let Some(path) = settings.prompt_file() else {
        return Ok(None);
    };
    let template = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read prompt file {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded prompt template");
    Ok(Some(template))
}

fn add_job(settings: &Settings, cli_key: Option<&str>, url: &str, prompt: Option<&str>, json: bool) -> Result<bool> {
    let spec = ai::resolve_model(&settings.model).map_err(|e| anyhow!(e))?;
    let key = config::resolve_api_key(
        cli_key,
        settings.api_key.as_deref(),
        spec.provider.env_vars(),
        |name| std::env::var(name).ok(),
    )
    .ok_or_else(|| spec.provider.missing_credential())?;
    let llm = ai::create_client(&spec, key)?;

    let fetcher = HttpFetcher::new(Duration::from_secs(settings.fetch_timeout_secs))?;
    let store = open_store(settings);

    let mut pipeline = ExtractionPipeline::new(&fetcher, llm.as_ref(), store.as_ref())
        .with_page_text_only(settings.page_text_only);
    if let Some(template) = load_template(settings)? {
        pipeline = pipeline.with_template(template);
    }

    if !json {
        println!("Processing {} with {}...", url, spec.short_name);
    }
    let outcome = pipeline.process(url, prompt);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.report())?);
        return Ok(outcome.success());
    }

    println!("{}", outcome.message());
    match &outcome {
        ProcessOutcome::Added { record, .. } | ProcessOutcome::Duplicate { record } => {
            println!("  {} - {}", record.company, record.title);
            if !record.location.is_empty() {
                println!("  {}", record.location);
            }
        }
        ProcessOutcome::Failed { error } => println!("Error: {}", error),
    }
    Ok(outcome.success())
}

fn matches_filters(record: &Record, status: Option<&str>, company: Option<&str>) -> bool {
    let status_ok = status.is_none_or(|s| record.status.eq_ignore_ascii_case(s));
    let company_ok = company.is_none_or(|c| record.company.to_lowercase().contains(&c.to_lowercase()));
    status_ok && company_ok
}

fn print_wrapped(label: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let prefix = format!("{}: ", label);
    let indent = " ".repeat(prefix.len());
    let options = textwrap::Options::new(80)
        .initial_indent(&prefix)
        .subsequent_indent(&indent);
    println!("{}", textwrap::fill(value, options));
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(path) = cli.store {
        settings.store_path = Some(path);
    }
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }
    if let Some(model) = cli.model {
        settings.model = model;
    }

    match cli.command {
        Commands::Add { url, prompt, json } => {
            if !add_job(&settings, cli.api_key.as_deref(), &url, prompt.as_deref(), json)? {
                std::process::exit(1);
            }
        }

        Commands::List { status, company } => {
            let store = open_store(&settings);
            let table = store.load_or_create()?;
            let rows: Vec<_> = table
                .rows()
                .filter(|(_, r)| matches_filters(r, status.as_deref(), company.as_deref()))
                .collect();

            if rows.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<5} {:<12} {:<22} {:<30} {:<18} {:<10}",
                    "ROW", "STATUS", "COMPANY", "TITLE", "LOCATION", "APPLIED"
                );
                println!("{}", "-".repeat(102));
                for (row, r) in rows {
                    println!(
                        "{:<5} {:<12} {:<22} {:<30} {:<18} {:<10}",
                        row,
                        truncate(&r.status, 12),
                        truncate(&r.company, 20),
                        truncate(&r.title, 28),
                        truncate(&r.location, 16),
                        r.date_applied
                    );
                }
            }
        }

        Commands::Show { row } => {
            let store = open_store(&settings);
            let table = store.load_or_create()?;
            match table.row(row) {
                Some(r) => {
                    println!("Row #{}", row);
                    println!("Company: {}", r.company);
                    println!("Title: {}", r.title);
                    println!("Status: {}", r.status);
                    if !r.location.is_empty() {
                        println!("Location: {}", r.location);
                    }
                    if !r.date_applied.is_empty() {
                        println!("Applied: {}", r.date_applied);
                    }
                    if !r.url.is_empty() {
                        println!("URL: {}", r.url);
                    }
                    print_wrapped("Job Functions", &r.job_functions);
                }
                None => {
                    println!("Row #{} not found ({} rows).", row, table.len());
                }
            }
        }

        Commands::Status { row, status } => {
            if !KNOWN_STATUSES.iter().any(|s| s.eq_ignore_ascii_case(&status)) {
                tracing::warn!(status = %status, "Status is not one of {}", KNOWN_STATUSES.join(", "));
            }
            let store = open_store(&settings);
            let change = store.update_status(row, &status)?;
            println!("{} (was '{}')", change, change.previous);
        }

        Commands::Delete { row, yes } => {
            let store = open_store(&settings);
            if !yes {
                let table = store.load_or_create()?;
                let r = table.row(row).ok_or(error::StoreError::RowOutOfRange { row, count: table.len() })?;
                println!("Row #{}: {} - {} ({})", row, r.company, r.title, r.status);
                println!("Run again with --yes to delete it.");
                return Ok(());
            }
            let removed = store.delete_row(row)?;
            println!("{}", removed);
        }

        Commands::Stats => {
            let store = open_store(&settings);
            let table = store.load_or_create()?;
            println!("Total applications: {}", table.len());
            for status in COUNTED_STATUSES {
                println!("  {:<12} {}", status, table.count_status(status));
            }
            let other = table
                .records()
                .iter()
                .filter(|r| !COUNTED_STATUSES.contains(&r.status.as_str()))
                .count();
            if other > 0 {
                println!("  {:<12} {}", "Other", other);
            }
        }

        Commands::Check { wait } => {
            let path = settings.store_path();
            let policy = settings.lock_policy();
            let free = store::wait_until_unlocked(
                &OpenForWrite,
                &path,
                policy.poll_interval,
                Duration::from_secs(wait.unwrap_or(0)),
            );
            if free {
                println!("{} is not open in another program.", path.display());
            } else {
                println!("{}", error::StoreError::Locked { path });
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
