//! URL in, stored record out.
//!
//! fetch → compose prompt → generate → parse (or fall back) → attach URL → append.
//! `process` never returns an error: every failure becomes a
//! [`ProcessOutcome::Failed`] the caller can render.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::ai::LlmClient;
use crate::error::PipelineError;
use crate::fetch::{self, PageFetcher};
use crate::models::{Record, STATUS_APPLIED};
use crate::store::RecordStore;

/// Page content beyond this many characters is not sent to the model.
pub const MAX_PAGE_CHARS: usize = 10_000;

pub const NOT_EXTRACTED: &str = "Could not extract";

pub const DEFAULT_PROMPT: &str = "\
Read the job listing at the link below and extract:
1. Company
2. Job Title
3. Location
4. Job Functions

Copy the wording from the listing; do not paraphrase. Be as accurate as possible.
Use today's date as the application date and keep the link exactly as given.
Set the status to \"Waiting\".";

/// Result of reading the model's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Parsed(Record),
    /// The reply was not a JSON object; the record holds placeholders.
    Unparsed(Record),
}

impl Extraction {
    #[cfg(test)]
    pub fn record(&self) -> &Record {
        match self {
            Extraction::Parsed(record) | Extraction::Unparsed(record) => record,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            Extraction::Parsed(record) | Extraction::Unparsed(record) => record,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed(_))
    }
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Added { record: Record, parsed: bool },
    Duplicate { record: Record },
    Failed { error: PipelineError },
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Added { .. })
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            ProcessOutcome::Added { record, .. } | ProcessOutcome::Duplicate { record } => Some(record),
            ProcessOutcome::Failed { .. } => None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ProcessOutcome::Added { parsed: true, .. } => {
                "Job information extracted and added to spreadsheet"
            }
            ProcessOutcome::Added { parsed: false, .. } => {
                "Added to spreadsheet, but the model's answer could not be read; fill in the details by hand"
            }
            ProcessOutcome::Duplicate { .. } => "This job already exists in the spreadsheet",
            ProcessOutcome::Failed { .. } => "Failed to process job URL",
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            ProcessOutcome::Failed { error } => Some(error.to_string()),
            _ => None,
        }
    }

    pub fn report(&self) -> ProcessReport<'_> {
        ProcessReport {
            success: self.success(),
            record: self.record(),
            message: self.message(),
            error: self.error(),
        }
    }
}

/// Flat view of an outcome for JSON output.
#[derive(Debug, Serialize)]
pub struct ProcessReport<'a> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<&'a Record>,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ExtractionPipeline<'a> {
    fetcher: &'a dyn PageFetcher,
    llm: &'a dyn LlmClient,
    store: &'a dyn RecordStore,
    template: String,
    page_text_only: bool,
    today: Option<NaiveDate>,
}

impl<'a> ExtractionPipeline<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, llm: &'a dyn LlmClient, store: &'a dyn RecordStore) -> Self {
        Self {
            fetcher,
            llm,
            store,
            template: DEFAULT_PROMPT.to_string(),
            page_text_only: false,
            today: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Reduce fetched HTML to its visible text before sending it to the model.
    pub fn with_page_text_only(mut self, enabled: bool) -> Self {
        self.page_text_only = enabled;
        self
    }

    /// Pin the date used for `date_applied` defaults.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn process(&self, url: &str, custom_prompt: Option<&str>) -> ProcessOutcome {
        match self.try_process(url, custom_prompt) {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(url, error = %error, "Error processing job URL");
                ProcessOutcome::Failed { error }
            }
        }
    }

    fn try_process(&self, url: &str, custom_prompt: Option<&str>) -> Result<ProcessOutcome, PipelineError> {
        let extraction = self.extract(url, custom_prompt)?;
        let parsed = extraction.is_parsed();

        let mut record = extraction.into_record();
        record.url = url.to_string();

        let outcome = self.store.append(record.clone())?;
        if outcome.added {
            Ok(ProcessOutcome::Added { record, parsed })
        } else {
            Ok(ProcessOutcome::Duplicate { record })
        }
    }

    /// Fetch, prompt and parse, without touching the store.
    pub fn extract(&self, url: &str, custom_prompt: Option<&str>) -> Result<Extraction, PipelineError> {
        let page = self.fetcher.fetch(url)?;
        let page = if self.page_text_only { fetch::visible_text(&page) } else { page };
        let content = fetch::truncate_chars(&page, MAX_PAGE_CHARS);

        let instructions = custom_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.template);
        let today = self.today();
        let prompt = compose_prompt(instructions, url, content, today);

        info!(model = self.llm.model_name(), "Sending request to model");
        let response = self.llm.generate(&prompt)?;

        let extraction = parse_response(&response, today);
        if extraction.is_parsed() {
            info!("Successfully extracted job information");
        } else {
            warn!(response = %response, "Model reply was not a JSON object, using placeholder record");
        }
        Ok(extraction)
    }
}

pub fn compose_prompt(instructions: &str, url: &str, content: &str, today: NaiveDate) -> String {
    format!(
        "{instructions}\n\n\
         URL: {url}\n\n\
         Webpage Content:\n{content}\n\n\
         Please extract the information in the following JSON format:\n\
         {{\n\
         \x20   \"status\": \"Applied\",\n\
         \x20   \"company_name\": \"Company\",\n\
         \x20   \"position_title\": \"Job Title\",\n\
         \x20   \"location\": \"Location\",\n\
         \x20   \"job_functions\": \"Job Functions\",\n\
         \x20   \"date_applied\": \"{date}\"\n\
         }}\n\n\
         Only return the JSON, no additional text.",
        date = today.format("%Y-%m-%d"),
    )
}

/// Removes a leading ```json and a trailing ``` fence.
pub fn strip_code_fence(response: &str) -> &str {
    let text = response.trim();
    let text = text.strip_prefix("```json").unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);
    text.trim()
}

pub fn parse_response(response: &str, today: NaiveDate) -> Extraction {
    match serde_json::from_str::<Value>(strip_code_fence(response)) {
        Ok(Value::Object(fields)) => Extraction::Parsed(record_from_json(&fields, today)),
        _ => Extraction::Unparsed(fallback_record(today)),
    }
}

pub fn fallback_record(today: NaiveDate) -> Record {
    Record {
        status: STATUS_APPLIED.to_string(),
        company: NOT_EXTRACTED.to_string(),
        title: NOT_EXTRACTED.to_string(),
        location: NOT_EXTRACTED.to_string(),
        job_functions: NOT_EXTRACTED.to_string(),
        date_applied: today.format("%Y-%m-%d").to_string(),
        url: String::new(),
    }
}

fn record_from_json(fields: &Map<String, Value>, today: NaiveDate) -> Record {
    let text = |key: &str| -> Option<String> {
        match fields.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    };

    Record {
        status: text("status").unwrap_or_else(|| STATUS_APPLIED.to_string()),
        company: text("company_name").unwrap_or_default(),
        title: text("position_title").unwrap_or_default(),
        location: text("location").unwrap_or_default(),
        job_functions: text("job_functions").unwrap_or_default(),
        date_applied: text("date_applied").unwrap_or_else(|| today.format("%Y-%m-%d").to_string()),
        url: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, ModelError, StoreError};
    use crate::store::CsvStore;
    use std::cell::RefCell;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    struct FakeFetcher {
        page: Result<String, u16>,
    }

    impl PageFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.page
                .clone()
                .map_err(|status| FetchError::Status { url: url.to_string(), status })
        }
    }

    /// Replies with a canned answer and remembers the prompts it was given.
    struct FakeModel {
        reply: Result<String, ()>,
        prompts: RefCell<Vec<String>>,
    }

    impl FakeModel {
        fn replying(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), prompts: RefCell::new(Vec::new()) }
        }

        fn failing() -> Self {
            Self { reply: Err(()), prompts: RefCell::new(Vec::new()) }
        }

        fn last_prompt(&self) -> String {
            self.prompts.borrow().last().cloned().unwrap_or_default()
        }
    }

    impl LlmClient for FakeModel {
        fn generate(&self, prompt: &str) -> Result<String, ModelError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.reply.clone().map_err(|_| ModelError::Api {
                provider: "Fake",
                status: 500,
                body: "boom".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    const ACME_JSON: &str = r#"{
        "status": "Applied",
        "company_name": "Acme",
        "position_title": "Engineer",
        "location": "Remote",
        "job_functions": "Backend",
        "date_applied": "2025-01-01"
    }"#;

    fn page(text: &str) -> FakeFetcher {
        FakeFetcher { page: Ok(text.to_string()) }
    }

    #[test]
    fn test_fence_stripping_matches_bare_json() {
        let fenced = format!("```json\n{}\n```", ACME_JSON);
        assert_eq!(parse_response(&fenced, day()), parse_response(ACME_JSON, day()));
        assert!(parse_response(&fenced, day()).is_parsed());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("  {}  "), "{}");
        assert_eq!(strip_code_fence("{}\n```"), "{}");
    }

    #[test]
    fn test_parsed_fields_are_mapped() {
        let record = parse_response(ACME_JSON, day()).into_record();
        assert_eq!(record.status, "Applied");
        assert_eq!(record.company, "Acme");
        assert_eq!(record.title, "Engineer");
        assert_eq!(record.location, "Remote");
        assert_eq!(record.job_functions, "Backend");
        assert_eq!(record.date_applied, "2025-01-01");
        assert_eq!(record.url, "");
    }

    #[test]
    fn test_missing_status_and_date_get_defaults() {
        let record = parse_response(
            r#"{"company_name": "Acme", "position_title": "Engineer", "date_applied": null}"#,
            day(),
        )
        .into_record();
        assert_eq!(record.status, "Applied");
        assert_eq!(record.date_applied, "2025-03-14");
        assert_eq!(record.location, "");
    }

    #[test]
    fn test_non_string_values_become_text() {
        let record = parse_response(
            r#"{"company_name": "Acme", "position_title": 42, "location": ["Remote", "NYC"]}"#,
            day(),
        )
        .into_record();
        assert_eq!(record.title, "42");
        assert_eq!(record.location, r#"["Remote","NYC"]"#);
    }

    #[test]
    fn test_prose_reply_gives_fallback_record() {
        let extraction = parse_response("Sorry, I couldn't open that page.", day());
        assert!(!extraction.is_parsed());

        let record = extraction.record();
        assert_eq!(record.status, "Applied");
        assert_eq!(record.company, NOT_EXTRACTED);
        assert_eq!(record.title, NOT_EXTRACTED);
        assert_eq!(record.location, NOT_EXTRACTED);
        assert_eq!(record.job_functions, NOT_EXTRACTED);
        assert_eq!(record.date_applied, "2025-03-14");
    }

    #[test]
    fn test_json_that_is_not_an_object_falls_back() {
        assert!(!parse_response("[1, 2, 3]", day()).is_parsed());
        assert!(!parse_response("\"Acme\"", day()).is_parsed());
        assert!(!parse_response("", day()).is_parsed());
    }

    #[test]
    fn test_fallback_uses_current_date_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("<html></html>");
        let model = FakeModel::replying("no json here");
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        let before = chrono::Local::now().date_naive();
        let extraction = pipeline.extract("https://acme.example/job", None).unwrap();
        let after = chrono::Local::now().date_naive();

        let date = extraction.record().date_applied.clone();
        assert!(date == before.format("%Y-%m-%d").to_string() || date == after.format("%Y-%m-%d").to_string());
    }

    #[test]
    fn test_prompt_contains_instructions_url_content_and_date() {
        let prompt = compose_prompt("Extract things.", "https://acme.example/job", "PAGE BODY", day());
        assert!(prompt.starts_with("Extract things.\n\nURL: https://acme.example/job\n\nWebpage Content:\nPAGE BODY\n"));
        assert!(prompt.contains("\"company_name\": \"Company\""));
        assert!(prompt.contains("\"date_applied\": \"2025-03-14\""));
        assert!(prompt.ends_with("Only return the JSON, no additional text."));
    }

    #[test]
    fn test_custom_prompt_replaces_template() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("body");
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store).with_template("TEMPLATE TEXT");

        pipeline.extract("https://acme.example/job", Some("CUSTOM TEXT")).unwrap();
        assert!(model.last_prompt().starts_with("CUSTOM TEXT"));
        assert!(!model.last_prompt().contains("TEMPLATE TEXT"));

        pipeline.extract("https://acme.example/job", None).unwrap();
        assert!(model.last_prompt().starts_with("TEMPLATE TEXT"));
    }

    #[test]
    fn test_page_content_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let long_page = format!("{}{}", "a".repeat(MAX_PAGE_CHARS), "TAIL-MARKER");
        let fetcher = page(&long_page);
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        pipeline.extract("https://acme.example/job", None).unwrap();
        let prompt = model.last_prompt();
        assert!(prompt.contains(&"a".repeat(MAX_PAGE_CHARS)));
        assert!(!prompt.contains("TAIL-MARKER"));
    }

    #[test]
    fn test_page_text_only_strips_markup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("<html><body><script>track()</script><p>Senior Engineer</p></body></html>");
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store).with_page_text_only(true);

        pipeline.extract("https://acme.example/job", None).unwrap();
        let prompt = model.last_prompt();
        assert!(prompt.contains("Webpage Content:\nSenior Engineer\n"));
        assert!(!prompt.contains("track()"));
    }

    #[test]
    fn test_process_adds_record_with_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("<html>Acme is hiring</html>");
        let model = FakeModel::replying(&format!("```json\n{}\n```", ACME_JSON));
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store).with_today(day());

        let outcome = pipeline.process("https://acme.example/job", None);
        assert!(outcome.success());
        assert!(outcome.error().is_none());
        assert_eq!(outcome.record().unwrap().url, "https://acme.example/job");

        let table = store.load_or_create().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.row(1).unwrap().company, "Acme");
        assert_eq!(table.row(1).unwrap().url, "https://acme.example/job");
    }

    #[test]
    fn test_unparsed_reply_is_still_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("page");
        let model = FakeModel::replying("I could not find a job posting.");
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store).with_today(day());

        let outcome = pipeline.process("https://acme.example/job", None);
        assert!(outcome.success());
        assert!(matches!(outcome, ProcessOutcome::Added { parsed: false, .. }));

        let table = store.load_or_create().unwrap();
        let row = table.row(1).unwrap();
        assert_eq!(row.company, NOT_EXTRACTED);
        assert_eq!(row.date_applied, "2025-03-14");
        assert_eq!(row.url, "https://acme.example/job");
    }

    #[test]
    fn test_duplicate_is_reported_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("page");
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        assert!(pipeline.process("https://acme.example/job", None).success());
        let second = pipeline.process("https://mirror.example/acme", None);

        assert!(!second.success());
        assert!(matches!(second, ProcessOutcome::Duplicate { .. }));
        assert!(second.error().is_none());
        assert!(second.message().contains("already exists"));
        assert_eq!(store.load_or_create().unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_failure_becomes_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = FakeFetcher { page: Err(404) };
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        let outcome = pipeline.process("https://acme.example/gone", None);
        assert!(!outcome.success());
        assert!(outcome.record().is_none());
        assert!(matches!(outcome, ProcessOutcome::Failed { error: PipelineError::Fetch(_) }));
        assert!(outcome.error().unwrap().contains("404"));
        assert!(model.prompts.borrow().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_model_failure_becomes_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = page("page");
        let model = FakeModel::failing();
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        let outcome = pipeline.process("https://acme.example/job", None);
        assert!(matches!(outcome, ProcessOutcome::Failed { error: PipelineError::Model(_) }));
        assert!(outcome.error().unwrap().contains("boom"));
    }

    #[test]
    fn test_store_failure_becomes_failed_outcome() {
        use crate::store::testing::ScriptedProbe;
        use crate::store::LockPolicy;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"))
            .with_policy(LockPolicy {
                poll_interval: Duration::from_millis(1),
                load_wait: Duration::from_millis(2),
                retry_wait: Duration::from_millis(2),
            })
            .with_probe(Box::new(ScriptedProbe::always_locked()));
        let fetcher = page("page");
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        let outcome = pipeline.process("https://acme.example/job", None);
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed { error: PipelineError::Store(StoreError::Locked { .. }) }
        ));
    }

    #[test]
    fn test_report_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("applications.csv"));
        let fetcher = FakeFetcher { page: Err(500) };
        let model = FakeModel::replying(ACME_JSON);
        let pipeline = ExtractionPipeline::new(&fetcher, &model, &store);

        let outcome = pipeline.process("https://acme.example/job", None);
        let json = serde_json::to_value(outcome.report()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Failed to process job URL");
        assert!(json.get("record").is_none());
        assert!(json["error"].as_str().unwrap().contains("500"));
    }
}
