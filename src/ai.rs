use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ApiKey;
use crate::error::ModelError;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const MAX_TOKENS: u32 = 4096;

// --- Client trait ---

pub trait LlmClient {
    fn generate(&self, prompt: &str) -> Result<String, ModelError>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
}

impl ProviderKind {
    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::Gemini => "Gemini",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAI => "OpenAI",
        }
    }

    /// Environment variables consulted for the API key, in priority order.
    pub fn env_vars(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderKind::Anthropic => &["ANTHROPIC_API_KEY"],
            ProviderKind::OpenAI => &["OPENAI_API_KEY"],
        }
    }

    pub fn missing_credential(self) -> ModelError {
        ModelError::MissingCredential {
            provider: self.label(),
            env_hint: self.env_vars().join(" or "),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

fn spec(provider: ProviderKind, model_id: &str, short_name: &str) -> ModelSpec {
    ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    }
}

pub fn resolve_model(name: &str) -> Result<ModelSpec, String> {
    match name {
        // Google Gemini (GEMINI_API_KEY or GOOGLE_API_KEY)
        "gemini-2.5-flash" | "flash" => Ok(spec(ProviderKind::Gemini, "gemini-2.5-flash", "gemini-2.5-flash")),
        "gemini-2.5-pro" | "gemini-pro" => Ok(spec(ProviderKind::Gemini, "gemini-2.5-pro", "gemini-2.5-pro")),
        // Anthropic (ANTHROPIC_API_KEY)
        "claude-sonnet" | "sonnet" => Ok(spec(ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "claude-sonnet")),
        "claude-haiku" | "haiku" => Ok(spec(ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "claude-haiku")),
        // OpenAI (OPENAI_API_KEY)
        "gpt-4o" => Ok(spec(ProviderKind::OpenAI, "gpt-4o", "gpt-4o")),
        "gpt-4o-mini" => Ok(spec(ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini")),
        _ => Err(format!(
            "Unknown model '{}'. Available: gemini-2.5-flash (default), gemini-2.5-pro, \
             claude-sonnet, claude-haiku, gpt-4o, gpt-4o-mini",
            name
        )),
    }
}

pub fn create_client(spec: &ModelSpec, key: ApiKey) -> Result<Box<dyn LlmClient>, ModelError> {
    let client = reqwest::blocking::Client::builder()
        .build()
        .map_err(|e| ModelError::Transport {
            provider: spec.provider.label(),
            message: e.to_string(),
        })?;
    info!(model = %spec.model_id, key_source = ?key.source, "Using model");

    Ok(match spec.provider {
        ProviderKind::Gemini => Box::new(GeminiClient {
            api_key: key.value,
            model_id: spec.model_id.clone(),
            client,
        }),
        ProviderKind::Anthropic => Box::new(AnthropicClient {
            api_key: key.value,
            model_id: spec.model_id.clone(),
            client,
        }),
        ProviderKind::OpenAI => Box::new(OpenAIClient {
            api_key: key.value,
            model_id: spec.model_id.clone(),
            client,
        }),
    })
}

fn send(
    provider: &'static str,
    request: reqwest::blocking::RequestBuilder,
) -> Result<reqwest::blocking::Response, ModelError> {
    let response = request.send().map_err(|e| ModelError::Transport {
        provider,
        message: e.to_string(),
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(ModelError::Api { provider, status, body });
    }
    Ok(response)
}

fn decode<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    response: reqwest::blocking::Response,
) -> Result<T, ModelError> {
    response.json().map_err(|e| ModelError::Transport {
        provider,
        message: format!("failed to parse response: {}", e),
    })
}

// --- Gemini ---

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    google_search: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    tools: Vec<GeminiTool>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

impl GeminiResponse {
    /// Text parts of the first candidate, concatenated.
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

pub struct GeminiClient {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl LlmClient for GeminiClient {
    fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        const PROVIDER: &str = "Gemini";

        // Search grounding lets the model look the posting up when the fetched
        // page is mostly script.
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: Some(prompt.to_string()) }],
            }],
            tools: vec![GeminiTool { google_search: serde_json::json!({}) }],
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_URL, self.model_id);
        let response = send(
            PROVIDER,
            self.client
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request),
        )?;
        let body: GeminiResponse = decode(PROVIDER, response)?;

        body.text().ok_or(ModelError::EmptyResponse { provider: PROVIDER })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

pub struct AnthropicClient {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl LlmClient for AnthropicClient {
    fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        const PROVIDER: &str = "Anthropic";

        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = send(
            PROVIDER,
            self.client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&request),
        )?;
        let body: AnthropicResponse = decode(PROVIDER, response)?;

        body.content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or(ModelError::EmptyResponse { provider: PROVIDER })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

pub struct OpenAIClient {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl LlmClient for OpenAIClient {
    fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        const PROVIDER: &str = "OpenAI";

        let request = OpenAIRequest {
            model: self.model_id.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = send(
            PROVIDER,
            self.client
                .post(OPENAI_API_URL)
                .bearer_auth(&self.api_key)
                .json(&request),
        )?;
        let body: OpenAIResponse = decode(PROVIDER, response)?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ModelError::EmptyResponse { provider: PROVIDER })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}
