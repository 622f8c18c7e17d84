//! Plain-language explanations from the Gemini `generateContent` endpoint.
//!
//! A request is sent once. Any failure is folded into an `Explanation` that
//! carries a fixed fallback text, so callers never have to handle an error to
//! render something.

use crate::classifier::TumorCategory;
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-preview-05-20:generateContent";

/// Upper bound on one round trip to the remote service.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variables searched, in order, for the API key.
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

pub const DISCLAIMER: &str = "Disclaimer: This is for informational purposes only and not a substitute for professional medical advice.";

pub const SYSTEM_PROMPT: &str = "You are a friendly and helpful AI medical assistant. You provide simple, clear, and non-technical explanations about medical conditions. Always start your response with a clear disclaimer: 'Disclaimer: This is for informational purposes only and not a substitute for professional medical advice.'";

/// Returned when the service cannot be reached or answers with an error.
pub const FALLBACK_TEXT: &str =
    "I am unable to provide a detailed explanation at this time. Please try again later.";

/// Returned when the service answers but the answer holds no text.
pub const NO_EXPLANATION_TEXT: &str = "No explanation found for this moment.";

/// Builds the question asked right after a scan has been classified.
pub fn initial_query(category: TumorCategory) -> String {
    format!(
        "Provide a simple explanation of a {category} tumor. What are some common medications and suggestions for a person with this condition? What kind of consultant should they seek?"
    )
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ExplanationError {
    #[error("the explanation service API key is not configured")]
    MissingApiKey,
    #[error("could not reach the explanation service: {0}")]
    Network(String),
    #[error("the explanation service answered with HTTP {0}")]
    Http(u16),
    #[error("the explanation service returned an unreadable body: {0}")]
    InvalidJson(String),
    #[error("the explanation service response holds no explanation")]
    MalformedResponse,
}

impl ExplanationError {
    /// The text shown in place of an answer.
    pub fn fallback_text(&self) -> &'static str {
        match self {
            ExplanationError::MalformedResponse => NO_EXPLANATION_TEXT,
            _ => FALLBACK_TEXT,
        }
    }
}

/// Outcome of one explanation request.
#[derive(Clone, Debug, PartialEq)]
pub enum Explanation {
    Answer(String),
    Unavailable(ExplanationError),
}

impl Explanation {
    pub fn text(&self) -> &str {
        match self {
            Explanation::Answer(text) => text,
            Explanation::Unavailable(e) => e.fallback_text(),
        }
    }

    pub fn error(&self) -> Option<&ExplanationError> {
        match self {
            Explanation::Answer(_) => None,
            Explanation::Unavailable(e) => Some(e),
        }
    }

    pub fn is_answer(&self) -> bool {
        matches!(self, Explanation::Answer(_))
    }
}

/// Lifecycle of an explanation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationState {
    Idle,
    Sent,
    Succeeded,
    Failed,
}

impl ExplanationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExplanationState::Idle => "idle",
            ExplanationState::Sent => "sent",
            ExplanationState::Succeeded => "succeeded",
            ExplanationState::Failed => "failed",
        }
    }

    pub fn settled(explanation: &Explanation) -> Self {
        if explanation.is_answer() {
            ExplanationState::Succeeded
        } else {
            ExplanationState::Failed
        }
    }
}

/// Anything that can turn a question into an `Explanation`.
pub trait Explainer: Send + Sync {
    fn explain(&self, prompt: &str) -> impl Future<Output = Explanation> + Send;
}

#[derive(Clone, Debug)]
pub struct ExplanationConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Lets the remote model use live web search as a tool.
    pub google_search: bool,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            google_search: true,
        }
    }
}

impl ExplanationConfig {
    /// Default configuration with the API key taken from the environment.
    pub fn from_env() -> Self {
        let api_key = API_KEY_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty());

        Self {
            api_key,
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Default, Serialize)]
struct GoogleSearch {}

#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    system_instruction: RequestContent<'a>,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(prompt: &'a str, google_search: bool) -> Self {
        let tools = if google_search {
            vec![Tool {
                google_search: GoogleSearch::default(),
            }]
        } else {
            Vec::new()
        };

        Self {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
            tools,
            system_instruction: RequestContent {
                parts: vec![RequestPart {
                    text: SYSTEM_PROMPT,
                }],
            },
        }
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Extracts the first candidate's first text part from a response body.
pub fn interpret_body(body: &str) -> Explanation {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return Explanation::Unavailable(ExplanationError::InvalidJson(e.to_string())),
    };

    let text = serde_json::from_value::<GenerateContentResponse>(value)
        .ok()
        .and_then(|response| response.candidates.into_iter().next())
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.text);

    match text {
        Some(text) => Explanation::Answer(text),
        None => Explanation::Unavailable(ExplanationError::MalformedResponse),
    }
}

/// HTTP client for the remote explanation service.
pub struct ExplanationClient {
    http: reqwest::Client,
    config: ExplanationConfig,
}

impl ExplanationClient {
    pub fn new(config: ExplanationConfig) -> Result<Self, ExplanationError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExplanationError::Network(e.to_string()))?;

        if config.api_key.is_none() {
            log::warn!("No API key configured, explanations will be unavailable");
        }

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ExplanationConfig {
        &self.config
    }

    async fn send(&self, prompt: &str) -> Result<String, ExplanationError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ExplanationError::MissingApiKey)?;

        let response = self
            .http
            .post(&self.config.endpoint)
            .query(&[("key", api_key)])
            .json(&GenerateContentRequest::new(
                prompt,
                self.config.google_search,
            ))
            .send()
            .await
            .map_err(|e| ExplanationError::Network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExplanationError::Http(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| ExplanationError::Network(e.without_url().to_string()))
    }
}

impl Explainer for ExplanationClient {
    async fn explain(&self, prompt: &str) -> Explanation {
        log::debug!("Sending explanation request");

        let explanation = match self.send(prompt).await {
            Ok(body) => interpret_body(&body),
            Err(e) => Explanation::Unavailable(e),
        };

        match explanation.error() {
            None => log::debug!("Explanation received"),
            Some(e) => log::error!("Explanation unavailable: {}", e),
        }

        explanation
    }
}
