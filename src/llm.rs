//! LLM extraction client
//!
//! Sends raw OCR text to a chat-completions endpoint and asks for an answer
//! constrained by [`receipt_json_schema`]. The reply is returned as raw JSON;
//! validation happens in [`crate::schema`].

use crate::schema::{receipt_json_schema, SCHEMA_NAME};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You extract structured data from French shopping receipts. \
The text comes from OCR and may contain noise. Return the merchant name, the transaction \
date as YYYY-MM-DD, the final total paid, and every purchased line with its quantity, \
its unit price (line total divided by quantity) and the best matching category. \
Ignore VAT lines, sub-totals and payment details.";

/// Errors from the extraction backend
#[derive(Error, Debug)]
pub enum LlmError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status returned by the API
    #[error("LLM API error ({status}): {body}")]
    Status { status: StatusCode, body: String },

    /// The model declined to answer
    #[error("Model refused to extract receipt: {0}")]
    Refusal(String),

    #[error("Model returned no content")]
    EmptyResponse,

    #[error("Model returned invalid JSON: {0}")]
    InvalidJson(String),
}

impl LlmError {
    /// Worth another try with the same input
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(_) => true,
            LlmError::Status { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
            }
            _ => false,
        }
    }

    /// Every following request would fail the same way (bad credentials)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LlmError::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// Turns receipt text into the JSON shape described by the receipt schema
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    async fn extract(&self, receipt_text: &str) -> Result<Value, LlmError>;

    /// Model identifier, recorded in the audit trail
    fn model(&self) -> &str;
}

/// OpenAI-compatible chat-completions extractor using structured outputs
pub struct OpenAiExtractor {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiExtractor {
    pub fn new(api_key: String, base_url: Option<String>, model: String, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn build_request(&self, receipt_text: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": receipt_text },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": SCHEMA_NAME,
                    "strict": true,
                    "schema": receipt_json_schema(),
                }
            }
        })
    }
}

#[async_trait]
impl ReceiptExtractor for OpenAiExtractor {
    async fn extract(&self, receipt_text: &str) -> Result<Value, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(receipt_text))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Status { status, body });
        }

        let body = response.text().await?;
        let completion: ChatCompletion = serde_json::from_str(&body)
            .map_err(|e| LlmError::InvalidJson(format!("completion envelope: {}", e)))?;
        if let Some(usage) = &completion.usage {
            debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "LLM extraction completed"
            );
        }

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(LlmError::EmptyResponse)?;

        if let Some(refusal) = message.refusal.filter(|r| !r.is_empty()) {
            return Err(LlmError::Refusal(refusal));
        }

        let content = message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        serde_json::from_str(&content).map_err(|e| LlmError::InvalidJson(e.to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
