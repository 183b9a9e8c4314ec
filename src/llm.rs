//! OpenAI-compatible chat completion client and reply extraction.

use crate::error::{AppError, Result};
use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that provides answers based on data tables and generates SQL queries.";

/// The structured part of the model's reply. `answer` is accepted as an alias
/// for `summary` since models occasionally follow the older key name.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelReply {
    #[serde(alias = "answer")]
    pub summary: String,
    pub sql_query: String,
}

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
        }
    }

    /// Build a client from `OPENAI_API_KEY` (required), `OPENAI_MODEL` and
    /// `OPENAI_BASE_URL` (optional).
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AppError::Llm("OPENAI_API_KEY is not set".to_string()))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(api_key, model, base_url))
    }

    /// Single-turn chat completion. One attempt, no retries.
    pub async fn ask(&self, prompt: &str) -> Result<String> {
        let client = reqwest::Client::new();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
        });

        // Newer model families use max_completion_tokens, older ones max_tokens.
        if self.model.starts_with("gpt-4") || self.model.starts_with("gpt-5") {
            body["max_completion_tokens"] = serde_json::json!(1000);
        } else {
            body["max_tokens"] = serde_json::json!(1000);
        }

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AppError::Llm(format!("LLM API error: {}", error)));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Llm("No choices in LLM response".to_string()))?;

        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                warn!("LLM response was truncated due to length limit");
            } else if finish_reason == "content_filter" {
                return Err(AppError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let content = choices[0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AppError::Llm("No content in LLM response".to_string()))?;

        if content.is_empty() {
            return Err(AppError::Llm("Empty content in LLM response".to_string()));
        }

        debug!(chars = content.len(), "LLM completion received");
        Ok(content.to_string())
    }
}

/// Recover the structured reply from free-form completion text.
///
/// Scans for balanced `{...}` candidates with a brace-depth walk that is aware
/// of string literals and escapes, so nested braces inside string values do
/// not cut the object short. The first candidate that deserializes wins.
pub fn extract_model_reply(text: &str) -> Result<ModelReply> {
    let mut search_from = 0;
    while let Some(candidate) = next_json_object(text, search_from) {
        match serde_json::from_str::<ModelReply>(candidate.text) {
            Ok(reply) => return Ok(reply),
            Err(_) => search_from = candidate.start + 1,
        }
    }
    Err(AppError::Llm(format!(
        "No JSON object with summary and sql_query in model reply: {}",
        text
    )))
}

struct JsonCandidate<'a> {
    text: &'a str,
    start: usize,
}

/// First balanced `{...}` substring starting at or after `from`.
fn next_json_object(text: &str, from: usize) -> Option<JsonCandidate<'_>> {
    let offset = text.get(from..)?.find('{')? + from;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(offset) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(JsonCandidate {
                        text: &text[offset..=i],
                        start: offset,
                    });
                }
            }
            _ => {}
        }
    }
    None
}
