use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use refinery_core::config::ModelConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::GenerationOracle;
use refinery_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Gemini's OpenAI endpoint, Ollama, vLLM, Groq, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RefineryError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn response_format(schema: &OutputSchema) -> serde_json::Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": schema.name,
            "strict": true,
            "schema": schema.to_json_schema(),
        }
    })
}

/// Turn raw completion text into a `Generation`, validating structured replies.
pub(crate) fn interpret(content: String, schema: Option<&OutputSchema>) -> Result<Generation> {
    let Some(schema) = schema else {
        return Ok(Generation::Text(content));
    };
    let value: serde_json::Value = serde_json::from_str(extract_json(&content))
        .map_err(|e| RefineryError::OracleParse(format!("{}: {}", e, truncate(&content, 200))))?;
    schema.validate(&value)?;
    Ok(Generation::Structured(value))
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl GenerationOracle for OpenAiClient {
    fn generate<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: Option<&'a OutputSchema>,
    ) -> BoxFuture<'a, Result<Generation>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: &self.config.model_id,
                messages: messages
                    .iter()
                    .map(|m| OaiMessage {
                        role: role_name(m.role),
                        content: &m.content,
                    })
                    .collect(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                response_format: schema.map(response_format),
            };

            let mut req = self.http.post(self.endpoint()).json(&body);
            if let Some(key) = self.config.resolved_api_key() {
                req = req.bearer_auth(key);
            }

            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    RefineryError::OracleRequest(format!("timeout: {}", e))
                } else {
                    RefineryError::OracleRequest(format!("connection: {}", e))
                }
            })?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(RefineryError::OracleRequest(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    truncate(&text, 500)
                )));
            }

            let parsed: ChatResponse = resp
                .json()
                .await
                .map_err(|e| RefineryError::OracleParse(e.to_string()))?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| RefineryError::OracleParse("response has no content".into()))?;

            debug!(
                model = %self.config.model_id,
                chars = content.len(),
                structured = schema.is_some(),
                "Oracle response received"
            );

            interpret(content, schema)
        })
    }
}
