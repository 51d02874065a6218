use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use tessera_core::lm::{GenerationRequest, LanguageModel, LmError};
use tessera_core::schema::Schema;
use tessera_core::value::StructuralValue;

use crate::prompt::PromptRenderer;

const MAX_PROMPT_LOG_CHARS: usize = 4_000;
const MAX_LLM_OUTPUT_LOG_CHARS: usize = 8_000;

/// HTTP model config (OpenAI-compatible)
#[derive(Debug, Clone)]
pub struct HttpLanguageModelConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
    pub extra_headers: HeaderMap,
    /// Backend name, kept in the portable config for re-resolution.
    pub backend: Option<String>,
}

impl Default for HttpLanguageModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: None,
            timeout_secs: 60,
            extra_headers: HeaderMap::new(),
            backend: None,
        }
    }
}

/// Structured generation over an OpenAI-compatible chat-completions API
pub struct HttpLanguageModel {
    client: reqwest::Client,
    config: HttpLanguageModelConfig,
    renderer: PromptRenderer,
}

impl HttpLanguageModel {
    pub fn new(config: HttpLanguageModelConfig) -> Result<Self, LmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LmError::Http(e.to_string()))?;
        Ok(Self {
            client,
            config,
            renderer: PromptRenderer::new(),
        })
    }

    pub fn config(&self) -> &HttpLanguageModelConfig {
        &self.config
    }

    async fn complete(&self, system: String, user: String) -> Result<String, LmError> {
        let mut headers = self.config.extra_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.config.api_key {
            let value = format!("Bearer {}", key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|e| LmError::Http(e.to_string()))?,
            );
        }

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object".to_string(),
            },
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| LmError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LmError::Response(format!("HTTP {}: {}", status, text)));
        }

        let text = response
            .text()
            .await
            .map_err(|e| LmError::Http(e.to_string()))?;
        parse_chat_response(&text)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

fn parse_chat_response(text: &str) -> Result<String, LmError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| LmError::Serialization(e.to_string()))?;
    parsed
        .choices
        .first()
        .map(|c| c.message.content.clone())
        .ok_or_else(|| LmError::Response("Missing choices".to_string()))
}

/// Parse model output text into a value of `schema`.
fn parse_structured_output(output: &str, schema: &Schema) -> Result<StructuralValue, LmError> {
    let json_str = extract_json(output)
        .ok_or_else(|| LmError::Malformed("output did not contain a JSON object".to_string()))?;
    let data: Value = serde_json::from_str(&json_str)
        .map_err(|e| LmError::Malformed(format!("invalid JSON: {}", e)))?;
    StructuralValue::construct(schema.clone(), data).map_err(|e| LmError::Malformed(e.to_string()))
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, request: GenerationRequest) -> Result<StructuralValue, LmError> {
        let prompt = self.renderer.render(&request)?;
        info!(
            model = %self.config.model,
            temperature = self.config.temperature,
            instruction_count = request.instructions.len(),
            example_count = request.examples.len(),
            output_fields = request.output_schema.len(),
            "generation request prepared"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                system_prompt = %truncate_for_log(&prompt.system, MAX_PROMPT_LOG_CHARS),
                user_prompt = %truncate_for_log(&prompt.user, MAX_PROMPT_LOG_CHARS),
                "generation prompts"
            );
        }

        let output = self.complete(prompt.system, prompt.user).await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                llm_output = %truncate_for_log(&output, MAX_LLM_OUTPUT_LOG_CHARS),
                "generation raw output"
            );
        }

        let value = parse_structured_output(&output, &request.output_schema)?;
        debug!(model = %self.config.model, "generation output validated");
        Ok(value)
    }

    fn get_config(&self) -> Value {
        json!({
            "kind": "http",
            "backend": self.config.backend,
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        })
    }
}

/// Outermost `{...}` span of `text`; models often wrap JSON in prose or fences.
pub fn extract_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}
