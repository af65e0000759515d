//! Local backend over the Ollama HTTP API.
//!
//! `load` pulls the model if the server does not have it yet. Generation uses
//! `/api/chat`; streaming reads its newline-delimited JSON chunks.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{FinishReason, TokenUsage};

use super::factory::BackendFactory;
use super::http::{
    build_client, lines, map_status, map_transport_error, retry_after, tool_definition,
};
use super::{
    Backend, BackendError, BackendKind, GenerationRequest, GenerationResult, TextStream,
    ToolCall, ToolGeneration, ToolSpec,
};

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen3:8b";

/// Settings for [`OllamaBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Pull the model during `load` when the server does not have it
    #[serde(default = "default_true")]
    pub pull_missing: bool,

    /// Budget for a model pull, which can take minutes
    #[serde(default = "default_pull_timeout", with = "tether_core::duration")]
    pub pull_timeout: Duration,

    /// Budget for `health_check`
    #[serde(default = "default_health_timeout", with = "tether_core::duration")]
    pub health_timeout: Duration,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_pull_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            model: default_model(),
            pull_missing: true,
            pull_timeout: default_pull_timeout(),
            health_timeout: default_health_timeout(),
        }
    }
}

/// Backend talking to a local Ollama server.
#[derive(Debug)]
pub struct OllamaBackend {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self, BackendError> {
        let config = OllamaConfig {
            host: config.host.trim_end_matches('/').to_string(),
            ..config
        };
        Ok(Self {
            client: build_client(Duration::from_secs(5))?,
            config,
        })
    }

    /// Build from JSON settings, filling defaults.
    pub fn from_config(config: &JsonValue) -> Result<Self, BackendError> {
        let config: OllamaConfig = if config.is_null() {
            OllamaConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| BackendError::NotConfigured(format!("ollama settings: {}", e)))?
        };
        Self::new(config)
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host, path)
    }

    async fn list_models(&self) -> Result<TagsResponse, BackendError> {
        let timeout = self.config.health_timeout;
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(map_transport_error(e, timeout).to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "listing models returned HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(format!("bad /api/tags response: {}", e)))
    }

    async fn pull_model(&self) -> Result<(), BackendError> {
        tracing::info!(model = %self.config.model, "Pulling model");
        let timeout = self.config.pull_timeout;
        let response = self
            .client
            .post(self.url("/api/pull"))
            .timeout(timeout)
            .json(&serde_json::json!({"model": self.config.model, "stream": false}))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(map_transport_error(e, timeout).to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!(
                "pulling {} failed with HTTP {}: {}",
                self.config.model, status, body
            )));
        }
        Ok(())
    }

    async fn chat(&self, body: &JsonValue, timeout: Duration) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url("/api/chat"))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), retry, &text));
        }
        Ok(response)
    }

    async fn chat_once(
        &self,
        request: &GenerationRequest,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ToolGeneration, BackendError> {
        let body = build_chat_body(&self.config.model, request, tools, false);
        let timeout = request.sampling.timeout;
        let response = self.chat(&body, timeout).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;
        parse_chat_response(parsed, !request.sampling.stop.is_empty())
    }
}

/// Request body for `/api/chat`.
pub(crate) fn build_chat_body(
    model: &str,
    request: &GenerationRequest,
    tools: Option<&[ToolSpec]>,
    stream: bool,
) -> JsonValue {
    let mut options = serde_json::json!({
        "temperature": request.sampling.temperature,
        "num_predict": request.sampling.max_tokens,
    });
    if !request.sampling.stop.is_empty() {
        options["stop"] = serde_json::json!(request.sampling.stop);
    }

    let mut body = serde_json::json!({
        "model": model,
        "messages": request.messages(),
        "stream": stream,
        "options": options,
    });

    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        body["tools"] = JsonValue::Array(tools.iter().map(tool_definition).collect());
    }
    body
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl TagsResponse {
    /// Whether `model` is resident. A bare name matches its `:latest` tag.
    pub(crate) fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| {
            m.name == model || (!model.contains(':') && m.name == format!("{}:latest", model))
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    model: String,
    message: Option<ResponseMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

/// A `"stop"` on a request with stop sequences is attributed to them.
pub(crate) fn map_done_reason(reason: Option<&str>, caller_stop: bool) -> FinishReason {
    match reason {
        Some("length") => FinishReason::LengthTruncated,
        Some("stop") if caller_stop => FinishReason::StoppedByCaller,
        Some("stop") | Some("load") | None => FinishReason::Completed,
        Some(_) => FinishReason::Error,
    }
}

pub(crate) fn parse_chat_response(
    response: ChatResponse,
    caller_stop: bool,
) -> Result<ToolGeneration, BackendError> {
    let message = response
        .message
        .ok_or_else(|| BackendError::generation("response has no message"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = match call.function.arguments {
                // Some models send arguments as an encoded string
                JsonValue::String(raw) => serde_json::from_str(&raw).map_err(|e| {
                    BackendError::ToolCallParse(format!("{}: {}", call.function.name, e))
                })?,
                JsonValue::Null => JsonValue::Object(Default::default()),
                other => other,
            };
            Ok(ToolCall {
                name: call.function.name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    Ok(ToolGeneration {
        result: GenerationResult {
            text: message.content,
            usage: TokenUsage::new(response.prompt_eval_count, response.eval_count),
            finish_reason: map_done_reason(response.done_reason.as_deref(), caller_stop),
            model: response.model,
        },
        tool_calls,
    })
}

/// Content of one streamed NDJSON chunk. `None` for empty chunks.
pub(crate) fn parse_stream_chunk(line: &str) -> Result<Option<String>, BackendError> {
    let chunk: JsonValue = serde_json::from_str(line)
        .map_err(|e| BackendError::generation(format!("bad stream chunk: {}", e)))?;
    if let Some(error) = chunk["error"].as_str() {
        return Err(BackendError::generation(error.to_string()));
    }
    Ok(chunk["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn load(&self) -> Result<bool, BackendError> {
        let tags = self.list_models().await?;
        if tags.has_model(&self.config.model) {
            return Ok(true);
        }
        if !self.config.pull_missing {
            return Err(BackendError::Unavailable(format!(
                "model {} is not available locally",
                self.config.model
            )));
        }
        self.pull_model().await?;
        Ok(true)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, BackendError> {
        Ok(self.chat_once(request, None).await?.result)
    }

    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        tools: &[ToolSpec],
    ) -> Result<ToolGeneration, BackendError> {
        self.chat_once(request, Some(tools)).await
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, BackendError> {
        let body = build_chat_body(&self.config.model, request, None, true);
        let response = self.chat(&body, request.sampling.timeout).await?;
        let chunks = lines(response.bytes_stream())
            .try_filter_map(|line| futures::future::ready(parse_stream_chunk(&line)));
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(self.url("/api/version"))
            .timeout(self.config.health_timeout)
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> &str {
        &self.config.host
    }
}

/// Factory for [`OllamaBackend`].
///
/// ## Configuration Format
/// ```json
/// {
///   "host": "http://localhost:11434",   // Optional
///   "model": "qwen3:8b",                 // Optional
///   "pull_missing": true                 // Optional
/// }
/// ```
pub struct OllamaBackendFactory;

impl BackendFactory for OllamaBackendFactory {
    fn backend_type(&self) -> &'static str {
        "ollama"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(OllamaBackend::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), BackendError> {
        if let Some(host) = config["host"].as_str() {
            if !host.starts_with("http://") && !host.starts_with("https://") {
                return Err(BackendError::NotConfigured(
                    "host must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({
            "host": DEFAULT_HOST,
            "model": DEFAULT_MODEL,
        })
    }

    fn description(&self) -> &'static str {
        "Local models served by Ollama"
    }
}
