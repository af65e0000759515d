//! Cloud backend for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Defaults target DashScope's compatible mode with `qwen-plus`. Any server
//! speaking the same protocol works by changing `base_url` and `model`.
//!
//! ## Security
//!
//! The API key is held in an [`ApiCredential`] and exposed only when the
//! `Authorization` header is set.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::future::ready;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{FinishReason, TokenUsage};

use super::factory::BackendFactory;
use super::http::{
    build_client, lines, map_status, map_transport_error, retry_after, tool_definition,
};
use super::secrets::ApiCredential;
use super::{
    Backend, BackendError, BackendKind, GenerationRequest, GenerationResult, TextStream,
    ToolCall, ToolGeneration, ToolSpec,
};

/// Environment variable consulted when the config has no `api_key`.
pub const CLOUD_API_KEY_ENV: &str = "TETHER_CLOUD_API_KEY";

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-plus";

const CREDENTIAL_NAME: &str = "Cloud API key";

/// Settings for [`OpenAiCompatibleBackend`]. The key is read separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiCompatibleConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Retries for rate limits and transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Budget for `load` and `health_check` probes
    #[serde(default = "default_health_timeout", with = "tether_core::duration")]
    pub health_timeout: Duration,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_retries() -> usize {
    3
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for OpenAiCompatibleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_retries: default_max_retries(),
            health_timeout: default_health_timeout(),
        }
    }
}

/// Backend for hosted OpenAI-compatible APIs.
pub struct OpenAiCompatibleBackend {
    credential: ApiCredential,
    config: OpenAiCompatibleConfig,
    client: reqwest::Client,
    loaded: AtomicBool,
}

impl std::fmt::Debug for OpenAiCompatibleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleBackend")
            .field("credential", &self.credential)
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiCompatibleBackend {
    pub fn new(
        credential: ApiCredential,
        config: OpenAiCompatibleConfig,
    ) -> Result<Self, BackendError> {
        let config = OpenAiCompatibleConfig {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ..config
        };
        Ok(Self {
            credential,
            config,
            client: build_client(Duration::from_secs(10))?,
            loaded: AtomicBool::new(false),
        })
    }

    /// Build from JSON settings: `api_key` from config or `TETHER_CLOUD_API_KEY`.
    pub fn from_config(config: &JsonValue) -> Result<Self, BackendError> {
        let credential =
            ApiCredential::from_config_or_env(config, "api_key", CLOUD_API_KEY_ENV, CREDENTIAL_NAME)?;

        // api_key is not part of the typed settings
        let mut settings = if config.is_object() {
            config.clone()
        } else {
            serde_json::json!({})
        };
        if let Some(map) = settings.as_object_mut() {
            map.remove("api_key");
        }
        let settings: OpenAiCompatibleConfig = serde_json::from_value(settings)
            .map_err(|e| BackendError::NotConfigured(format!("cloud settings: {}", e)))?;

        Self::new(credential, settings)
    }

    pub fn config(&self) -> &OpenAiCompatibleConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send_chat(
        &self,
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(self.credential.expose())
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

    /// `send_chat` with exponential backoff on rate limits and transport failures.
    async fn send_with_retry(
        &self,
        body: &JsonValue,
        timeout: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(16))
            .with_max_times(self.config.max_retries);

        (move || async move { self.send_chat(body, timeout).await })
            .retry(backoff)
            .when(BackendError::is_transient)
            .notify(|error: &BackendError, delay: Duration| {
                tracing::warn!(
                    backend = "openai_compatible",
                    error = %error,
                    delay = ?delay,
                    "Retrying cloud request"
                );
            })
            .await
    }

    async fn complete(
        &self,
        request: &GenerationRequest,
        tools: Option<&[ToolSpec]>,
    ) -> Result<ToolGeneration, BackendError> {
        if self.credential.is_empty() {
            return Err(BackendError::NotConfigured(format!(
                "{} is empty",
                CREDENTIAL_NAME
            )));
        }
        let body = build_completion_body(&self.config.model, request, tools, false);
        let timeout = request.sampling.timeout;
        let response = self.send_with_retry(&body, timeout).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;
        parse_completion(parsed, !request.sampling.stop.is_empty())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let request = GenerationRequest::new("ping").with_sampling(super::SamplingParams {
            temperature: 0.0,
            max_tokens: 1,
            stop: Vec::new(),
            timeout: self.config.health_timeout,
        });
        let body = build_completion_body(&self.config.model, &request, None, false);
        self.send_chat(&body, self.config.health_timeout)
            .await
            .map(|_| ())
    }
}

/// Request body for `/chat/completions`.
pub(crate) fn build_completion_body(
    model: &str,
    request: &GenerationRequest,
    tools: Option<&[ToolSpec]>,
    stream: bool,
) -> JsonValue {
    let mut body = serde_json::json!({
        "model": model,
        "messages": request.messages(),
        "temperature": request.sampling.temperature,
        "max_tokens": request.sampling.max_tokens,
        "stream": stream,
    });
    if !request.sampling.stop.is_empty() {
        body["stop"] = serde_json::json!(request.sampling.stop);
    }
    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        body["tools"] = JsonValue::Array(tools.iter().map(tool_definition).collect());
        body["tool_choice"] = serde_json::json!("auto");
    }
    body
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
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
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// `caller_stop` is whether the request carried stop sequences. A plain
/// `"stop"` is then attributed to them.
pub(crate) fn map_finish_reason(reason: Option<&str>, caller_stop: bool) -> FinishReason {
    match reason {
        Some("stop") if caller_stop => FinishReason::StoppedByCaller,
        None | Some("stop") | Some("tool_calls") | Some("function_call") => {
            FinishReason::Completed
        }
        Some("length") => FinishReason::LengthTruncated,
        Some(_) => FinishReason::Error,
    }
}

pub(crate) fn parse_completion(
    response: CompletionResponse,
    caller_stop: bool,
) -> Result<ToolGeneration, BackendError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::generation("response has no choices"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let raw = call.function.arguments.trim();
            let arguments = if raw.is_empty() {
                JsonValue::Object(Default::default())
            } else {
                serde_json::from_str(raw).map_err(|e| {
                    BackendError::ToolCallParse(format!("{}: {}", call.function.name, e))
                })?
            };
            Ok(ToolCall {
                name: call.function.name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    let usage = response
        .usage
        .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(ToolGeneration {
        result: GenerationResult {
            text: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref(), caller_stop),
            model: response.model,
        },
        tool_calls,
    })
}

/// One server-sent event line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> Result<SseEvent, BackendError> {
    let Some(payload) = line.strip_prefix("data:") else {
        // event:, id:, and ": keep-alive" comment lines
        return Ok(SseEvent::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: JsonValue = serde_json::from_str(payload)
        .map_err(|e| BackendError::generation(format!("bad stream event: {}", e)))?;
    if let Some(message) = chunk["error"]["message"].as_str() {
        return Err(BackendError::generation(message.to_string()));
    }
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Delta(s.to_string()))
        .unwrap_or(SseEvent::Skip))
}

#[async_trait]
impl Backend for OpenAiCompatibleBackend {
    async fn load(&self) -> Result<bool, BackendError> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(true);
        }
        if self.credential.is_empty() {
            return Err(BackendError::NotConfigured(format!(
                "{} is empty",
                CREDENTIAL_NAME
            )));
        }
        self.probe().await.map_err(|e| match e {
            BackendError::NotConfigured(_) => e,
            other => BackendError::Unavailable(other.to_string()),
        })?;
        self.loaded.store(true, Ordering::Release);
        Ok(true)
    }

    async fn unload(&self) {
        self.loaded.store(false, Ordering::Release);
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, BackendError> {
        Ok(self.complete(request, None).await?.result)
    }

    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        tools: &[ToolSpec],
    ) -> Result<ToolGeneration, BackendError> {
        self.complete(request, Some(tools)).await
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, BackendError> {
        let body = build_completion_body(&self.config.model, request, None, true);
        let response = self.send_with_retry(&body, request.sampling.timeout).await?;
        let deltas = lines(response.bytes_stream())
            .and_then(|line| ready(parse_sse_line(&line)))
            .try_take_while(|event| ready(Ok(*event != SseEvent::Done)))
            .try_filter_map(|event| {
                ready(Ok(match event {
                    SseEvent::Delta(text) => Some(text),
                    _ => None,
                }))
            });
        Ok(Box::pin(deltas))
    }

    async fn health_check(&self) -> bool {
        if self.credential.is_empty() {
            return false;
        }
        let result = self
            .client
            .get(self.url("/models"))
            .bearer_auth(self.credential.expose())
            .timeout(self.config.health_timeout)
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> &str {
        &self.config.base_url
    }
}

/// Factory for [`OpenAiCompatibleBackend`].
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "sk-...",          // Optional, falls back to TETHER_CLOUD_API_KEY
///   "base_url": "https://...",    // Optional, defaults to DashScope compatible mode
///   "model": "qwen-plus",         // Optional
///   "max_retries": 3              // Optional
/// }
/// ```
pub struct OpenAiCompatibleBackendFactory;

impl BackendFactory for OpenAiCompatibleBackendFactory {
    fn backend_type(&self) -> &'static str {
        "openai_compatible"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(OpenAiCompatibleBackend::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), BackendError> {
        if !ApiCredential::is_available(config, "api_key", CLOUD_API_KEY_ENV) {
            return Err(BackendError::NotConfigured(format!(
                "{} required: set 'api_key' in config or {} env",
                CREDENTIAL_NAME, CLOUD_API_KEY_ENV
            )));
        }
        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(BackendError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({
            "base_url": DEFAULT_BASE_URL,
            "model": DEFAULT_MODEL,
            "max_retries": 3
        })
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions (DashScope, OpenAI, vLLM)"
    }
}
