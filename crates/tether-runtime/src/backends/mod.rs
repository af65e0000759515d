//! Backend abstractions for tether-runtime.
//!
//! A backend is one way of reaching an LLM: a local Ollama server or a cloud
//! OpenAI-compatible endpoint. The [`BackendSelector`](crate::BackendSelector)
//! owns backend instances and hands them out as leases.
//!
//! ## Security
//!
//! Cloud backends hold their key in an [`ApiCredential`], which never shows
//! up in `Debug` or `Display` output.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use tether_core::{AgentConfig, FinishReason, TokenUsage};

mod factory;
pub mod secrets;

#[cfg(any(feature = "local", feature = "cloud"))]
mod http;

#[cfg(feature = "local")]
mod ollama;

#[cfg(feature = "cloud")]
mod openai;

pub use factory::{BackendFactory, BackendRegistry};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "local")]
pub use ollama::{OllamaBackend, OllamaBackendFactory, OllamaConfig};

#[cfg(feature = "cloud")]
pub use openai::{
    OpenAiCompatibleBackend, OpenAiCompatibleBackendFactory, OpenAiCompatibleConfig,
    CLOUD_API_KEY_ENV,
};

/// Errors from backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Generation failed: {cause}")]
    Generation { cause: String },

    #[error("Could not parse tool call: {0}")]
    ToolCallParse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Backend not configured: {0}")]
    NotConfigured(String),
}

impl BackendError {
    pub fn generation(cause: impl Into<String>) -> Self {
        Self::Generation {
            cause: cause.into(),
        }
    }

    /// Failures worth retrying at the transport level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::RateLimited { .. }
        )
    }
}

/// Where a backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Cloud => write!(f, "cloud"),
        }
    }
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message for generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature (0.0 for deterministic)
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Stop sequences
    pub stop: Vec<String>,

    /// Request timeout
    pub timeout: Duration,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            stop: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl SamplingParams {
    /// Sampling defaults of an agent, bounded by its timeout.
    pub fn for_agent(agent: &AgentConfig) -> Self {
        let sampling = agent.sampling();
        Self {
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            stop: sampling.stop.clone(),
            timeout: agent.timeout(),
        }
    }

    /// Deterministic settings used for judging.
    pub fn deterministic(max_tokens: u32, timeout: Duration) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            stop: Vec::new(),
            timeout,
        }
    }
}

/// Everything a backend needs for one call. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Prompt for this call, sent as the last user message
    pub prompt: String,

    /// Optional system instruction
    pub system: Option<String>,

    /// Earlier messages, oldest first
    pub history: Vec<ChatMessage>,

    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            history: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Full message list: system, history, then the prompt.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// Result of a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Generated text
    pub text: String,

    /// Token usage
    pub usage: TokenUsage,

    pub finish_reason: FinishReason,

    /// Model that served the call
    pub model: String,
}

/// A tool the model may call. Calls are parsed, never executed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,

    /// JSON Schema of the arguments object
    #[serde(default)]
    pub parameters: JsonValue,
}

/// A structured tool call returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: JsonValue,
}

/// Result of a generation with tools offered.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolGeneration {
    pub result: GenerationResult,
    pub tool_calls: Vec<ToolCall>,
}

/// Incremental text of a streamed generation.
///
/// Finite and not restartable. Dropping it cancels the underlying request.
pub type TextStream = BoxStream<'static, Result<String, BackendError>>;

/// Backend abstraction over local and cloud LLMs.
///
/// Implementations hold no per-call mutable state and are shared as
/// `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Prepare the backend. Idempotent.
    async fn load(&self) -> Result<bool, BackendError>;

    /// Release resources held by `load`.
    async fn unload(&self) {}

    /// Generate a completion.
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationResult, BackendError>;

    /// Generate with tools offered, returning any structured calls.
    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        tools: &[ToolSpec],
    ) -> Result<ToolGeneration, BackendError>;

    /// Stream a completion as text increments.
    async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, BackendError>;

    /// Check reachability. Never errors.
    async fn health_check(&self) -> bool;

    fn kind(&self) -> BackendKind;

    /// Backend name for logs and descriptors.
    fn name(&self) -> &str;

    /// Model id requested from the backend.
    fn model(&self) -> &str;

    fn endpoint(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        // Simple estimate: ~4 chars per token
        u32::try_from(text.len() / 4).unwrap_or(u32::MAX)
    }
}
