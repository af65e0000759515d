//! Scripted backend for execution tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{AgentConfig, FinishReason, TokenUsage};
use tether_runtime::{
    Backend, BackendError, BackendKind, BackendSelector, ExecutionCore, GenerationRequest,
    GenerationResult, SelectionMode, SelectorConfig, TextStream, ToolGeneration, ToolSpec,
};

/// What the next generation call does.
pub enum Reply {
    Text(String),
    Fail(BackendError),
    /// Never finishes
    Hang,
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

type JudgeFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Backend that replays scripted generations and answers judge calls
/// through a closure over the judge prompt.
pub struct FakeBackend {
    kind: BackendKind,
    name: String,
    load_script: Mutex<VecDeque<bool>>,
    replies: Mutex<VecDeque<Reply>>,
    judge: JudgeFn,
    pub load_calls: AtomicUsize,
    pub judge_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            name: format!("fake-{}", kind),
            load_script: Mutex::new(VecDeque::new()),
            replies: Mutex::new(VecDeque::new()),
            judge: Box::new(|_| r#"{"score": 1.0, "feedback": "fine"}"#.to_string()),
            load_calls: AtomicUsize::new(0),
            judge_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Results of successive `load` calls; loads succeed once the script runs out.
    pub fn loads(self, script: &[bool]) -> Self {
        *self.load_script.lock() = script.iter().copied().collect();
        self
    }

    pub fn replies(self, replies: Vec<Reply>) -> Self {
        *self.replies.lock() = replies.into();
        self
    }

    pub fn judge(mut self, judge: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.judge = Box::new(judge);
        self
    }

    /// Judge that gives every criterion the same score.
    pub fn scoring(self, score: f64) -> Self {
        self.judge(move |_| format!(r#"{{"score": {}, "feedback": "scored {}"}}"#, score, score))
    }

    pub fn generation_prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn load(&self) -> Result<bool, BackendError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.load_script.lock().pop_front().unwrap_or(true) {
            Ok(true)
        } else {
            Err(BackendError::Unavailable(format!("{} refused", self.name)))
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, BackendError> {
        // Judge calls carry a system prompt, task generations do not
        if request.system.is_some() {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(GenerationResult {
                text: (self.judge)(&request.prompt),
                usage: TokenUsage::new(50, 20),
                finish_reason: FinishReason::Completed,
                model: "fake-judge".to_string(),
            });
        }

        self.prompts.lock().push(request.prompt.clone());
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Text(text)) => Ok(GenerationResult {
                text,
                usage: TokenUsage::new(100, 40),
                finish_reason: FinishReason::Completed,
                model: format!("{}-model", self.name),
            }),
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(BackendError::generation("woke up"))
            }
            None => Err(BackendError::generation("script exhausted")),
        }
    }

    async fn generate_with_tools(
        &self,
        request: &GenerationRequest,
        _tools: &[ToolSpec],
    ) -> Result<ToolGeneration, BackendError> {
        Ok(ToolGeneration {
            result: self.generate(request).await?,
            tool_calls: Vec::new(),
        })
    }

    async fn stream(&self, _request: &GenerationRequest) -> Result<TextStream, BackendError> {
        Err(BackendError::NotConfigured("no streaming".to_string()))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    fn endpoint(&self) -> &str {
        "fake://"
    }
}

pub fn selector_config(mode: SelectionMode, fallback_to_cloud: bool) -> SelectorConfig {
    SelectorConfig {
        mode,
        fallback_to_cloud,
        ..SelectorConfig::default()
    }
}

/// Core over the given backends.
pub fn core(
    config: SelectorConfig,
    local: Option<Arc<FakeBackend>>,
    cloud: Option<Arc<FakeBackend>>,
) -> ExecutionCore {
    let local = local.map(|b| b as Arc<dyn Backend>);
    let cloud = cloud.map(|b| b as Arc<dyn Backend>);
    ExecutionCore::new(Arc::new(BackendSelector::new(config, local, cloud)))
}

/// Core with a single local backend.
pub fn local_core(backend: Arc<FakeBackend>) -> ExecutionCore {
    core(selector_config(SelectionMode::Local, false), Some(backend), None)
}

pub const ARTICLE_AGENT: &str = r#"
name: healthcare-writer
description: Write a short article about the given topic
input_constraints:
  - name: topic_type
    rule: type
    kind: string
  - name: topic_length
    rule: length
    min: 1
    max: 50
output_constraints:
  - name: article_length
    rule: length
    min: 100
    message: article is too short
criteria:
  - name: quality
    description: The article is detailed, accurate and well organized
    min_score: 0.8
max_attempts: 3
timeout: 5s
"#;

pub fn article_agent() -> AgentConfig {
    AgentConfig::from_yaml(ARTICLE_AGENT).expect("article agent parses")
}

/// A string of exactly `n` characters.
pub fn chars(n: usize) -> String {
    "x".repeat(n)
}
