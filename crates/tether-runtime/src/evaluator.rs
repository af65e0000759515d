//! LLM-judged criterion evaluation.
//!
//! Each criterion is judged in its own call at temperature 0. Judgments are
//! parsed leniently (code fences and surrounding prose are tolerated) but
//! the score itself must be present and finite. One unparseable answer earns
//! a single stricter re-ask; a second failure scores the criterion 0.
//!
//! Parsed judgments are cached by (judge, criterion, output) so a resampled
//! output identical to an earlier one is not judged twice by the same judge.

use futures::future::try_join_all;
use lazy_static::lazy_static;
use moka::future::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

use tether_core::{Criterion, EvaluationRecord, QualityVerdict, TokenUsage};

use crate::backends::{Backend, BackendError, GenerationRequest, SamplingParams};
use crate::prompts::{judge_prompt, strict_judge_prompt, JUDGE_SYSTEM_PROMPT};

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").expect("valid regex");
}

/// Errors from judging.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Could not parse judgment: {0}")]
    Parse(String),

    #[error("Judge call failed: {0}")]
    Backend(#[from] BackendError),
}

/// A parsed judge answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub score: f64,
    pub feedback: String,
    pub suggestions: Vec<String>,
}

impl Judgment {
    fn into_record(self, criterion: &Criterion) -> EvaluationRecord {
        EvaluationRecord::new(criterion.name(), self.score, self.feedback, self.suggestions)
    }
}

#[derive(Deserialize)]
struct RawJudgment {
    #[serde(default)]
    score: Option<JsonValue>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Parse a judge answer into a [`Judgment`].
///
/// Takes the outermost `{...}` after stripping code fences. The score may be
/// a number or a numeric string and is clamped into [0, 1].
pub fn parse_judgment(text: &str) -> Result<Judgment, EvaluationError> {
    let body = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);

    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(EvaluationError::Parse("no JSON object in answer".to_string()));
    };
    if end < start {
        return Err(EvaluationError::Parse("no JSON object in answer".to_string()));
    }

    let raw: RawJudgment = serde_json::from_str(&body[start..=end])
        .map_err(|e| EvaluationError::Parse(e.to_string()))?;

    let score = match raw.score {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| EvaluationError::Parse("missing or non-numeric score".to_string()))?;

    if !score.is_finite() {
        return Err(EvaluationError::Parse(format!("non-finite score {}", score)));
    }

    Ok(Judgment {
        score: score.clamp(0.0, 1.0),
        feedback: raw.feedback.unwrap_or_default(),
        suggestions: raw.suggestions,
    })
}

/// Evaluator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Token budget of one judge answer
    pub max_tokens: u32,

    /// Bound on one judge call
    #[serde(with = "tether_core::duration")]
    pub timeout: Duration,

    pub cache_capacity: u64,

    #[serde(with = "tether_core::duration")]
    pub cache_ttl: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            timeout: Duration::from_secs(30),
            cache_capacity: 1_000,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Judgments for all criteria of one output.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verdict: QualityVerdict,

    /// Usage of every judge call made, excluding cache hits
    pub judge_calls: Vec<TokenUsage>,
}

/// Judgments are only reused for the same judge, criterion and output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    judge_hash: u64,
    criterion_hash: u64,
    output_hash: u64,
}

impl CacheKey {
    fn new(backend: &dyn Backend, criterion: &Criterion, output: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();
        backend.name().hash(&mut hasher);
        backend.model().hash(&mut hasher);
        let judge_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        criterion.name().hash(&mut hasher);
        criterion.description().hash(&mut hasher);
        let criterion_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        output.hash(&mut hasher);
        let output_hash = hasher.finish();

        Self {
            judge_hash,
            criterion_hash,
            output_hash,
        }
    }
}

/// Scores outputs against criteria with an LLM judge.
pub struct CriterionEvaluator {
    config: EvaluatorConfig,
    cache: Cache<CacheKey, Judgment>,
}

impl CriterionEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self { config, cache }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Judge `output` against every criterion and aggregate.
    ///
    /// Criteria are judged concurrently; records keep criterion order.
    pub async fn evaluate(
        &self,
        backend: &dyn Backend,
        criteria: &[Criterion],
        output: &str,
    ) -> Result<Evaluation, EvaluationError> {
        let judged = try_join_all(
            criteria
                .iter()
                .map(|criterion| self.evaluate_criterion(backend, criterion, output)),
        )
        .await?;

        let mut records = Vec::with_capacity(judged.len());
        let mut judge_calls = Vec::new();
        for (record, usage) in judged {
            records.push(record);
            judge_calls.extend(usage);
        }

        let verdict = QualityVerdict::aggregate(criteria, records);
        tracing::debug!(
            score = verdict.overall_score,
            accepted = verdict.accepted,
            "Quality evaluated"
        );
        Ok(Evaluation {
            verdict,
            judge_calls,
        })
    }

    /// Judge one criterion, re-asking once on an unparseable answer.
    pub async fn evaluate_criterion(
        &self,
        backend: &dyn Backend,
        criterion: &Criterion,
        output: &str,
    ) -> Result<(EvaluationRecord, Vec<TokenUsage>), EvaluationError> {
        let key = CacheKey::new(backend, criterion, output);
        if let Some(judgment) = self.cache.get(&key).await {
            tracing::debug!(criterion = criterion.name(), "Judgment cache hit");
            return Ok((judgment.into_record(criterion), Vec::new()));
        }

        let (answer, first_usage) = self.judge(backend, judge_prompt(criterion, output)).await?;
        let mut calls = vec![first_usage];

        let judgment = match parse_judgment(&answer) {
            Ok(judgment) => judgment,
            Err(first_error) => {
                tracing::warn!(
                    criterion = criterion.name(),
                    error = %first_error,
                    "Unparseable judgment, asking again"
                );
                let (answer, usage) = self
                    .judge(backend, strict_judge_prompt(criterion, output))
                    .await?;
                calls.push(usage);

                match parse_judgment(&answer) {
                    Ok(judgment) => judgment,
                    Err(error) => {
                        tracing::warn!(
                            criterion = criterion.name(),
                            error = %error,
                            "Judgment still unparseable, scoring 0"
                        );
                        return Ok((
                            EvaluationRecord::unparseable(criterion.name(), error.to_string()),
                            calls,
                        ));
                    }
                }
            }
        };

        self.cache.insert(key, judgment.clone()).await;
        Ok((judgment.into_record(criterion), calls))
    }

    /// Drop every cached judgment.
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }

    async fn judge(
        &self,
        backend: &dyn Backend,
        prompt: String,
    ) -> Result<(String, TokenUsage), EvaluationError> {
        let request = GenerationRequest::new(prompt)
            .with_system(JUDGE_SYSTEM_PROMPT.trim())
            .with_sampling(SamplingParams::deterministic(
                self.config.max_tokens,
                self.config.timeout,
            ));

        let result = tokio::time::timeout(self.config.timeout, backend.generate(&request))
            .await
            .map_err(|_| BackendError::Timeout(self.config.timeout))??;
        Ok((result.text, result.usage))
    }
}

impl Default for CriterionEvaluator {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendKind, GenerationResult, TextStream, ToolGeneration, ToolSpec};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::FinishReason;

    /// Answers judge calls from a queue.
    struct ScriptedJudge {
        name: String,
        answers: Mutex<VecDeque<Result<String, BackendError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedJudge {
        fn new(answers: Vec<Result<&str, BackendError>>) -> Self {
            Self {
                name: "scripted-judge".to_string(),
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .map(|a| a.map(str::to_string))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }

        fn named(mut self, name: &str) -> Self {
            self.name = name.to_string();
            self
        }
    }

    #[async_trait]
    impl Backend for ScriptedJudge {
        async fn load(&self) -> Result<bool, BackendError> {
            Ok(true)
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResult, BackendError> {
            assert_eq!(request.sampling.temperature, 0.0);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self
                .answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("{\"score\": 1.0}".to_string()))?;
            Ok(GenerationResult {
                text: answer,
                usage: TokenUsage::new(40, 10),
                finish_reason: FinishReason::Completed,
                model: "judge".to_string(),
            })
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
            BackendKind::Local
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "judge"
        }

        fn endpoint(&self) -> &str {
            "judge://"
        }
    }

    fn criterion(name: &str, min: f64) -> Criterion {
        Criterion::new(name, format!("{} must hold", name), min).unwrap()
    }

    #[test]
    fn test_parse_plain_json() {
        let j = parse_judgment(r#"{"score": 0.85, "feedback": "good", "suggestions": ["x"]}"#)
            .unwrap();
        assert_eq!(j.score, 0.85);
        assert_eq!(j.feedback, "good");
        assert_eq!(j.suggestions, vec!["x"]);
    }

    #[test]
    fn test_parse_fenced_with_prose() {
        let text = "Here is my evaluation:\n```json\n{\"score\": 0.4, \"feedback\": \"thin\"}\n```\nThanks";
        let j = parse_judgment(text).unwrap();
        assert_eq!(j.score, 0.4);
        assert!(j.suggestions.is_empty());
    }

    #[test]
    fn test_parse_clamps_and_accepts_string_score() {
        assert_eq!(parse_judgment(r#"{"score": 1.7}"#).unwrap().score, 1.0);
        assert_eq!(parse_judgment(r#"{"score": -2}"#).unwrap().score, 0.0);
        assert_eq!(parse_judgment(r#"{"score": "0.6"}"#).unwrap().score, 0.6);
    }

    #[test]
    fn test_parse_rejects_bad_answers() {
        assert!(matches!(
            parse_judgment("0.9"),
            Err(EvaluationError::Parse(_))
        ));
        assert!(parse_judgment(r#"{"feedback": "no score"}"#).is_err());
        assert!(parse_judgment(r#"{"score": "NaN"}"#).is_err());
        assert!(parse_judgment(r#"{"score": "high"}"#).is_err());
        assert!(parse_judgment("} backwards {").is_err());
    }

    #[tokio::test]
    async fn test_reask_once_then_score_zero() {
        let judge = ScriptedJudge::new(vec![Ok("great output!"), Ok("still prose")]);
        let evaluator = CriterionEvaluator::default();
        let (record, calls) = evaluator
            .evaluate_criterion(&judge, &criterion("clarity", 0.5), "text")
            .await
            .unwrap();
        assert!(!record.parsed);
        assert_eq!(record.score, 0.0);
        assert_eq!(calls.len(), 2);
        assert_eq!(evaluator.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_reask_recovers() {
        let judge = ScriptedJudge::new(vec![Ok("prose"), Ok(r#"{"score": 0.9}"#)]);
        let evaluator = CriterionEvaluator::default();
        let (record, calls) = evaluator
            .evaluate_criterion(&judge, &criterion("clarity", 0.5), "text")
            .await
            .unwrap();
        assert!(record.parsed);
        assert_eq!(record.score, 0.9);
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn test_identical_output_is_cached() {
        let judge = ScriptedJudge::new(vec![Ok(r#"{"score": 0.9, "feedback": "fine"}"#)]);
        let evaluator = CriterionEvaluator::default();
        let c = criterion("accuracy", 0.8);

        evaluator.evaluate_criterion(&judge, &c, "same").await.unwrap();
        let (record, calls) = evaluator.evaluate_criterion(&judge, &c, "same").await.unwrap();
        assert_eq!(record.feedback, "fine");
        assert!(calls.is_empty());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_is_per_judge() {
        let local = ScriptedJudge::new(vec![Ok(r#"{"score": 0.9, "feedback": "local"}"#)])
            .named("local-judge");
        let cloud = ScriptedJudge::new(vec![Ok(r#"{"score": 0.4, "feedback": "cloud"}"#)])
            .named("cloud-judge");
        let evaluator = CriterionEvaluator::default();
        let c = criterion("accuracy", 0.8);

        evaluator.evaluate_criterion(&local, &c, "same").await.unwrap();
        let (record, calls) = evaluator.evaluate_criterion(&cloud, &c, "same").await.unwrap();
        assert_eq!(record.feedback, "cloud");
        assert_eq!(calls.len(), 1);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 1);

        let (record, calls) = evaluator.evaluate_criterion(&local, &c, "same").await.unwrap();
        assert_eq!(record.feedback, "local");
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_criterion_rejects() {
        let judge = ScriptedJudge::new(vec![
            Ok(r#"{"score": 1.0}"#),
            Ok(r#"{"score": 0.3, "feedback": "missing sources"}"#),
        ]);
        let evaluator = CriterionEvaluator::default();
        let criteria = vec![criterion("style", 0.8), criterion("sources", 0.8)];
        let evaluation = evaluator.evaluate(&judge, &criteria, "text").await.unwrap();

        assert!(!evaluation.verdict.accepted);
        assert_eq!(evaluation.verdict.records.len(), 2);
        assert_eq!(evaluation.judge_calls.len(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported() {
        let judge = ScriptedJudge::new(vec![Err(BackendError::Unavailable("down".into()))]);
        let evaluator = CriterionEvaluator::default();
        let result = evaluator
            .evaluate(&judge, &[criterion("accuracy", 0.8)], "text")
            .await;
        assert!(matches!(result, Err(EvaluationError::Backend(_))));
    }
}
