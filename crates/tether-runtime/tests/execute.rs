//! End-to-end behavior of the execution core against scripted backends.

mod common;

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{AgentConfig, AttemptFailure, ExecutionStatus, FailureKind};
use tether_runtime::{BackendError, BackendKind, CancelHandle, SelectionMode};

use common::*;

#[tokio::test]
async fn test_invalid_input_fails_without_attempts() {
    let backend = FakeBackend::new(BackendKind::Local).into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::InputConstraintViolation));
    assert_eq!(outcome.attempts(), 0);
    assert!(outcome.output.is_none());
    assert!(!outcome.history.input_check().unwrap().passed);
    // Input is checked before any backend is touched
    assert_eq!(backend.load_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_string_input_rejected() {
    let backend = FakeBackend::new(BackendKind::Local).into_arc();
    let outcome = local_core(backend).execute(&article_agent(), &json!(42)).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::InputConstraintViolation));
}

#[tokio::test]
async fn test_first_try_success() {
    let article = chars(150);
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&article)])
        .scoring(0.95)
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(outcome.output.as_deref(), Some(article.as_str()));

    let attempt = &outcome.history.attempts()[0];
    assert!(attempt.is_accepted());
    assert_eq!(attempt.generation.as_ref().unwrap().backend, "fake-local");
    assert_eq!(attempt.generation.as_ref().unwrap().output_chars, 150);
    assert!(!attempt.prompt.contains("Previous attempts"));
    assert!(attempt.prompt.contains("AI in healthcare"));
}

#[tokio::test]
async fn test_attempts_never_exceed_budget() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text("short"), text("short"), text("short"), text("short")])
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert_eq!(outcome.attempts(), 3);
    assert_eq!(backend.generation_prompts().len(), 3);
    assert_eq!(
        outcome.failure_kind(),
        Some(FailureKind::OutputConstraintViolation)
    );
    // Output never passed its constraints, so the judge was never asked
    assert_eq!(backend.judge_calls.load(Ordering::SeqCst), 0);
    for attempt in outcome.history.attempts() {
        assert!(attempt.verdict.is_none());
    }
}

#[tokio::test]
async fn test_violations_feed_next_prompt() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text("too short"), text(&chars(120))])
        .scoring(0.9)
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;
    assert!(outcome.is_accepted());

    let prompts = backend.generation_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("Previous attempts"));
    assert!(prompts[1].contains("Previous attempts"));
    assert!(prompts[1].contains("Attempt 1 broke these output constraints"));
    assert!(prompts[1].contains("article is too short"));
    assert!(prompts[1].starts_with(prompts[0].trim_end()));
}

#[tokio::test]
async fn test_quality_feedback_feeds_next_prompt() {
    let calls = AtomicUsize::new(0);
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&chars(120)), text(&chars(130))])
        .judge(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                r#"{"score": 0.4, "feedback": "no examples", "suggestions": ["cite a study"]}"#
                    .to_string()
            } else {
                r#"{"score": 0.9}"#.to_string()
            }
        })
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;
    assert!(outcome.is_accepted());
    assert_eq!(outcome.attempts(), 2);

    let first = &outcome.history.attempts()[0];
    match first.failure {
        Some(AttemptFailure::BelowQualityBar { overall_score }) => {
            assert!((overall_score - 0.4).abs() < 1e-9)
        }
        ref other => panic!("expected BelowQualityBar, got {:?}", other),
    }

    let prompts = backend.generation_prompts();
    assert!(prompts[1].contains("Attempt 1 scored 0.40"));
    assert!(prompts[1].contains("no examples"));
    assert!(prompts[1].contains("cite a study"));
}

#[tokio::test]
async fn test_one_low_criterion_is_not_masked() {
    let agent = AgentConfig::from_yaml(
        r#"
name: reviewer
description: Review the text
criteria:
  - name: style
    description: Reads well
    min_score: 0.8
  - name: sources
    description: Cites sources
    min_score: 0.8
max_attempts: 1
"#,
    )
    .unwrap();
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text("Some review")])
        .judge(|prompt| {
            if prompt.contains("## Criterion: sources") {
                r#"{"score": 0.3, "feedback": "no sources"}"#.to_string()
            } else {
                r#"{"score": 1.0}"#.to_string()
            }
        })
        .into_arc();

    let outcome = local_core(backend).execute(&agent, &json!("text")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::ExhaustedRetries));
    let verdict = outcome.history.attempts()[0].verdict.clone().unwrap();
    assert!(!verdict.accepted);
    assert_eq!(verdict.records.len(), 2);
    assert!((verdict.overall_score - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_auto_mode_falls_back_to_cloud() {
    let local = FakeBackend::new(BackendKind::Local).loads(&[false]).into_arc();
    let cloud = FakeBackend::new(BackendKind::Cloud)
        .replies(vec![text(&chars(200))])
        .into_arc();
    let core = core(
        selector_config(SelectionMode::Auto, true),
        Some(local.clone()),
        Some(cloud.clone()),
    );

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    assert_eq!(
        outcome.history.attempts()[0].generation.as_ref().unwrap().backend,
        "fake-cloud"
    );
    assert_eq!(core.selector().active_kind().await, Some(BackendKind::Cloud));
    assert!(local.generation_prompts().is_empty());
}

#[tokio::test]
async fn test_auto_without_fallback_never_touches_cloud() {
    let local = FakeBackend::new(BackendKind::Local).loads(&[false]).into_arc();
    let cloud = FakeBackend::new(BackendKind::Cloud).into_arc();
    let core = core(
        selector_config(SelectionMode::Auto, false),
        Some(local.clone()),
        Some(cloud.clone()),
    );

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::NoBackendAvailable));
    assert_eq!(outcome.attempts(), 0);
    assert_eq!(cloud.load_calls.load(Ordering::SeqCst), 0);
    assert!(outcome.detail.unwrap().contains("local"));
}

#[tokio::test]
async fn test_unavailable_backend_fails_over_next_attempt() {
    let local = FakeBackend::new(BackendKind::Local)
        .loads(&[true, false])
        .replies(vec![Reply::Fail(BackendError::Unavailable("gone".into()))])
        .into_arc();
    let cloud = FakeBackend::new(BackendKind::Cloud)
        .replies(vec![text(&chars(110))])
        .into_arc();
    let core = core(
        selector_config(SelectionMode::Auto, true),
        Some(local.clone()),
        Some(cloud.clone()),
    );

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    assert_eq!(outcome.attempts(), 2);
    assert!(matches!(
        outcome.history.attempts()[0].failure,
        Some(AttemptFailure::BackendUnavailable { .. })
    ));
    assert_eq!(
        outcome.history.attempts()[1].generation.as_ref().unwrap().backend,
        "fake-cloud"
    );
}

#[tokio::test]
async fn test_generation_error_is_retried() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![
            Reply::Fail(BackendError::generation("model crashed")),
            text(&chars(100)),
        ])
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    let prompts = backend.generation_prompts();
    assert!(prompts[1].contains("Attempt 1 failed"));
    assert!(prompts[1].contains("model crashed"));
}

#[tokio::test]
async fn test_healthcare_scenario() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&chars(8)), text(&chars(120))])
        .scoring(0.8)
        .into_arc();
    let core = local_core(backend.clone());
    let agent = article_agent();

    let outcome = core.execute(&agent, &json!("AI in healthcare")).await;
    assert_eq!(outcome.status, ExecutionStatus::Accepted);
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(outcome.output.as_ref().map(|o| o.len()), Some(120));

    let usage = outcome.history.usage();
    assert_eq!(usage.generation_calls, 2);
    assert_eq!(usage.evaluation_calls, 1);

    let empty = core.execute(&agent, &json!("")).await;
    assert_eq!(empty.failure_kind(), Some(FailureKind::InputConstraintViolation));
    assert_eq!(empty.attempts(), 0);
}

#[tokio::test]
async fn test_unparseable_judgments_are_retryable() {
    let calls = AtomicUsize::new(0);
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&chars(100)), text(&chars(101))])
        .judge(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                "I think it is quite good".to_string()
            } else {
                r#"{"score": 0.85}"#.to_string()
            }
        })
        .into_arc();
    let core = local_core(backend.clone());

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    let first = outcome.history.attempts()[0].verdict.clone().unwrap();
    assert!(!first.records[0].parsed);
    assert_eq!(first.records[0].score, 0.0);
    assert_eq!(backend.judge_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_consumes_an_attempt() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![Reply::Hang, text(&chars(100))])
        .into_arc();
    let core = local_core(backend);

    let outcome = core.execute(&article_agent(), &json!("AI in healthcare")).await;

    assert!(outcome.is_accepted());
    assert_eq!(outcome.attempts(), 2);
    assert_eq!(
        outcome.history.attempts()[0].failure,
        Some(AttemptFailure::Timeout { after_ms: 5000 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_in_flight_attempt() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![Reply::Hang])
        .into_arc();
    let core = local_core(backend);
    let agent = article_agent();
    let cancel = CancelHandle::new();

    let input = json!("AI in healthcare");
    let (outcome, _) = tokio::join!(core.execute_with_cancel(&agent, &input, &cancel), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    assert_eq!(outcome.failure_kind(), Some(FailureKind::Cancelled));
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(
        outcome.history.attempts()[0].failure,
        Some(AttemptFailure::Cancelled)
    );
}

#[tokio::test]
async fn test_outcome_serializes_as_audit_trail() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text("short"), text(&chars(100))])
        .into_arc();
    let outcome = local_core(backend)
        .execute(&article_agent(), &json!("AI in healthcare"))
        .await;

    let json: serde_json::Value = serde_json::from_str(&outcome.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["status"], "accepted");
    let attempts = json["history"]["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["failure"]["cause"], "output_constraint_violation");
    assert!(attempts[0]["prompt_summary"].as_str().unwrap().len() <= 83);
    assert!(attempts[1]["verdict"]["accepted"].as_bool().unwrap());
}

#[tokio::test]
async fn test_parallel_executions_keep_separate_histories() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&chars(100)), text(&chars(100))])
        .into_arc();
    let core = Arc::new(local_core(backend));
    let agent = article_agent();

    let input_a = json!("topic a");
    let input_b = json!("topic b");
    let (a, b) = tokio::join!(
        core.execute(&agent, &input_a),
        core.execute(&agent, &input_b)
    );
    assert!(a.is_accepted() && b.is_accepted());
    assert_eq!(a.attempts(), 1);
    assert_eq!(b.attempts(), 1);
    assert!(a.history.attempts()[0].prompt.contains("topic a"));
    assert!(b.history.attempts()[0].prompt.contains("topic b"));
}

#[tokio::test]
async fn test_agent_stats_accumulate_across_executions() {
    let backend = FakeBackend::new(BackendKind::Local)
        .replies(vec![text(&chars(8)), text(&chars(120)), text(&chars(130))])
        .scoring(0.9)
        .into_arc();
    let core = local_core(backend);
    let agent = article_agent();
    assert!(core.agent_stats("healthcare-writer").is_none());

    let first = core.execute(&agent, &json!("AI in healthcare")).await;
    assert!(first.is_accepted());
    let second = core.execute(&agent, &json!("AI in finance")).await;
    assert!(second.is_accepted());
    let rejected = core.execute(&agent, &json!("")).await;
    assert!(!rejected.is_accepted());

    let stats = core.agent_stats("healthcare-writer").unwrap();
    assert_eq!(stats.total_executions, 3);
    assert_eq!(stats.successful_executions, 2);
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.scored_executions, 2);
    assert!((stats.average_score - 0.9).abs() < 1e-9);
    assert_eq!(stats.failures.get("input_constraint_violation").copied(), Some(1));
    // Three generations at 140 tokens and two judge calls at 70
    assert_eq!(stats.total_tokens, 3 * 140 + 2 * 70);
    assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(core.stats().snapshot().len(), 1);
}
