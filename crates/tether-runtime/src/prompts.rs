//! Prompts for the criterion judge.
//!
//! The judge sees one criterion and one candidate output per call. The
//! system prompt is shared across criteria; the user prompt carries the
//! criterion and the output.

use tether_core::Criterion;

/// System prompt shared by every judge call.
pub const JUDGE_SYSTEM_PROMPT: &str = r#"
You are a quality evaluator for generated text.

You score ONE output against ONE criterion.
You do not rewrite the output.
You do not invent requirements beyond the criterion.

## Scoring
- 1.0: the criterion is fully met
- 0.7 - 0.9: met with minor gaps
- 0.4 - 0.6: partially met
- 0.0 - 0.3: not met

## Output Format (JSON only)
{
  "score": 0.0-1.0,
  "feedback": "one or two sentences on how the output meets or misses the criterion",
  "suggestions": ["concrete change that would raise the score"]
}
"#;

/// Appended when the first judgment could not be parsed.
pub const STRICT_FORMAT_REMINDER: &str = r#"
## Format Reminder
Your previous answer could not be parsed.
Reply with a single JSON object and nothing else: no prose, no markdown fences.
"score" must be a number between 0 and 1.
"#;

/// User prompt for judging `output` against `criterion`.
pub fn judge_prompt(criterion: &Criterion, output: &str) -> String {
    format!(
        "## Criterion: {}\n{}\n\nMinimum acceptable score: {:.2}\n\n## Output to evaluate\n<<<\n{}\n>>>\n\nReturn the JSON evaluation.",
        criterion.name(),
        criterion.description(),
        criterion.min_score(),
        output
    )
}

/// Judge prompt for the single re-ask after an unparseable answer.
pub fn strict_judge_prompt(criterion: &Criterion, output: &str) -> String {
    format!("{}\n{}", judge_prompt(criterion, output), STRICT_FORMAT_REMINDER)
}
