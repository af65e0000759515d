//! Token usage accounting.

use serde::{Deserialize, Serialize};

/// Token usage from one backend call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Accumulated LLM usage across the calls of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Total tokens used
    pub total_tokens: u64,

    /// Prompt/input tokens
    pub prompt_tokens: u64,

    /// Completion/output tokens
    pub completion_tokens: u64,

    /// Generation calls
    pub generation_calls: u32,

    /// Judge calls made by the criterion evaluator
    pub evaluation_calls: u32,
}

impl LlmUsage {
    /// Add usage from a generation call.
    pub fn add_generation(&mut self, usage: &TokenUsage) {
        self.add_tokens(usage);
        self.generation_calls += 1;
    }

    /// Add usage from a judge call.
    pub fn add_evaluation(&mut self, usage: &TokenUsage) {
        self.add_tokens(usage);
        self.evaluation_calls += 1;
    }

    /// Fold another usage record into this one.
    pub fn merge(&mut self, other: &LlmUsage) {
        self.total_tokens += other.total_tokens;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.generation_calls += other.generation_calls;
        self.evaluation_calls += other.evaluation_calls;
    }

    /// Total backend calls.
    pub fn calls(&self) -> u32 {
        self.generation_calls + self.evaluation_calls
    }

    fn add_tokens(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn test_llm_usage_accumulates() {
        let mut usage = LlmUsage::default();
        usage.add_generation(&TokenUsage::new(30, 20));
        usage.add_evaluation(&TokenUsage::new(10, 5));

        assert_eq!(usage.total_tokens, 65);
        assert_eq!(usage.prompt_tokens, 40);
        assert_eq!(usage.completion_tokens, 25);
        assert_eq!(usage.calls(), 2);

        let mut total = LlmUsage::default();
        total.merge(&usage);
        total.merge(&usage);
        assert_eq!(total.total_tokens, 130);
        assert_eq!(total.evaluation_calls, 2);
    }
}
