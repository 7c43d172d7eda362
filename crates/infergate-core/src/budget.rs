use infergate_contracts::ChatMessage;
use tracing::info;

use crate::error::CoreError;

pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;
pub const DEFAULT_CONTEXT_WINDOW: u64 = 129_000;
const PER_MESSAGE_OVERHEAD: f64 = 4.0;

/// Replaces non-positive or non-finite ratios with the default.
pub fn normalize_chars_per_token(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { DEFAULT_CHARS_PER_TOKEN }
}

/// Character-count heuristic: `ceil(chars / chars_per_token + 4 * messages)`.
pub fn estimate_prompt_tokens(messages: &[ChatMessage], chars_per_token: f64) -> u64 {
    if messages.is_empty() {
        return 0;
    }
    let chars_per_token = normalize_chars_per_token(chars_per_token);
    let total_chars: usize = messages.iter().map(|message| message.content.chars().count()).sum();
    let estimate =
        total_chars as f64 / chars_per_token + PER_MESSAGE_OVERHEAD * messages.len() as f64;
    estimate.ceil().max(0.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetDecision {
    pub estimated: u64,
    pub max_tokens: u32,
    pub capped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    pub context_window: u64,
    pub chars_per_token: f64,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self { context_window: DEFAULT_CONTEXT_WINDOW, chars_per_token: DEFAULT_CHARS_PER_TOKEN }
    }
}

impl TokenBudget {
    pub fn new(context_window: u64, chars_per_token: f64) -> Self {
        Self { context_window, chars_per_token: normalize_chars_per_token(chars_per_token) }
    }

    /// Fails when the prompt alone leaves no room; otherwise caps the
    /// requested completion length to what remains.
    pub fn apply(&self, messages: &[ChatMessage], requested: u32) -> Result<BudgetDecision, CoreError> {
        let estimated = estimate_prompt_tokens(messages, self.chars_per_token);
        info!(
            event = "request.prompt.estimated",
            estimated,
            chars_per_token = self.chars_per_token,
            max_model_len = self.context_window,
            "estimated prompt tokens"
        );

        let available = i128::from(self.context_window) - i128::from(estimated);
        if available < 1 {
            return Err(CoreError::PromptTooLarge { estimated, limit: self.context_window });
        }

        let available = u32::try_from(available).unwrap_or(u32::MAX);
        if requested > available {
            let max_tokens = available.max(1);
            info!(
                event = "request.max_tokens.capped",
                from = requested,
                to = max_tokens,
                estimated,
                max_model_len = self.context_window,
                "capped max_tokens to fit the context window"
            );
            return Ok(BudgetDecision { estimated, max_tokens, capped: true });
        }

        Ok(BudgetDecision { estimated, max_tokens: requested, capped: false })
    }
}
