use std::sync::Arc;

use serde_json::Value;

use crate::pricing::{self, ModelPrice};
use crate::tokens::TokenCounter;
use crate::CostError;

/// Billed tokens Anthropic adds around every prompt and completion.
const ANTHROPIC_PROMPT_OFFSET: i64 = 1;
const ANTHROPIC_COMPLETION_OFFSET: i64 = 4;

/// Converts token counts into USD for one provider family.
pub trait CostEstimator {
    fn model_price(&self, model: &str) -> Result<ModelPrice, CostError>;

    fn embeddings_price(&self, model: &str) -> Result<f64, CostError> {
        Err(CostError::UnknownModel(model.to_string()))
    }

    fn estimate_prompt_cost(&self, model: &str, tokens: i64) -> Result<f64, CostError> {
        Ok(self.model_price(model)?.prompt * tokens as f64 / 1000.0)
    }

    fn estimate_completion_cost(&self, model: &str, tokens: i64) -> Result<f64, CostError> {
        Ok(self.model_price(model)?.completion * tokens as f64 / 1000.0)
    }

    fn estimate_total_cost(
        &self,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Result<f64, CostError> {
        Ok(self.estimate_prompt_cost(model, prompt_tokens)?
            + self.estimate_completion_cost(model, completion_tokens)?)
    }

    fn estimate_embeddings_input_cost(&self, model: &str, tokens: i64) -> Result<f64, CostError> {
        Ok(self.embeddings_price(model)? * tokens as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenAiEstimator {
    counter: Arc<TokenCounter>,
}

impl OpenAiEstimator {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn estimate_chat_completion_prompt_token_counts(&self, model: &str, request: &Value) -> i64 {
        self.counter.count_chat_prompt(model, request)
    }

    /// Completion tokens for content captured from a stream.
    pub fn estimate_chat_completion_stream_token_counts(&self, streamed_content: &str) -> i64 {
        self.counter.count(streamed_content)
    }

    /// Speech is billed per input character.
    pub fn estimate_speech_cost(&self, model: &str, input: &str) -> Result<f64, CostError> {
        let per_1k = pricing::lookup(pricing::OPENAI_SPEECH_PER_1K_CHARS, model)
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))?;
        Ok(per_1k * input.chars().count() as f64 / 1000.0)
    }
}

impl CostEstimator for OpenAiEstimator {
    fn model_price(&self, model: &str) -> Result<ModelPrice, CostError> {
        pricing::lookup(pricing::OPENAI_CHAT, model)
            .copied()
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }

    fn embeddings_price(&self, model: &str) -> Result<f64, CostError> {
        pricing::lookup(pricing::OPENAI_EMBEDDINGS, model)
            .copied()
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Azure OpenAI
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AzureEstimator {
    counter: Arc<TokenCounter>,
}

impl AzureEstimator {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn estimate_chat_completion_prompt_token_counts(&self, model: &str, request: &Value) -> i64 {
        self.counter.count_chat_prompt(model, request)
    }

    pub fn estimate_chat_completion_stream_token_counts(&self, streamed_content: &str) -> i64 {
        self.counter.count(streamed_content)
    }
}

impl CostEstimator for AzureEstimator {
    fn model_price(&self, model: &str) -> Result<ModelPrice, CostError> {
        pricing::lookup(pricing::AZURE_CHAT, model)
            .copied()
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }

    fn embeddings_price(&self, model: &str) -> Result<f64, CostError> {
        pricing::lookup(pricing::AZURE_EMBEDDINGS, model)
            .copied()
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AnthropicEstimator {
    counter: Arc<TokenCounter>,
}

impl AnthropicEstimator {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn count_prompt_tokens(&self, prompt: &str) -> i64 {
        self.counter.count(prompt) + ANTHROPIC_PROMPT_OFFSET
    }

    pub fn count_completion_tokens(&self, completion: &str) -> i64 {
        self.counter.count(completion) + ANTHROPIC_COMPLETION_OFFSET
    }
}

impl CostEstimator for AnthropicEstimator {
    fn model_price(&self, model: &str) -> Result<ModelPrice, CostError> {
        pricing::lookup(pricing::ANTHROPIC, model)
            .copied()
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }
}
