use serde_json::Value;
use tiktoken_rs::CoreBPE;

use crate::CostError;

/// BPE token counter over the cl100k vocabulary.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    pub fn new() -> Result<Self, CostError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| CostError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }

    pub fn count(&self, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len() as i64
    }

    /// Prompt tokens of an OpenAI-style chat request, following the
    /// per-message framing the chat endpoints bill for.
    pub fn count_chat_prompt(&self, model: &str, request: &Value) -> i64 {
        let Some(messages) = request.get("messages").and_then(Value::as_array) else {
            return 0;
        };
        let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5-turbo-0301") {
            (4i64, -1i64)
        } else {
            (3i64, 1i64)
        };

        let mut total: i64 = 0;
        for message in messages {
            total += tokens_per_message;
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                total += self.count(role);
            }
            if let Some(content) = message.get("content") {
                total += self.count_content(content);
            }
            if let Some(name) = message.get("name").and_then(Value::as_str) {
                total += self.count(name) + tokens_per_name;
            }
        }
        // every reply is primed with <|start|>assistant<|message|>
        (total + 3).max(0)
    }

    /// Tokens of an `input` field that may be a string or a list of strings.
    pub fn count_input(&self, input: &Value) -> i64 {
        match input {
            Value::String(text) => self.count(text),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| self.count(s))
                .sum(),
            _ => 0,
        }
    }

    fn count_content(&self, content: &Value) -> i64 {
        match content {
            Value::String(text) => self.count(text),
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(|text| self.count(text))
                .sum(),
            _ => 0,
        }
    }
}
