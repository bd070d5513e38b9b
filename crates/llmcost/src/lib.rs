//! Token counting and USD cost estimation for LLM provider traffic.

pub mod estimator;
pub mod pricing;
pub mod selector;
pub mod stream;
pub mod tokens;

pub use estimator::{AnthropicEstimator, AzureEstimator, CostEstimator, OpenAiEstimator};
pub use tokens::TokenCounter;

#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("no price known for model '{0}'")]
    UnknownModel(String),
    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),
}
