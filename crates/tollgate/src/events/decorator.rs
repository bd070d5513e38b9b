use std::sync::Arc;

use common::models::{Event, RouteConfig};
use llmcost::selector::{select_str, select_text};
use llmcost::stream::{anthropic_complete_stream, openai_chat_stream, selected_stream_content};
use llmcost::{
    AnthropicEstimator, AzureEstimator, CostError, CostEstimator, OpenAiEstimator, TokenCounter,
};
use serde_json::Value;
use tracing::warn;

use super::{EventWithRequestAndContent, UsageKind};

/// Token and cost estimation for captured exchanges.
#[derive(Clone)]
pub struct Decorator {
    counter: Arc<TokenCounter>,
    openai: OpenAiEstimator,
    azure: AzureEstimator,
    anthropic: AnthropicEstimator,
}

/// Token counts stand on their own; only the price can be missing.
#[derive(Debug)]
struct Usage {
    model: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    cost_in_usd: Result<f64, CostError>,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            model: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_in_usd: Ok(0.0),
        }
    }
}

impl Decorator {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self {
            openai: OpenAiEstimator::new(Arc::clone(&counter)),
            azure: AzureEstimator::new(Arc::clone(&counter)),
            anthropic: AnthropicEstimator::new(Arc::clone(&counter)),
            counter,
        }
    }

    /// The event of `content` with tokens, cost and model filled in.
    pub fn decorate(&self, content: &EventWithRequestAndContent) -> Event {
        let mut event = content.event.clone();
        let request = parse_json(&content.request_body);
        let response = if content.streamed {
            Value::Null
        } else {
            parse_json(&content.response_body)
        };

        let usage = match &content.usage {
            UsageKind::OpenAiChat => self.chat(&self.openai, content, &request, &response),
            UsageKind::AzureChat => self.chat(&self.azure, content, &request, &response),
            UsageKind::OpenAiEmbeddings => self.embeddings(&self.openai, &request, &response),
            UsageKind::AzureEmbeddings => self.embeddings(&self.azure, &request, &response),
            UsageKind::OpenAiSpeech => self.speech(&request),
            UsageKind::AnthropicComplete => self.anthropic(content, &request, &response),
            UsageKind::Custom(config) => self.custom(config, content, &request, &response),
            UsageKind::Opaque => Usage::default(),
        };

        if let Some(model) = usage.model.filter(|m| !m.is_empty()) {
            event.model = model;
        }
        event.prompt_token_count = usage.prompt_tokens;
        event.completion_token_count = usage.completion_tokens;
        match usage.cost_in_usd {
            Ok(cost) => event.cost_in_usd = cost,
            Err(e) => {
                event.cost_in_usd = 0.0;
                metrics::counter!("decorator.unpriced").increment(1);
                warn!(event_id = %event.id, model = %event.model, error = %e, "could not price request");
            }
        }
        if content.truncated {
            // completion tokens only cover the captured prefix
            metrics::counter!("decorator.truncated_captures").increment(1);
            warn!(
                event_id = %event.id,
                captured = content.response_body.len(),
                completion_tokens = event.completion_token_count,
                "priced a truncated stream capture"
            );
        }
        event
    }

    /// Cost of the prompt alone, known before dispatch. Unpriced models and
    /// unreadable bodies estimate to zero so they are never refused on cost.
    pub fn estimate_prompt_cost(&self, usage: &UsageKind, request_body: &[u8]) -> f64 {
        let request = parse_json(request_body);
        let model = select_str(&request, "model").unwrap_or_default();
        let cost = match usage {
            UsageKind::OpenAiChat => self
                .openai
                .estimate_prompt_cost(model, self.openai.prompt_tokens(model, &request)),
            UsageKind::AzureChat => self
                .azure
                .estimate_prompt_cost(model, self.azure.prompt_tokens(model, &request)),
            UsageKind::OpenAiEmbeddings => self
                .openai
                .estimate_embeddings_input_cost(model, self.counter.count_input(&request["input"])),
            UsageKind::AzureEmbeddings => self
                .azure
                .estimate_embeddings_input_cost(model, self.counter.count_input(&request["input"])),
            UsageKind::OpenAiSpeech => self
                .openai
                .estimate_speech_cost(model, select_str(&request, "input").unwrap_or_default()),
            UsageKind::AnthropicComplete => self.anthropic.estimate_prompt_cost(
                model,
                self.anthropic
                    .count_prompt_tokens(select_str(&request, "prompt").unwrap_or_default()),
            ),
            UsageKind::Custom(_) | UsageKind::Opaque => Ok(0.0),
        };
        cost.unwrap_or(0.0)
    }

    fn chat<E: ChatEstimator>(
        &self,
        estimator: &E,
        content: &EventWithRequestAndContent,
        request: &Value,
        response: &Value,
    ) -> Usage {
        let request_model = select_str(request, "model").map(str::to_string);

        if content.streamed {
            let (streamed, stream_model) = openai_chat_stream(&content.response_body);
            let model = stream_model
                .or(request_model)
                .unwrap_or_else(|| content.event.model.clone());
            let prompt_tokens = estimator.prompt_tokens(&model, request);
            let completion_tokens = estimator.stream_completion_tokens(&streamed);
            return Usage {
                cost_in_usd: estimator.estimate_total_cost(&model, prompt_tokens, completion_tokens),
                model: Some(model),
                prompt_tokens,
                completion_tokens,
            };
        }

        let model = select_str(response, "model")
            .map(str::to_string)
            .or(request_model)
            .unwrap_or_else(|| content.event.model.clone());
        let (prompt_tokens, completion_tokens) = match response_usage(response) {
            Some(usage) => usage,
            None => {
                let completion = select_text(response, "choices.#.message.content");
                (
                    estimator.prompt_tokens(&model, request),
                    self.counter.count(&completion),
                )
            }
        };
        Usage {
            cost_in_usd: estimator.estimate_total_cost(&model, prompt_tokens, completion_tokens),
            model: Some(model),
            prompt_tokens,
            completion_tokens,
        }
    }

    fn embeddings<E: CostEstimator>(
        &self,
        estimator: &E,
        request: &Value,
        response: &Value,
    ) -> Usage {
        let model = select_str(response, "model")
            .or_else(|| select_str(request, "model"))
            .unwrap_or_default()
            .to_string();
        let tokens = response
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| self.counter.count_input(&request["input"]));
        Usage {
            cost_in_usd: estimator.estimate_embeddings_input_cost(&model, tokens),
            model: Some(model),
            prompt_tokens: tokens,
            completion_tokens: 0,
        }
    }

    fn speech(&self, request: &Value) -> Usage {
        let model = select_str(request, "model").unwrap_or_default().to_string();
        let input = select_str(request, "input").unwrap_or_default();
        Usage {
            cost_in_usd: self.openai.estimate_speech_cost(&model, input),
            model: Some(model),
            ..Default::default()
        }
    }

    fn anthropic(
        &self,
        content: &EventWithRequestAndContent,
        request: &Value,
        response: &Value,
    ) -> Usage {
        let (completion, stream_model) = if content.streamed {
            anthropic_complete_stream(&content.response_body)
        } else {
            (
                select_str(response, "completion").unwrap_or_default().to_string(),
                select_str(response, "model").map(str::to_string),
            )
        };
        let model = stream_model
            .or_else(|| select_str(request, "model").map(str::to_string))
            .unwrap_or_else(|| content.event.model.clone());
        let prompt_tokens = self
            .anthropic
            .count_prompt_tokens(select_str(request, "prompt").unwrap_or_default());
        let completion_tokens = self.anthropic.count_completion_tokens(&completion);
        Usage {
            cost_in_usd: self
                .anthropic
                .estimate_total_cost(&model, prompt_tokens, completion_tokens),
            model: Some(model),
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Custom providers have no price table; only tokens are counted.
    fn custom(
        &self,
        config: &RouteConfig,
        content: &EventWithRequestAndContent,
        request: &Value,
        response: &Value,
    ) -> Usage {
        let count_at = |value: &Value, location: Option<&String>| {
            location.map_or(0, |loc| self.counter.count(&select_text(value, loc)))
        };

        let completion_tokens = if content.streamed {
            config
                .stream_response_completion_location
                .as_ref()
                .map_or(0, |loc| {
                    self.counter
                        .count(&selected_stream_content(&content.response_body, loc))
                })
        } else {
            count_at(response, config.response_completion_location.as_ref())
        };

        Usage {
            model: config
                .model_location
                .as_ref()
                .and_then(|loc| select_str(request, loc))
                .map(str::to_string),
            prompt_tokens: count_at(request, config.request_prompt_location.as_ref()),
            completion_tokens,
            cost_in_usd: Ok(0.0),
        }
    }
}

/// The chat-specific half of the OpenAI-shaped estimators.
trait ChatEstimator: CostEstimator {
    fn prompt_tokens(&self, model: &str, request: &Value) -> i64;
    fn stream_completion_tokens(&self, streamed: &str) -> i64;
}

impl ChatEstimator for OpenAiEstimator {
    fn prompt_tokens(&self, model: &str, request: &Value) -> i64 {
        self.estimate_chat_completion_prompt_token_counts(model, request)
    }
    fn stream_completion_tokens(&self, streamed: &str) -> i64 {
        self.estimate_chat_completion_stream_token_counts(streamed)
    }
}

impl ChatEstimator for AzureEstimator {
    fn prompt_tokens(&self, model: &str, request: &Value) -> i64 {
        self.estimate_chat_completion_prompt_token_counts(model, request)
    }
    fn stream_completion_tokens(&self, streamed: &str) -> i64 {
        self.estimate_chat_completion_stream_token_counts(streamed)
    }
}

fn parse_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

fn response_usage(response: &Value) -> Option<(i64, i64)> {
    let usage = response.get("usage")?;
    Some((
        usage.get("prompt_tokens")?.as_i64()?,
        usage
            .get("completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    ))
}
