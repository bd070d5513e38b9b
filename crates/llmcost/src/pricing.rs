//! Static price tables in USD per 1K tokens (or per 1K characters for speech).

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

const fn price(prompt: f64, completion: f64) -> ModelPrice {
    ModelPrice { prompt, completion }
}

pub const OPENAI_CHAT: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", price(0.000_15, 0.000_6)),
    ("gpt-4o", price(0.005, 0.015)),
    ("gpt-4-turbo", price(0.01, 0.03)),
    ("gpt-4-1106-preview", price(0.01, 0.03)),
    ("gpt-4-0125-preview", price(0.01, 0.03)),
    ("gpt-4-vision-preview", price(0.01, 0.03)),
    ("gpt-4-32k", price(0.06, 0.12)),
    ("gpt-4", price(0.03, 0.06)),
    ("gpt-3.5-turbo-0125", price(0.000_5, 0.001_5)),
    ("gpt-3.5-turbo-1106", price(0.001, 0.002)),
    ("gpt-3.5-turbo-instruct", price(0.001_5, 0.002)),
    ("gpt-3.5-turbo-16k", price(0.003, 0.004)),
    ("gpt-3.5-turbo", price(0.001_5, 0.002)),
];

pub const OPENAI_EMBEDDINGS: &[(&str, f64)] = &[
    ("text-embedding-3-small", 0.000_02),
    ("text-embedding-3-large", 0.000_13),
    ("text-embedding-ada-002", 0.000_1),
];

pub const OPENAI_SPEECH_PER_1K_CHARS: &[(&str, f64)] = &[("tts-1-hd", 0.03), ("tts-1", 0.015)];

pub const ANTHROPIC: &[(&str, ModelPrice)] = &[
    ("claude-3-opus", price(0.015, 0.075)),
    ("claude-3-sonnet", price(0.003, 0.015)),
    ("claude-3-haiku", price(0.000_25, 0.001_25)),
    ("claude-2", price(0.008, 0.024)),
    ("claude-instant", price(0.000_8, 0.002_4)),
];

pub const AZURE_CHAT: &[(&str, ModelPrice)] = &[
    ("gpt-4o", price(0.005, 0.015)),
    ("gpt-4-turbo", price(0.01, 0.03)),
    ("gpt-4-32k", price(0.06, 0.12)),
    ("gpt-4", price(0.03, 0.06)),
    ("gpt-35-turbo-16k", price(0.003, 0.004)),
    ("gpt-35-turbo", price(0.001_5, 0.002)),
];

pub const AZURE_EMBEDDINGS: &[(&str, f64)] = &[("text-embedding-ada-002", 0.000_1)];

/// Exact match first, then the longest table entry the model name starts
/// with, so dated snapshots such as `gpt-4-0613` price like `gpt-4`.
pub fn lookup<'a, T>(table: &'a [(&str, T)], model: &str) -> Option<&'a T> {
    let model = model.to_lowercase();
    if let Some((_, v)) = table.iter().find(|(name, _)| *name == model) {
        return Some(v);
    }
    table
        .iter()
        .filter(|(name, _)| model.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, v)| v)
}
