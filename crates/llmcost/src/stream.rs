//! Extracts generated text from captured server-sent-event bodies.

use serde_json::Value;

use crate::selector;

/// `data:` payloads of an SSE body in arrival order. The `[DONE]` sentinel
/// and blank payloads are skipped.
pub fn sse_data(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
        .map(str::to_string)
        .collect()
}

/// Streamed content of an OpenAI chat completion and the model that
/// produced it.
pub fn openai_chat_stream(body: &[u8]) -> (String, Option<String>) {
    let mut content = String::new();
    let mut model = None;
    for chunk in sse_data(body) {
        let Ok(value) = serde_json::from_str::<Value>(&chunk) else {
            log::debug!("skipping undecodable stream chunk");
            continue;
        };
        if model.is_none() {
            model = value.get("model").and_then(Value::as_str).map(str::to_string);
        }
        content.push_str(&selector::select_text(&value, "choices.#.delta.content"));
    }
    (content, model)
}

/// Streamed content of an Anthropic text completion.
pub fn anthropic_complete_stream(body: &[u8]) -> (String, Option<String>) {
    let mut content = String::new();
    let mut model = None;
    for chunk in sse_data(body) {
        let Ok(value) = serde_json::from_str::<Value>(&chunk) else {
            continue;
        };
        if model.is_none() {
            model = value.get("model").and_then(Value::as_str).map(str::to_string);
        }
        if let Some(text) = value.get("completion").and_then(Value::as_str) {
            content.push_str(text);
        }
    }
    (content, model)
}

/// Streamed content pulled from each chunk with a custom selector.
pub fn selected_stream_content(body: &[u8], location: &str) -> String {
    sse_data(body)
        .iter()
        .filter_map(|chunk| serde_json::from_str::<Value>(chunk).ok())
        .map(|value| selector::select_text(&value, location))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_openai_chat_stream() {
        let body = b"data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
data: [DONE]\n\n";
        let (content, model) = openai_chat_stream(body);
        assert_eq!(content, "Hello");
        assert_eq!(model.as_deref(), Some("gpt-4"));
    }

    #[test]
    fn test_anthropic_stream() {
        let body = b"event: completion\ndata: {\"completion\":\" Hi\",\"model\":\"claude-2\"}\n\n\
event: completion\ndata: {\"completion\":\" there\",\"stop_reason\":\"stop_sequence\",\"model\":\"claude-2\"}\n\n";
        let (content, model) = anthropic_complete_stream(body);
        assert_eq!(content, " Hi there");
        assert_eq!(model.as_deref(), Some("claude-2"));
    }

    #[test]
    fn test_selected_stream_content() {
        let body = b"data: {\"out\":{\"text\":\"a\"}}\n\ndata: {\"out\":{\"text\":\"b\"}}\n\ndata: [DONE]\n";
        assert_eq!(selected_stream_content(body, "out.text"), "ab");
        assert!(sse_data(b"event: ping\n\n").is_empty());
    }
}
