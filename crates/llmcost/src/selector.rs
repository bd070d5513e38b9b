//! Dot-path selectors over JSON documents, as used by custom provider
//! route configs: `choices.0.message.content`, `messages.#.content`.
//!
//! A numeric segment indexes an array, `#` fans out over every element.

use serde_json::Value;

pub fn select<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let path = path.trim().trim_start_matches("$.");
    if path.is_empty() {
        return vec![value];
    }

    let mut current = vec![value];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for node in current {
            match (segment, node) {
                ("#", Value::Array(items)) => next.extend(items.iter()),
                (_, Value::Array(items)) => {
                    if let Some(item) = segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        next.push(item);
                    }
                }
                (_, Value::Object(map)) => {
                    if let Some(child) = map.get(segment) {
                        next.push(child);
                    }
                }
                _ => {}
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

/// All string leaves reached by `path`, concatenated in document order.
pub fn select_text(value: &Value, path: &str) -> String {
    let mut out = String::new();
    for node in select(value, path) {
        collect_text(node, &mut out);
    }
    out
}

pub fn select_bool(value: &Value, path: &str) -> Option<bool> {
    select(value, path).first().and_then(|v| v.as_bool())
}

pub fn select_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    select(value, path).into_iter().find_map(Value::as_str)
}

fn collect_text(node: &Value, out: &mut String) {
    match node {
        Value::String(s) => out.push_str(s),
        Value::Array(items) => items.iter().for_each(|item| collect_text(item, out)),
        _ => {}
    }
}
