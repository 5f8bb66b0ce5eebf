use serde_json::Value;

/// Discriminates normal text from model reasoning in streamed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Reasoning,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Reasoning => "reasoning",
        }
    }
}

/// Normalize raw LLM content into `(text, kind)`.
///
/// Shared by the streaming layer and the summarization middleware so content
/// is never counted twice and reasoning status signals never leak as chunks.
///
/// Accepts plain strings, provider thinking/reasoning blocks, `{text: ...}`
/// wrappers and lists of any of those. Returns `(None, None)` for
/// metadata-only payloads and for reasoning status signals.
pub fn normalize(content: &Value) -> (Option<String>, Option<ContentKind>) {
    if is_reasoning_status_signal(content) {
        return (None, None);
    }

    match content {
        Value::String(s) => non_empty(s, ContentKind::Text),
        Value::Object(_) => normalize_object(content),
        Value::Array(items) => {
            let mut text = String::new();
            let mut saw_reasoning = false;
            for item in items {
                if is_reasoning_status_signal(item) {
                    continue;
                }
                let (piece, kind) = match item {
                    Value::String(s) => non_empty(s, ContentKind::Text),
                    Value::Object(_) => normalize_object(item),
                    _ => (None, None),
                };
                if let Some(piece) = piece {
                    text.push_str(&piece);
                }
                if kind == Some(ContentKind::Reasoning) {
                    saw_reasoning = true;
                }
            }
            if text.is_empty() {
                (None, None)
            } else if saw_reasoning {
                // Reasoning anywhere in the list flips the whole chunk.
                (Some(text), Some(ContentKind::Reasoning))
            } else {
                (Some(text), Some(ContentKind::Text))
            }
        }
        _ => (None, None),
    }
}

fn normalize_object(content: &Value) -> (Option<String>, Option<ContentKind>) {
    match content.get("type").and_then(Value::as_str) {
        Some("thinking") => {
            let thinking = content
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default();
            non_empty(thinking, ContentKind::Reasoning)
        }
        Some("reasoning") => {
            let Some(summary) = content.get("summary").and_then(Value::as_array) else {
                return (None, None);
            };
            let mut text = String::new();
            for part in summary {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            non_empty(&text, ContentKind::Reasoning)
        }
        _ => {
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                non_empty(text, ContentKind::Text)
            } else {
                (None, None)
            }
        }
    }
}

/// A reasoning block carrying only a lifecycle status and no summary is a
/// status signal, not content. Callers must not emit it as a chunk.
pub fn is_reasoning_status_signal(content: &Value) -> bool {
    let candidate = match content {
        Value::Object(_) => content,
        Value::Array(items) if items.len() == 1 => &items[0],
        _ => return false,
    };

    candidate.get("type").and_then(Value::as_str) == Some("reasoning")
        && candidate.get("status").is_some()
        && candidate.get("summary").is_none()
}

fn non_empty(text: &str, kind: ContentKind) -> (Option<String>, Option<ContentKind>) {
    if text.is_empty() {
        (None, None)
    } else {
        (Some(text.to_string()), Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_strings_are_text() {
        assert_eq!(
            normalize(&json!("Hello")),
            (Some("Hello".into()), Some(ContentKind::Text))
        );
        assert_eq!(normalize(&json!("")), (None, None));
    }

    #[test]
    fn thinking_blocks_are_reasoning() {
        let content = json!({"type": "thinking", "thinking": "analysis"});
        assert_eq!(
            normalize(&content),
            (Some("analysis".into()), Some(ContentKind::Reasoning))
        );
    }

    #[test]
    fn reasoning_summaries_concatenate() {
        let content = json!({
            "type": "reasoning",
            "summary": [{"text": "first "}, {"text": "second"}]
        });
        assert_eq!(
            normalize(&content),
            (Some("first second".into()), Some(ContentKind::Reasoning))
        );
    }

    #[test]
    fn reasoning_status_signals_are_suppressed() {
        let content = json!({"type": "reasoning", "status": "in_progress", "id": "rs_123"});
        assert_eq!(normalize(&content), (None, None));

        let completed = json!({"type": "reasoning", "status": "completed"});
        assert_eq!(normalize(&completed), (None, None));

        // The same signal wrapped in a single-item list.
        let wrapped = json!([{"type": "reasoning", "status": "in_progress"}]);
        assert_eq!(normalize(&wrapped), (None, None));
    }

    #[test]
    fn reasoning_with_summary_is_not_a_signal() {
        let content = json!({
            "type": "reasoning",
            "status": "completed",
            "summary": [{"text": "done thinking"}]
        });
        assert!(!is_reasoning_status_signal(&content));
    }

    #[test]
    fn text_wrapper_objects_are_text() {
        assert_eq!(
            normalize(&json!({"text": "wrapped"})),
            (Some("wrapped".into()), Some(ContentKind::Text))
        );
    }

    #[test]
    fn metadata_only_objects_yield_nothing() {
        assert_eq!(normalize(&json!({"result": "data"})), (None, None));
        assert_eq!(normalize(&json!({"index": 3})), (None, None));
    }

    #[test]
    fn reasoning_anywhere_in_a_list_flips_the_kind() {
        let content = json!([
            {"text": "prefix "},
            {"type": "thinking", "thinking": "hidden step"}
        ]);
        let (text, kind) = normalize(&content);
        assert_eq!(text.as_deref(), Some("prefix hidden step"));
        assert_eq!(kind, Some(ContentKind::Reasoning));
    }
}
