use axum::response::sse::Event;
use serde::Serialize;

use crate::normalize::ContentKind;

/// Discriminated union of the SSE frames the streaming endpoint emits, one
/// JSON object per `data:` line.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    MessageChunk {
        content_type: &'static str,
        text: String,
    },
    SummarizationSignal {
        signal: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary_length: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    },
    Done {
        status: String,
        response_id: String,
    },
}

impl StreamFrame {
    pub fn chunk(text: String, kind: ContentKind) -> Self {
        StreamFrame::MessageChunk {
            content_type: kind.as_str(),
            text,
        }
    }

    pub fn to_event(&self) -> Event {
        let data = serde_json::to_string(self).expect("stream frame serializes");
        Event::default().data(data)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("stream frame serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_serialize_with_type_discriminator() {
        let frame = StreamFrame::chunk("hello".into(), ContentKind::Text);
        assert_eq!(
            frame.to_json(),
            json!({"type": "message_chunk", "content_type": "text", "text": "hello"})
        );

        let frame = StreamFrame::SummarizationSignal {
            signal: "complete".into(),
            summary_length: Some(1200),
            error: None,
        };
        assert_eq!(
            frame.to_json(),
            json!({"type": "summarization_signal", "signal": "complete", "summary_length": 1200})
        );

        let frame = StreamFrame::Done {
            status: "completed".into(),
            response_id: "resp-1".into(),
        };
        assert_eq!(
            frame.to_json(),
            json!({"type": "done", "status": "completed", "response_id": "resp-1"})
        );
    }

    #[test]
    fn reasoning_chunks_carry_the_discriminator() {
        let frame = StreamFrame::chunk("thinking...".into(), ContentKind::Reasoning);
        assert_eq!(frame.to_json()["content_type"], json!("reasoning"));
    }
}
