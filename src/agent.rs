use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::file_log::FileOperationLogger;
use crate::normalize;
use crate::session::Session;
use crate::state::{AgentState, Message};
use crate::usage::TokenUsage;

/// Events the agent graph emits while a turn runs. The turn pipeline is the
/// sole consumer and the sole SSE encoder.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Raw model content; the pipeline normalizes it before streaming.
    MessageChunk(Value),
    /// Context-summarization lifecycle: start, complete or error. Never
    /// rendered as an ordinary chunk.
    SummarizationSignal {
        signal: String,
        summary_length: Option<usize>,
        error: Option<String>,
    },
    /// Per-call usage emitted after each LLM completion.
    TokenUsage {
        model_name: String,
        usage: TokenUsage,
        run_id: String,
        parent_run_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Error,
    Timeout,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Completed => "completed",
            TurnStatus::Interrupted => "interrupted",
            TurnStatus::Error => "error",
            TurnStatus::Timeout => "timeout",
        }
    }
}

/// Final result of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub status: TurnStatus,
    pub final_state: AgentState,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub interrupt_reason: Option<String>,
}

#[derive(Debug, Error)]
#[error("agent graph failed: {0}")]
pub struct AgentGraphError(pub String);

/// Everything a graph needs from the core for one turn: the workspace's
/// session, the event channel back to the pipeline, the cancellation signal
/// and the file-operation audit logger.
pub struct TurnContext {
    pub session: Arc<Session>,
    pub events: mpsc::Sender<AgentEvent>,
    pub cancel: watch::Receiver<bool>,
    pub file_ops: Arc<FileOperationLogger>,
}

/// Capability interface for the agent graph. The production graph is an
/// external collaborator; the core only needs this contract: consume the
/// merged state, emit events, honor cancellation, return the outcome.
#[async_trait]
pub trait AgentGraph: Send + Sync {
    async fn run(&self, state: AgentState, ctx: TurnContext)
        -> Result<AgentOutcome, AgentGraphError>;
}

#[derive(Debug, Error)]
#[error("structured output failed after {attempts} attempts: {last_error}")]
pub struct StructuredOutputError {
    pub attempts: u32,
    pub last_error: String,
    /// Usage accumulated across every attempt, so failed parses still bill.
    pub usage: TokenUsage,
}

pub const STRUCTURED_OUTPUT_ATTEMPTS: u32 = 5;
const STRUCTURED_OUTPUT_BACKOFF_MS: u64 = 500;

/// Run a structured-output LLM call with parse retries.
///
/// Each attempt receives the attempt number (so the caller can augment the
/// prompt with a schema hint on retries) and returns either the parsed value
/// or the parse error, along with that call's token usage. Parse failures are
/// retried with exponential backoff; the final failure carries the usage
/// accumulated across all attempts.
pub async fn call_with_parse_retry<T, F, Fut>(
    mut attempt_call: F,
    max_attempts: u32,
) -> Result<(T, TokenUsage), StructuredOutputError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = (Result<T, String>, TokenUsage)>,
{
    let mut total_usage = TokenUsage::default();
    let mut delay = std::time::Duration::from_millis(STRUCTURED_OUTPUT_BACKOFF_MS);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let (result, usage) = attempt_call(attempt).await;
        total_usage.merge(&usage);

        match result {
            Ok(value) => return Ok((value, total_usage)),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "structured output parse failed");
                last_error = e;
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(StructuredOutputError {
        attempts: max_attempts,
        last_error,
        usage: total_usage,
    })
}

/// Minimal graph used when no production graph is wired in: it acknowledges
/// the last user message as a single text chunk and completes. Doubles as the
/// deterministic graph for pipeline tests.
pub struct LoopbackGraph;

#[async_trait]
impl AgentGraph for LoopbackGraph {
    async fn run(
        &self,
        mut state: AgentState,
        ctx: TurnContext,
    ) -> Result<AgentOutcome, AgentGraphError> {
        if *ctx.cancel.borrow() {
            return Ok(AgentOutcome {
                status: TurnStatus::Interrupted,
                final_state: state,
                warnings: vec![],
                errors: vec![],
                interrupt_reason: Some("client disconnected".into()),
            });
        }

        let last_user_text = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| {
                normalize::normalize(&m.content)
                    .0
                    .unwrap_or_else(|| m.content.to_string())
            })
            .unwrap_or_default();

        let reply = format!("Received: {last_user_text}");
        let _ = ctx
            .events
            .send(AgentEvent::MessageChunk(Value::String(reply.clone())))
            .await;

        state.messages.push(Message::assistant(reply));

        Ok(AgentOutcome {
            status: TurnStatus::Completed,
            final_state: state,
            warnings: vec![],
            errors: vec![],
            interrupt_reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn usage(tokens: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: tokens,
            output_tokens: tokens / 10,
            total_tokens: tokens + tokens / 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parse_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let (value, total) = call_with_parse_retry(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        (Err::<i64, _>("not valid json".to_string()), usage(100))
                    } else {
                        (Ok(7), usage(100))
                    }
                }
            },
            STRUCTURED_OUTPUT_ATTEMPTS,
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Usage from failed attempts still counts.
        assert_eq!(total.input_tokens, 300);
    }

    #[tokio::test]
    async fn parse_retry_exhaustion_carries_accumulated_usage() {
        let err = call_with_parse_retry(
            |_| async move { (Err::<(), _>("schema mismatch".to_string()), usage(50)) },
            2,
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.usage.input_tokens, 100);
        assert!(err.last_error.contains("schema mismatch"));
    }
}
