use axum::{
    extract::{Extension, Path},
    response::sse::{Event, Sse},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentEvent, AgentGraph, AgentOutcome, TurnStatus};
use crate::db::conversation::{self, QueryRecord, ResponseRecord};
use crate::db::workspace as ws_db;
use crate::error::{AppError, AppResult};
use crate::extractor::UserId;
use crate::file_log::FileOperationLogger;
use crate::manager::WorkspaceManager;
use crate::normalize;
use crate::pricing;
use crate::restore::{restore_state_with_fallback, CheckpointStore};
use crate::skills::{self, SkillContext};
use crate::state::{AgentState, Message};
use crate::streaming::StreamFrame;
use crate::usage::TokenTracker;

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Client-chosen query id for idempotent retries; generated when absent.
    #[serde(default)]
    pub query_id: Option<String>,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub additional_context: Vec<Value>,
    #[serde(default)]
    pub flags: BTreeMap<String, Value>,
}

/// Context items recognized by the streaming endpoint, parsed from the
/// untyped `additional_context` list.
#[derive(Debug, Default)]
struct ParsedContext {
    last_thread_id: Option<String>,
    skills: Vec<SkillContext>,
}

fn parse_additional_context(items: &[Value]) -> ParsedContext {
    let mut parsed = ParsedContext::default();
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("last_thread") => {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    parsed.last_thread_id = Some(id.to_string());
                }
            }
            Some("skills") => {
                if let Some(name) = item.get("name").and_then(Value::as_str) {
                    parsed.skills.push(SkillContext {
                        name: name.to_string(),
                        instruction: item
                            .get("instruction")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
            other => warn!(context_type = ?other, "ignoring unknown context item"),
        }
    }
    parsed
}

/// The streaming chat endpoint: one request, one turn, one durable
/// query/response pair, progress streamed as SSE frames.
pub async fn chat_stream(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    Extension(graph): Extension<Arc<dyn AgentGraph>>,
    Extension(checkpoints): Extension<Arc<CheckpointStore>>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<Uuid>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    if request.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".into()));
    }

    let workspace = ws_db::get_workspace(&pool, workspace_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if workspace.user_id != user_id {
        return Err(AppError::Forbidden);
    }

    let thread_id = request
        .thread_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let query_id = request
        .query_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let response_id = Uuid::new_v4().to_string();

    // One pooled connection carries every write of this turn, so the query
    // row always lands before its response row.
    let mut conn = pool.acquire().await?;

    conversation::ensure_thread(&mut conn, &thread_id, workspace_id).await?;
    let pair_index = conversation::next_pair_index(&mut conn, &thread_id).await?;

    let user_content = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| match &m.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    let context = parse_additional_context(&request.additional_context);
    let query_type = if context.last_thread_id.is_some() {
        "resume_feedback"
    } else {
        "initial"
    };

    conversation::upsert_query(
        &mut conn,
        &QueryRecord {
            query_id: query_id.clone(),
            thread_id: thread_id.clone(),
            pair_index,
            content: user_content,
            query_type: query_type.to_string(),
            feedback_action: None,
            metadata: json!({ "workspace_id": workspace_id }),
            timestamp: Utc::now(),
        },
    )
    .await?;

    let session = manager
        .get_session_for_workspace(workspace_id, Some(&user_id))
        .await?;

    // Assemble the turn's initial state: restored context when resuming,
    // skill prefix, then the request's messages.
    let core_config = manager.core_config();
    let mut new_messages: Vec<Message> = Vec::new();
    if let Some(prefix) =
        skills::build_skill_prefix(&context.skills, &core_config.skills.local_skill_dirs)
    {
        new_messages.push(Message::user(prefix));
    }
    new_messages.extend(request.messages.iter().map(|m| Message {
        role: m.role.clone(),
        content: m.content.clone(),
        id: None,
    }));

    let state = match &context.last_thread_id {
        Some(last_thread_id) => {
            match restore_state_with_fallback(&checkpoints, &mut conn, last_thread_id).await {
                Some(restored) => {
                    info!(%thread_id, %last_thread_id, "resuming from previous thread");
                    AgentState::merge_for_resume(restored, new_messages, request.flags.clone())
                }
                None => {
                    warn!(%last_thread_id, "resume requested but no state could be restored");
                    AgentState {
                        messages: new_messages,
                        flags: request.flags.clone(),
                        ..Default::default()
                    }
                }
            }
        }
        None => AgentState {
            messages: new_messages,
            flags: request.flags.clone(),
            ..Default::default()
        },
    };

    info!(%workspace_id, %thread_id, pair_index, "starting turn");

    let (frame_tx, frame_rx) = mpsc::channel::<StreamFrame>(64);
    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let ctx = crate::agent::TurnContext {
        session: Arc::clone(&session),
        events: event_tx,
        cancel: cancel_rx,
        file_ops: Arc::new(FileOperationLogger::new(
            pool.clone(),
            &workspace_id.to_string(),
            &thread_id,
            pair_index,
            "main",
        )),
    };
    let graph_state = state.clone();
    let graph_handle = {
        let graph = Arc::clone(&graph);
        tokio::spawn(async move { graph.run(graph_state, ctx).await })
    };

    let turn = TurnTask {
        conn,
        checkpoints,
        thread_id,
        pair_index,
        response_id,
        fallback_state: state,
    };
    tokio::spawn(turn.run(event_rx, frame_tx, cancel_tx, graph_handle));

    let stream = ReceiverStream::new(frame_rx).map(|frame| Ok(frame.to_event()));
    Ok(Sse::new(stream))
}

struct TurnTask {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    checkpoints: Arc<CheckpointStore>,
    thread_id: String,
    pair_index: i32,
    response_id: String,
    fallback_state: AgentState,
}

impl TurnTask {
    /// Forward agent events to the client while buffering every frame, then
    /// persist the response row. Client disconnect cancels the graph but
    /// never the final persistence.
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<AgentEvent>,
        frame_tx: mpsc::Sender<StreamFrame>,
        cancel_tx: watch::Sender<bool>,
        graph_handle: tokio::task::JoinHandle<
            Result<AgentOutcome, crate::agent::AgentGraphError>,
        >,
    ) {
        let started = Instant::now();
        let tracker = TokenTracker::new();
        let mut chunks: Vec<Value> = Vec::new();
        let mut client_connected = true;

        while let Some(event) = event_rx.recv().await {
            let Some(frame) = frame_for_event(event, &tracker) else {
                continue;
            };
            chunks.push(frame.to_json());
            if client_connected && frame_tx.send(frame).await.is_err() {
                info!(thread_id = %self.thread_id, "client disconnected, cancelling agent graph");
                client_connected = false;
                let _ = cancel_tx.send(true);
            }
        }

        let cancelled = !client_connected;
        let outcome = match graph_handle.await {
            Ok(Ok(mut outcome)) => {
                if cancelled && outcome.status == TurnStatus::Completed {
                    outcome.status = TurnStatus::Interrupted;
                    outcome.interrupt_reason = Some("client disconnected".into());
                }
                outcome
            }
            Ok(Err(e)) => {
                error!(thread_id = %self.thread_id, error = %e, "agent graph error");
                AgentOutcome {
                    status: TurnStatus::Error,
                    final_state: self.fallback_state.clone(),
                    warnings: vec![],
                    errors: vec![e.to_string()],
                    interrupt_reason: None,
                }
            }
            Err(e) => {
                error!(thread_id = %self.thread_id, error = %e, "agent graph panicked");
                AgentOutcome {
                    status: TurnStatus::Error,
                    final_state: self.fallback_state.clone(),
                    warnings: vec![],
                    errors: vec!["agent graph terminated unexpectedly".into()],
                    interrupt_reason: None,
                }
            }
        };

        let execution_time = started.elapsed().as_secs_f64();
        let snapshot = outcome.final_state.to_snapshot();
        let usage_summary = tracker.summary(&pricing::MANIFEST);

        let response = ResponseRecord {
            response_id: self.response_id.clone(),
            thread_id: self.thread_id.clone(),
            pair_index: self.pair_index,
            status: outcome.status.as_str().to_string(),
            interrupt_reason: outcome.interrupt_reason.clone(),
            agent_messages: serde_json::to_value(&outcome.final_state.messages).ok(),
            metadata: json!({ "token_usage": usage_summary }),
            state_snapshot: Some(snapshot.clone()),
            warnings: outcome.warnings.clone(),
            errors: outcome.errors.clone(),
            execution_time,
            streaming_chunks: Some(Value::Array(chunks)),
            timestamp: Utc::now(),
        };

        let persisted = async {
            conversation::upsert_response(&mut self.conn, &response).await?;
            conversation::update_thread_status(
                &mut self.conn,
                &self.thread_id,
                outcome.status.as_str(),
            )
            .await
        }
        .await;

        match persisted {
            Ok(()) => {
                self.checkpoints.put(&self.thread_id, snapshot);
                info!(
                    thread_id = %self.thread_id,
                    pair_index = self.pair_index,
                    status = outcome.status.as_str(),
                    execution_time,
                    "turn persisted"
                );
            }
            Err(e) => {
                // The upserts are idempotent, so no partial row survives.
                error!(thread_id = %self.thread_id, error = %e, "failed to persist turn");
            }
        }

        if client_connected {
            let _ = frame_tx
                .send(StreamFrame::Done {
                    status: outcome.status.as_str().to_string(),
                    response_id: self.response_id,
                })
                .await;
        }
    }
}

/// Translate an agent event into at most one SSE frame. Status signals and
/// empty content produce nothing.
fn frame_for_event(event: AgentEvent, tracker: &TokenTracker) -> Option<StreamFrame> {
    match event {
        AgentEvent::MessageChunk(content) => {
            let (text, kind) = normalize::normalize(&content);
            match (text, kind) {
                (Some(text), Some(kind)) => Some(StreamFrame::chunk(text, kind)),
                _ => None,
            }
        }
        AgentEvent::SummarizationSignal {
            signal,
            summary_length,
            error,
        } => Some(StreamFrame::SummarizationSignal {
            signal,
            summary_length,
            error,
        }),
        AgentEvent::TokenUsage {
            model_name,
            usage,
            run_id,
            parent_run_id,
        } => {
            tracker.record(&model_name, usage.clone(), &run_id, parent_run_id.as_deref());
            Some(StreamFrame::TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total_tokens,
            })
        }
    }
}
