use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// One durable query row, keyed by `(thread_id, pair_index)`.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub query_id: String,
    pub thread_id: String,
    pub pair_index: i32,
    pub content: String,
    pub query_type: String,
    pub feedback_action: Option<String>,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// One durable response row, keyed by `(thread_id, pair_index)`.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub response_id: String,
    pub thread_id: String,
    pub pair_index: i32,
    pub status: String,
    pub interrupt_reason: Option<String>,
    pub agent_messages: Option<Value>,
    pub metadata: Value,
    pub state_snapshot: Option<Value>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub execution_time: f64,
    pub streaming_chunks: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Ensure the thread row exists, assigning `thread_index` as the current
/// thread count for the workspace. Safe to call concurrently: the insert is
/// conflict-free on re-entry.
pub async fn ensure_thread(
    conn: &mut PgConnection,
    thread_id: &str,
    workspace_id: Uuid,
) -> Result<i32, sqlx::Error> {
    let existing = sqlx::query("SELECT thread_index FROM conversation_thread WHERE thread_id = $1")
        .bind(thread_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = existing {
        return Ok(row.get("thread_index"));
    }

    let thread_index: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conversation_thread WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_one(&mut *conn)
            .await?;

    sqlx::query(
        "INSERT INTO conversation_thread (thread_id, workspace_id, thread_index, current_status) \
         VALUES ($1, $2, $3, 'in_progress') ON CONFLICT (thread_id) DO NOTHING",
    )
    .bind(thread_id)
    .bind(workspace_id)
    .bind(thread_index as i32)
    .execute(&mut *conn)
    .await?;

    Ok(thread_index as i32)
}

/// The dense 0-based index of the next query for a thread.
pub async fn next_pair_index(
    conn: &mut PgConnection,
    thread_id: &str,
) -> Result<i32, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conversation_query WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count as i32)
}

/// Idempotent query insert: re-inserting the same `(thread_id, pair_index)`
/// updates the row instead of duplicating it.
pub async fn upsert_query(conn: &mut PgConnection, query: &QueryRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO conversation_query \
         (thread_id, pair_index, query_id, content, query_type, feedback_action, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (thread_id, pair_index) DO UPDATE SET \
         query_id = EXCLUDED.query_id, content = EXCLUDED.content, \
         query_type = EXCLUDED.query_type, feedback_action = EXCLUDED.feedback_action, \
         metadata = EXCLUDED.metadata",
    )
    .bind(&query.thread_id)
    .bind(query.pair_index)
    .bind(&query.query_id)
    .bind(&query.content)
    .bind(&query.query_type)
    .bind(&query.feedback_action)
    .bind(&query.metadata)
    .bind(query.timestamp)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Idempotent response upsert with the same conflict key as queries.
pub async fn upsert_response(
    conn: &mut PgConnection,
    response: &ResponseRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO conversation_response \
         (thread_id, pair_index, response_id, status, interrupt_reason, agent_messages, metadata, \
          state_snapshot, warnings, errors, execution_time, streaming_chunks, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         ON CONFLICT (thread_id, pair_index) DO UPDATE SET \
         response_id = EXCLUDED.response_id, status = EXCLUDED.status, \
         interrupt_reason = EXCLUDED.interrupt_reason, agent_messages = EXCLUDED.agent_messages, \
         metadata = EXCLUDED.metadata, state_snapshot = EXCLUDED.state_snapshot, \
         warnings = EXCLUDED.warnings, errors = EXCLUDED.errors, \
         execution_time = EXCLUDED.execution_time, streaming_chunks = EXCLUDED.streaming_chunks",
    )
    .bind(&response.thread_id)
    .bind(response.pair_index)
    .bind(&response.response_id)
    .bind(&response.status)
    .bind(&response.interrupt_reason)
    .bind(&response.agent_messages)
    .bind(&response.metadata)
    .bind(&response.state_snapshot)
    .bind(serde_json::json!(response.warnings))
    .bind(serde_json::json!(response.errors))
    .bind(response.execution_time)
    .bind(&response.streaming_chunks)
    .bind(response.timestamp)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn update_thread_status(
    conn: &mut PgConnection,
    thread_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE conversation_thread SET current_status = $2, updated_at = NOW() WHERE thread_id = $1",
    )
    .bind(thread_id)
    .bind(status)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// The latest persisted state snapshot for a thread, if any.
pub async fn latest_state_snapshot(
    conn: &mut PgConnection,
    thread_id: &str,
) -> Result<Option<Value>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT state_snapshot FROM conversation_response \
         WHERE thread_id = $1 AND state_snapshot IS NOT NULL \
         ORDER BY pair_index DESC LIMIT 1",
    )
    .bind(thread_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.and_then(|r| r.try_get("state_snapshot").ok()))
}

/// Query contents for a thread, ordered by pair index. Used by the
/// message-reconstruction resume fallback.
pub async fn query_messages(
    conn: &mut PgConnection,
    thread_id: &str,
) -> Result<Vec<(String, String)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT query_id, content FROM conversation_query \
         WHERE thread_id = $1 ORDER BY pair_index",
    )
    .bind(thread_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get("query_id"), r.get("content")))
        .collect())
}
