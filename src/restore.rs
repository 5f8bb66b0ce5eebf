use dashmap::DashMap;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::db::conversation;
use crate::state::{AgentState, Message};

/// In-process checkpoint store holding the latest state snapshot per thread.
/// The durable fallback is the `state_snapshot` column on responses.
#[derive(Default)]
pub struct CheckpointStore {
    snapshots: DashMap<String, Value>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, thread_id: &str, snapshot: Value) {
        self.snapshots.insert(thread_id.to_string(), snapshot);
    }

    pub fn get(&self, thread_id: &str) -> Option<Value> {
        self.snapshots.get(thread_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, thread_id: &str) {
        self.snapshots.remove(thread_id);
    }
}

/// Restore agent state for a previous thread with the fallback chain:
/// in-memory checkpoint, then the latest persisted `state_snapshot`, then
/// reconstruction from the thread's query messages.
pub async fn restore_state_with_fallback(
    checkpoints: &CheckpointStore,
    conn: &mut PgConnection,
    last_thread_id: &str,
) -> Option<AgentState> {
    if let Some(snapshot) = checkpoints.get(last_thread_id) {
        if let Some(state) = AgentState::from_snapshot(&snapshot) {
            debug!(thread_id = %last_thread_id, "restored state from checkpoint");
            return Some(state);
        }
        warn!(thread_id = %last_thread_id, "checkpoint snapshot did not deserialize");
    }

    match conversation::latest_state_snapshot(conn, last_thread_id).await {
        Ok(Some(snapshot)) => {
            if let Some(state) = AgentState::from_snapshot(&snapshot) {
                debug!(thread_id = %last_thread_id, "restored state from database snapshot");
                return Some(state);
            }
            warn!(thread_id = %last_thread_id, "database snapshot did not deserialize");
        }
        Ok(None) => {}
        Err(e) => warn!(thread_id = %last_thread_id, error = %e, "state snapshot lookup failed"),
    }

    // Last resort: rebuild a minimal state from the persisted queries.
    match conversation::query_messages(conn, last_thread_id).await {
        Ok(pairs) if !pairs.is_empty() => {
            let messages: Vec<Message> = pairs
                .into_iter()
                .map(|(query_id, content)| Message {
                    role: "user".into(),
                    content: Value::String(content),
                    id: Some(query_id),
                })
                .collect();
            debug!(
                thread_id = %last_thread_id,
                message_count = messages.len(),
                "recovered minimal state from messages"
            );
            Some(AgentState {
                messages,
                ..Default::default()
            })
        }
        Ok(_) => {
            warn!(thread_id = %last_thread_id, "no state could be restored for thread");
            None
        }
        Err(e) => {
            warn!(thread_id = %last_thread_id, error = %e, "message recovery failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkpoint_store_round_trips_snapshots() {
        let store = CheckpointStore::new();
        assert!(store.get("t1").is_none());

        store.put("t1", json!({"messages": [], "plan_iterations": 2}));
        let snapshot = store.get("t1").unwrap();
        let state = AgentState::from_snapshot(&snapshot).unwrap();
        assert_eq!(state.plan_iterations, 2);

        store.remove("t1");
        assert!(store.get("t1").is_none());
    }
}
