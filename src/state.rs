use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One conversation message in agent state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Value::String(content.into()),
            id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: Value::String(content.into()),
            id: None,
        }
    }
}

/// The subset of agent graph state the core reads, with everything else
/// passed through opaquely in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub observations: Vec<Value>,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default)]
    pub used_tool_results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<Value>,
    #[serde(default)]
    pub plan_iterations: u32,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentState {
    pub fn from_snapshot(snapshot: &Value) -> Option<Self> {
        serde_json::from_value(snapshot.clone()).ok()
    }

    pub fn to_snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merge a restored state into a new request.
    ///
    /// Accumulated context (observations, resources, tool-result history,
    /// market type, message history) is preserved; per-turn progress (plan,
    /// iteration and retry counters, final report) is reset; user config
    /// flags are overridden by the new request; the new messages append to
    /// the restored history.
    pub fn merge_for_resume(
        mut restored: AgentState,
        new_messages: Vec<Message>,
        flags: BTreeMap<String, Value>,
    ) -> AgentState {
        restored.current_plan = None;
        restored.plan_iterations = 0;
        restored.retry_counts.clear();
        restored.final_report = None;
        restored.flags = flags;
        restored.messages.extend(new_messages);
        restored
    }
}
