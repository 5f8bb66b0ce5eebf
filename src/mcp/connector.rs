use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::types::{McpServerConfig, McpToolInfo, McpTransport};
use super::McpError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const SSE_DISCOVERY_RETRIES: u32 = 3;

/// Monotonic JSON-RPC message ids, shared across every connector in the
/// process so request ids never collide between servers.
static MESSAGE_ID: Lazy<StdMutex<i64>> = Lazy::new(|| StdMutex::new(0));

pub fn next_message_id() -> i64 {
    let mut guard = MESSAGE_ID.lock().expect("message id lock poisoned");
    *guard += 1;
    *guard
}

struct StdioPipe {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

enum Transport {
    Stdio {
        child: Mutex<Child>,
        /// Serializes each write with the read of its response so the single
        /// pipe never interleaves request/response pairs.
        pipe: Mutex<StdioPipe>,
    },
    HttpLike {
        client: reqwest::Client,
        url: String,
    },
}

/// Owns one long-lived MCP server session and routes tool calls into it.
pub struct McpConnector {
    config: McpServerConfig,
    transport: RwLock<Option<Transport>>,
    tools: RwLock<Vec<McpToolInfo>>,
}

impl McpConnector {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            transport: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn tools(&self) -> Vec<McpToolInfo> {
        self.tools.read().await.clone()
    }

    /// Open the transport, run the MCP init handshake and cache the tool list.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.config
            .validate()
            .map_err(McpError::Config)?;

        info!(server = %self.config.name, transport = ?self.config.transport, "connecting to MCP server");

        let transport = match self.config.transport {
            McpTransport::Stdio => self.open_stdio().await?,
            McpTransport::Sse | McpTransport::Http => self.open_http()?,
        };

        *self.transport.write().await = Some(transport);

        self.initialize().await?;

        let tools = match self.config.transport {
            // SSE endpoint events can land after the first tools/list; retry
            // with backoff before giving up.
            McpTransport::Sse => self.discover_tools_with_retry().await?,
            _ => self.discover_tools().await?,
        };

        info!(
            server = %self.config.name,
            tool_count = tools.len(),
            "connected to MCP server"
        );
        *self.tools.write().await = tools;

        Ok(())
    }

    /// Signal disconnect and wait for the child transport to terminate.
    pub async fn disconnect(&self) {
        info!(server = %self.config.name, "disconnecting from MCP server");
        let transport = self.transport.write().await.take();
        if let Some(Transport::Stdio { child, .. }) = transport {
            let mut child = child.into_inner();
            if let Err(e) = child.kill().await {
                warn!(server = %self.config.name, error = %e, "failed to kill MCP child process");
            }
            let _ = child.wait().await;
        }
        self.tools.write().await.clear();
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        debug!(server = %self.config.name, tool = %tool_name, "calling MCP tool");

        let result = self
            .request(
                "tools/call",
                json!({ "name": tool_name, "arguments": arguments }),
            )
            .await?;

        debug!(server = %self.config.name, tool = %tool_name, "MCP tool call completed");
        Ok(unwrap_tool_result(result))
    }

    async fn open_stdio(&self) -> Result<Transport, McpError> {
        let command = self
            .config
            .command
            .as_ref()
            .expect("validated stdio config has a command");

        let mut child = Command::new(command)
            .args(&self.config.args)
            .envs(self.config.resolved_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Connect {
                server: self.config.name.clone(),
                message: format!("failed to spawn {command}: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Connect {
            server: self.config.name.clone(),
            message: "child stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Connect {
            server: self.config.name.clone(),
            message: "child stdout unavailable".into(),
        })?;

        Ok(Transport::Stdio {
            child: Mutex::new(child),
            pipe: Mutex::new(StdioPipe {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    fn open_http(&self) -> Result<Transport, McpError> {
        let url = self.config.resolved_url().ok_or_else(|| {
            McpError::Config(format!("url is required for server {}", self.config.name))
        })?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| McpError::Connect {
                server: self.config.name.clone(),
                message: e.to_string(),
            })?;

        Ok(Transport::HttpLike { client, url })
    }

    async fn initialize(&self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "agenthost",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
        .await?;

        self.notify("notifications/initialized").await
    }

    async fn discover_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.request("tools/list", json!({})).await?;

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|tool| McpToolInfo {
                        name: tool
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input_schema: tool
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({})),
                        server_name: self.config.name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tools)
    }

    async fn discover_tools_with_retry(&self) -> Result<Vec<McpToolInfo>, McpError> {
        for attempt in 0..SSE_DISCOVERY_RETRIES {
            match self.discover_tools().await {
                Ok(tools) if !tools.is_empty() => return Ok(tools),
                Ok(tools) => {
                    if attempt + 1 == SSE_DISCOVERY_RETRIES {
                        return Ok(tools);
                    }
                    warn!(
                        server = %self.config.name,
                        attempt = attempt + 1,
                        "tool discovery returned 0 tools, retrying"
                    );
                }
                Err(e) => {
                    if attempt + 1 == SSE_DISCOVERY_RETRIES {
                        return Err(e);
                    }
                    warn!(
                        server = %self.config.name,
                        attempt = attempt + 1,
                        error = %e,
                        "tool discovery failed, retrying"
                    );
                }
            }
            let wait = Duration::from_millis(500 * 2u64.pow(attempt));
            tokio::time::sleep(wait).await;
        }
        unreachable!("retry loop returns on final attempt")
    }

    /// Send a JSON-RPC request and await the matching response by id.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = next_message_id();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.exchange(&payload, Some(id)).await?;

        if let Some(error) = response.get("error") {
            return Err(McpError::Rpc {
                server: self.config.name.clone(),
                detail: error.clone(),
            });
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let payload = json!({ "jsonrpc": "2.0", "method": method });
        self.exchange(&payload, None).await.map(|_| ())
    }

    async fn exchange(&self, payload: &Value, id: Option<i64>) -> Result<Value, McpError> {
        let guard = self.transport.read().await;
        let transport = guard
            .as_ref()
            .ok_or_else(|| McpError::NotConnected(self.config.name.clone()))?;

        match transport {
            Transport::Stdio { pipe, .. } => {
                let mut pipe = pipe.lock().await;

                let mut line = serde_json::to_string(payload).map_err(|e| McpError::Transport {
                    server: self.config.name.clone(),
                    message: e.to_string(),
                })?;
                line.push('\n');
                pipe.stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| self.transport_error(e))?;
                pipe.stdin
                    .flush()
                    .await
                    .map_err(|e| self.transport_error(e))?;

                // Notifications get no response; the pipe lock is released and
                // the next request reads whatever follows.
                let Some(expected_id) = id else {
                    return Ok(Value::Null);
                };

                loop {
                    let mut buf = String::new();
                    let read = pipe
                        .stdout
                        .read_line(&mut buf)
                        .await
                        .map_err(|e| self.transport_error(e))?;
                    if read == 0 {
                        return Err(McpError::Transport {
                            server: self.config.name.clone(),
                            message: "server closed stdout".into(),
                        });
                    }
                    let trimmed = buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                        debug!(server = %self.config.name, "skipping non-JSON line from server");
                        continue;
                    };
                    // Server-initiated notifications carry no id; skip them.
                    match message.get("id").and_then(Value::as_i64) {
                        Some(found) if found == expected_id => return Ok(message),
                        _ => continue,
                    }
                }
            }
            Transport::HttpLike { client, url } => {
                let response = client
                    .post(url)
                    .json(payload)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;

                // Notifications may get 202/empty bodies.
                if id.is_none() {
                    return Ok(Value::Null);
                }

                let response = response
                    .error_for_status()
                    .map_err(|e| self.transport_error(e))?;
                response.json().await.map_err(|e| self.transport_error(e))
            }
        }
    }

    fn transport_error(&self, e: impl std::fmt::Display) -> McpError {
        McpError::Transport {
            server: self.config.name.clone(),
            message: e.to_string(),
        }
    }
}

/// Unwrap the MCP tool-call result envelope.
///
/// `{content: [{type: "text", text: T}]}` yields `T`, parsed as JSON when it
/// looks like an object or array. Any other shape is returned verbatim.
pub fn unwrap_tool_result(result: Value) -> Value {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .filter(|first| first.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|first| first.get("text"))
        .and_then(Value::as_str);

    match text {
        Some(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
            } else {
                Value::String(text.to_string())
            }
        }
        None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_ids_are_monotonic() {
        let a = next_message_id();
        let b = next_message_id();
        assert!(b > a);
    }

    #[test]
    fn text_content_is_unwrapped_to_string() {
        let result = json!({"content": [{"type": "text", "text": "plain output"}]});
        assert_eq!(
            unwrap_tool_result(result),
            Value::String("plain output".into())
        );
    }

    #[test]
    fn json_looking_text_is_parsed() {
        let result = json!({"content": [{"type": "text", "text": "{\"rows\": [1, 2]}"}]});
        assert_eq!(unwrap_tool_result(result), json!({"rows": [1, 2]}));

        let result = json!({"content": [{"type": "text", "text": "[1, 2, 3]"}]});
        assert_eq!(unwrap_tool_result(result), json!([1, 2, 3]));
    }

    #[test]
    fn malformed_json_text_falls_back_to_string() {
        let result = json!({"content": [{"type": "text", "text": "{not valid"}]});
        assert_eq!(
            unwrap_tool_result(result),
            Value::String("{not valid".into())
        );
    }

    #[test]
    fn non_text_results_pass_through_verbatim() {
        let result = json!({"structuredContent": {"ok": true}});
        assert_eq!(unwrap_tool_result(result.clone()), result);
    }
}
