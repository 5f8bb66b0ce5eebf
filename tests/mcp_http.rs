use httpmock::prelude::*;
use serde_json::{json, Value};

use agenthost::mcp::{McpConnector, McpRegistry, McpServerConfig, McpTransport};

fn http_config(name: &str, url: String) -> McpServerConfig {
    McpServerConfig {
        name: name.into(),
        enabled: true,
        transport: McpTransport::Http,
        command: None,
        args: vec![],
        env: Default::default(),
        url: Some(url),
    }
}

fn mount_handshake(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST).body_contains("\"method\":\"initialize\"");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .body_contains("notifications/initialized");
        then.status(202);
    });
}

#[tokio::test]
async fn http_connector_discovers_and_calls_tools() {
    let server = MockServer::start();
    mount_handshake(&server);

    server.mock(|when, then| {
        when.method(POST).body_contains("tools/list");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [{
                    "name": "get-price",
                    "description": "Latest price for a ticker",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"ticker": {"type": "string"}},
                        "required": ["ticker"]
                    }
                }]
            }
        }));
    });
    server.mock(|when, then| {
        when.method(POST).body_contains("tools/call");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "content": [{"type": "text", "text": "{\"ticker\": \"ACME\", \"price\": 42.5}"}]
            }
        }));
    });

    let connector = McpConnector::new(http_config("market", server.url("/")));
    connector.connect().await.expect("connect succeeds");

    let tools = connector.tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "get-price");
    assert_eq!(tools[0].server_name, "market");
    assert!(tools[0].parameters()["ticker"].required);

    // JSON-looking text content is parsed before it reaches the caller.
    let result = connector
        .call_tool("get-price", json!({"ticker": "ACME"}))
        .await
        .expect("tool call succeeds");
    assert_eq!(result, json!({"ticker": "ACME", "price": 42.5}));

    connector.disconnect().await;
    assert!(connector.tools().await.is_empty());
}

#[tokio::test]
async fn rpc_error_members_surface_as_mcp_errors() {
    let server = MockServer::start();
    mount_handshake(&server);
    server.mock(|when, then| {
        when.method(POST).body_contains("tools/list");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": []}
        }));
    });
    server.mock(|when, then| {
        when.method(POST).body_contains("tools/call");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32602, "message": "unknown tool"}
        }));
    });

    let connector = McpConnector::new(http_config("market", server.url("/")));
    connector.connect().await.expect("connect succeeds");

    let err = connector
        .call_tool("missing-tool", json!({}))
        .await
        .expect_err("rpc error should fail the call");
    assert!(err.to_string().contains("unknown tool"));
}

#[tokio::test]
async fn sse_discovery_retries_before_settling_for_empty_tools() {
    let server = MockServer::start();
    mount_handshake(&server);
    let list = server.mock(|when, then| {
        when.method(POST).body_contains("tools/list");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": []}
        }));
    });

    let mut config = http_config("events", server.url("/"));
    config.transport = McpTransport::Sse;

    let connector = McpConnector::new(config);
    connector.connect().await.expect("connect succeeds");

    // Empty discovery is retried with backoff before being accepted.
    assert_eq!(list.hits(), 3);
    assert!(connector.tools().await.is_empty());
}

#[tokio::test]
async fn registry_isolates_failing_connectors() {
    let server = MockServer::start();
    mount_handshake(&server);
    server.mock(|when, then| {
        when.method(POST).body_contains("tools/list");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [{"name": "ping", "description": "", "inputSchema": {}}]}
        }));
    });
    server.mock(|when, then| {
        when.method(POST).body_contains("tools/call");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"type": "text", "text": "pong"}]}
        }));
    });

    let good = http_config("good", server.url("/"));
    // Nothing listens here; this connector fails to connect.
    let bad = http_config("bad", "http://127.0.0.1:1/".into());

    let registry = McpRegistry::new(&[good, bad]);
    registry.connect_all().await;

    let tools = registry.all_tools().await;
    assert_eq!(tools["good"].len(), 1);
    assert!(tools["bad"].is_empty());

    let result = registry
        .call_tool("good", "ping", json!({}))
        .await
        .expect("good server still routes");
    assert_eq!(result, Value::String("pong".into()));

    registry.disconnect_all().await;
}
