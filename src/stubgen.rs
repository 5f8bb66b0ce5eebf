//! Generation of the Python sources uploaded into the sandbox: one tool
//! module per MCP server, per-tool markdown docs and the `mcp_client` module
//! the generated functions delegate to.
//!
//! The generator runs on the host but its output executes inside the sandbox,
//! so `${VAR}` placeholders in server env/url config are copied through
//! verbatim and resolved in the sandbox at call time. Resolving them here
//! would inline secrets into sandbox-readable files.

use serde_json::Value;

use crate::mcp::{McpServerConfig, McpToolInfo, McpTransport};

/// Tool and server names become Python identifiers: `-` and `.` map to `_`.
pub fn sanitize_identifier(name: &str) -> String {
    name.replace(['-', '.'], "_")
}

fn map_json_type(json_type: &str) -> &'static str {
    match json_type {
        "string" => "str",
        "number" => "float",
        "integer" => "int",
        "boolean" => "bool",
        "array" => "List",
        "object" => "Dict",
        "null" => "None",
        _ => "Any",
    }
}

fn example_value(json_type: &str) -> &'static str {
    match json_type {
        "string" => "\"example\"",
        "number" => "42.0",
        "integer" => "42",
        "boolean" => "True",
        "array" => "[]",
        "object" => "{}",
        _ => "\"\"",
    }
}

/// Render a JSON value as a Python literal for default arguments.
fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k:?}: {}", python_literal(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

/// Generate a complete Python module exposing one function per tool.
pub fn generate_tool_module(server_name: &str, tools: &[McpToolInfo]) -> String {
    let mut code = format!(
        r#""""
Auto-generated tool functions for MCP server: {server_name}

Functions in this module call tools on the {server_name} MCP server and are
generated from the server's tool schemas.
"""

from typing import Any, List, Dict

try:
    from .mcp_client import _call_mcp_tool
except ImportError:
    def _call_mcp_tool(server_name: str, tool_name: str, arguments: dict) -> Any:
        raise NotImplementedError(
            "MCP client not initialized. "
            "This module must be used inside a sandbox with mcp_client.py installed."
        )


"#
    );

    for tool in tools {
        code.push_str(&generate_function(tool, server_name));
        code.push_str("\n\n");
    }

    code
}

fn generate_function(tool: &McpToolInfo, server_name: &str) -> String {
    let func_name = sanitize_identifier(&tool.name);
    let params = tool.parameters();

    // Required parameters first, optional last with defaults.
    let mut param_list: Vec<String> = Vec::new();
    for (name, info) in params.iter().filter(|(_, p)| p.required) {
        param_list.push(format!("{name}: {}", map_json_type(&info.param_type)));
    }
    for (name, info) in params.iter().filter(|(_, p)| !p.required) {
        let py_type = map_json_type(&info.param_type);
        match &info.default {
            Some(default) => {
                param_list.push(format!("{name}: {py_type} = {}", python_literal(default)))
            }
            None => param_list.push(format!("{name}: {py_type} | None = None")),
        }
    }
    let param_str = param_list.join(", ");

    let docstring = generate_docstring(tool);

    let arg_entries: Vec<String> = params
        .keys()
        .map(|name| format!("        \"{name}\": {name},"))
        .collect();
    let args_dict = arg_entries.join("\n");

    format!(
        r#"def {func_name}({param_str}) -> Any:
    """{docstring}"""
    arguments = {{
{args_dict}
    }}

    # Drop unset optional arguments before the call.
    arguments = {{k: v for k, v in arguments.items() if v is not None}}

    return _call_mcp_tool("{server_name}", "{tool_name}", arguments)"#,
        tool_name = tool.name,
    )
}

fn generate_docstring(tool: &McpToolInfo) -> String {
    let params = tool.parameters();
    let mut lines: Vec<String> = Vec::new();

    if !tool.description.is_empty() {
        lines.push(tool.description.replace('\\', "\\\\"));
        lines.push(String::new());
    }

    if !params.is_empty() {
        lines.push("Args:".to_string());
        for (name, info) in &params {
            let required = if info.required { " (required)" } else { "" };
            lines.push(format!(
                "    {name} ({}){required}: {}",
                info.param_type,
                info.description.replace('\\', "\\\\")
            ));
        }
        lines.push(String::new());
    }

    lines.push("Returns:".to_string());
    lines.push("    Tool execution result".to_string());

    let example_args: Vec<String> = params
        .iter()
        .filter(|(_, p)| p.required)
        .take(2)
        .map(|(name, p)| format!("{name}={}", example_value(&p.param_type)))
        .collect();
    if !example_args.is_empty() {
        lines.push(String::new());
        lines.push("Example:".to_string());
        lines.push(format!(
            "    result = {}({})",
            sanitize_identifier(&tool.name),
            example_args.join(", ")
        ));
    }

    lines.join("\n    ")
}

/// One markdown doc per tool for optional retrieval by the agent.
pub fn generate_tool_documentation(tool: &McpToolInfo) -> String {
    let mut doc = format!(
        "# {name}\n\nServer: `{server}`\n\n{description}\n\n## Parameters\n\n",
        name = tool.name,
        server = tool.server_name,
        description = tool.description,
    );

    let params = tool.parameters();
    if params.is_empty() {
        doc.push_str("None.\n");
    } else {
        doc.push_str("| Name | Type | Required | Description |\n|---|---|---|---|\n");
        for (name, info) in &params {
            doc.push_str(&format!(
                "| `{name}` | {} | {} | {} |\n",
                info.param_type,
                if info.required { "yes" } else { "no" },
                info.description.replace('|', "\\|")
            ));
        }
    }

    doc.push_str(&format!(
        "\n## Usage\n\n```python\nfrom tools.{module}_tools import {func}\n```\n",
        module = sanitize_identifier(&tool.server_name),
        func = sanitize_identifier(&tool.name),
    ));

    doc
}

/// Rewrite a local Python MCP server invocation for in-sandbox execution and
/// return the local script path when the config points at one.
pub fn local_python_server_path(config: &McpServerConfig) -> Option<String> {
    if config.transport != McpTransport::Stdio {
        return None;
    }
    let command = config.command.as_deref()?;
    let script = match command {
        "uv" if config.args.len() >= 3 && config.args[0] == "run" && config.args[1] == "python" => {
            &config.args[2]
        }
        "python" | "python3" if !config.args.is_empty() => &config.args[0],
        _ => return None,
    };
    if script.ends_with(".py") {
        Some(script.clone())
    } else {
        None
    }
}

const MCP_CLIENT_TEMPLATE: &str = r#""""
MCP client for the sandbox environment.

Manages MCP server processes and provides tool calling over stdio
(subprocess) and sse/http (JSON-RPC POST) transports. Environment variable
placeholders in the registry below are resolved here, inside the sandbox,
at call time.
"""

import json
import os
import re
import subprocess
import threading
from typing import Any

import httpx

_server_processes: dict[str, subprocess.Popen] = {}
_server_locks: dict[str, threading.Lock] = {}
_registry_lock = threading.Lock()
_message_id_counter = 0
_message_id_lock = threading.Lock()

_SERVER_CONFIGS = __SERVER_CONFIGS__

_WORK_DIR = "__WORK_DIR__"


def _get_next_message_id() -> int:
    global _message_id_counter
    with _message_id_lock:
        _message_id_counter += 1
        return _message_id_counter


def _resolve_env_value(value: str) -> str:
    def resolve(match: re.Match) -> str:
        return os.environ.get(match.group(1), match.group(0))

    return re.sub(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}", resolve, value)


def _server_lock(server_name: str) -> threading.Lock:
    with _registry_lock:
        if server_name not in _server_locks:
            _server_locks[server_name] = threading.Lock()
        return _server_locks[server_name]


def _start_mcp_server(server_name: str) -> subprocess.Popen:
    proc = _server_processes.get(server_name)
    if proc is not None and proc.poll() is None:
        return proc

    config = _SERVER_CONFIGS.get(server_name)
    if not config:
        raise ValueError(f"Unknown MCP server: {server_name}")

    cmd = [config["command"]] + list(config.get("args", []))

    proc_env = os.environ.copy()
    internal_root = f"{_WORK_DIR}/_internal"
    existing = proc_env.get("PYTHONPATH", "")
    proc_env["PYTHONPATH"] = ":".join(
        p for p in [existing, _WORK_DIR, internal_root] if p
    )
    for key, value in config.get("env", {}).items():
        proc_env[key] = _resolve_env_value(value)

    proc = subprocess.Popen(
        cmd,
        stdin=subprocess.PIPE,
        stdout=subprocess.PIPE,
        stderr=subprocess.PIPE,
        env=proc_env,
        text=True,
        bufsize=1,
    )
    _server_processes[server_name] = proc

    init_request = {
        "jsonrpc": "2.0",
        "id": _get_next_message_id(),
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "agenthost-sandbox", "version": "1.0.0"},
        },
    }
    proc.stdin.write(json.dumps(init_request) + "\n")
    proc.stdin.flush()
    response_line = proc.stdout.readline()
    if response_line:
        response = json.loads(response_line)
        if "error" in response:
            raise RuntimeError(f"MCP initialization failed: {response['error']}")

    proc.stdin.write(json.dumps({"jsonrpc": "2.0", "method": "notifications/initialized"}) + "\n")
    proc.stdin.flush()

    return proc


def _unwrap_result(result: Any) -> Any:
    if isinstance(result, dict) and "content" in result:
        content = result["content"]
        if isinstance(content, list) and content:
            first = content[0]
            if isinstance(first, dict) and first.get("type") == "text":
                text = first.get("text", "")
                stripped = text.lstrip()
                if stripped.startswith("{") or stripped.startswith("["):
                    try:
                        return json.loads(text)
                    except json.JSONDecodeError:
                        return text
                return text
    return result


def _call_mcp_tool_stdio(server_name: str, tool_name: str, arguments: dict) -> Any:
    with _server_lock(server_name):
        proc = _start_mcp_server(server_name)

        request = {
            "jsonrpc": "2.0",
            "id": _get_next_message_id(),
            "method": "tools/call",
            "params": {"name": tool_name, "arguments": arguments},
        }
        proc.stdin.write(json.dumps(request) + "\n")
        proc.stdin.flush()

        while True:
            line = proc.stdout.readline()
            if not line:
                raise RuntimeError(f"MCP server {server_name} closed its pipe")
            try:
                message = json.loads(line)
            except json.JSONDecodeError:
                continue
            if message.get("id") != request["id"]:
                continue
            if "error" in message:
                raise RuntimeError(f"MCP tool call failed: {message['error']}")
            return _unwrap_result(message.get("result", {}))


def _call_mcp_tool_http(server_name: str, tool_name: str, arguments: dict) -> Any:
    config = _SERVER_CONFIGS[server_name]
    url = _resolve_env_value(config["url"])

    request = {
        "jsonrpc": "2.0",
        "id": _get_next_message_id(),
        "method": "tools/call",
        "params": {"name": tool_name, "arguments": arguments},
    }
    response = httpx.post(url, json=request, timeout=60.0)
    response.raise_for_status()
    result = response.json()
    if "error" in result:
        raise RuntimeError(f"MCP tool call failed: {result['error']}")
    return _unwrap_result(result.get("result", {}))


def _call_mcp_tool(server_name: str, tool_name: str, arguments: dict) -> Any:
    config = _SERVER_CONFIGS.get(server_name)
    if not config:
        raise ValueError(f"Unknown MCP server: {server_name}")
    if config["transport"] in ("sse", "http"):
        return _call_mcp_tool_http(server_name, tool_name, arguments)
    return _call_mcp_tool_stdio(server_name, tool_name, arguments)


def cleanup_mcp_servers() -> None:
    for proc in _server_processes.values():
        if proc.poll() is None:
            proc.terminate()
    _server_processes.clear()
"#;

/// Generate the standalone in-sandbox MCP client.
///
/// Configured `${VAR}` placeholders in env/url are embedded literally; local
/// Python server commands are rewritten to their uploaded sandbox paths.
pub fn generate_mcp_client(server_configs: &[McpServerConfig], work_dir: &str) -> String {
    let mut servers = String::from("{\n");
    for server in server_configs {
        match server.transport {
            McpTransport::Sse | McpTransport::Http => {
                let transport = match server.transport {
                    McpTransport::Sse => "sse",
                    _ => "http",
                };
                servers.push_str(&format!(
                    "    {name:?}: {{\n        \"transport\": \"{transport}\",\n        \"url\": {url:?},\n    }},\n",
                    name = server.name,
                    url = server.url.clone().unwrap_or_default(),
                ));
            }
            McpTransport::Stdio => {
                let mut command = server.command.clone().unwrap_or_default();
                let mut args = server.args.clone();

                if let Some(local_path) = local_python_server_path(server) {
                    let file_name = local_path.rsplit('/').next().unwrap_or(&local_path);
                    let sandbox_path = format!("{work_dir}/mcp_servers/{file_name}");
                    if command == "uv" {
                        args = vec!["run".into(), "python".into(), sandbox_path];
                    } else {
                        command = "python".into();
                        args = vec![sandbox_path];
                    }
                }

                let args_rendered: Vec<String> =
                    args.iter().map(|a| format!("{a:?}")).collect();
                let env_rendered: Vec<String> = server
                    .env
                    .iter()
                    .map(|(k, v)| format!("{k:?}: {v:?}"))
                    .collect();
                servers.push_str(&format!(
                    "    {name:?}: {{\n        \"transport\": \"stdio\",\n        \"command\": {command:?},\n        \"args\": [{args}],\n        \"env\": {{{env}}},\n    }},\n",
                    name = server.name,
                    args = args_rendered.join(", "),
                    env = env_rendered.join(", "),
                ));
            }
        }
    }
    servers.push('}');

    MCP_CLIENT_TEMPLATE
        .replace("__SERVER_CONFIGS__", &servers)
        .replace("__WORK_DIR__", work_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn tool() -> McpToolInfo {
        McpToolInfo {
            name: "get-stock.price".into(),
            description: "Fetch the latest price for a ticker.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ticker": {"type": "string", "description": "Symbol"},
                    "period": {"type": "string", "default": "1d"},
                    "verbose": {"type": "boolean"}
                },
                "required": ["ticker"]
            }),
            server_name: "market-data".into(),
        }
    }

    #[test]
    fn function_names_are_sanitized_identifiers() {
        assert_eq!(sanitize_identifier("get-stock.price"), "get_stock_price");
    }

    #[test]
    fn generated_function_puts_required_parameters_first() {
        let module = generate_tool_module("market-data", &[tool()]);
        assert!(module.contains("def get_stock_price(ticker: str, period: str = \"1d\", verbose: bool | None = None) -> Any:"));
        assert!(module.contains("return _call_mcp_tool(\"market-data\", \"get-stock.price\", arguments)"));
        // None-valued optionals are dropped before the call.
        assert!(module.contains("arguments = {k: v for k, v in arguments.items() if v is not None}"));
    }

    #[test]
    fn generated_client_keeps_placeholders_verbatim() {
        std::env::set_var("STUBGEN_TEST_SECRET", "real-secret-value");
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "${STUBGEN_TEST_SECRET}".to_string());
        let config = McpServerConfig {
            name: "market-data".into(),
            enabled: true,
            transport: McpTransport::Stdio,
            command: Some("npx".into()),
            args: vec!["-y".into(), "market-mcp".into()],
            env,
            url: None,
        };

        let client = generate_mcp_client(&[config], "/home/sandbox");
        assert!(client.contains("${STUBGEN_TEST_SECRET}"));
        // The resolved secret must never appear in generated source.
        assert!(!client.contains("real-secret-value"));
    }

    #[test]
    fn local_python_servers_are_rewritten_for_the_sandbox() {
        let config = McpServerConfig {
            name: "custom".into(),
            enabled: true,
            transport: McpTransport::Stdio,
            command: Some("uv".into()),
            args: vec!["run".into(), "python".into(), "mcp_servers/quotes.py".into()],
            env: Default::default(),
            url: None,
        };
        assert_eq!(
            local_python_server_path(&config).as_deref(),
            Some("mcp_servers/quotes.py")
        );

        let client = generate_mcp_client(&[config], "/home/sandbox");
        assert!(client.contains("/home/sandbox/mcp_servers/quotes.py"));
    }

    #[test]
    fn docs_describe_every_parameter() {
        let doc = generate_tool_documentation(&tool());
        assert!(doc.contains("# get-stock.price"));
        assert!(doc.contains("| `ticker` | string | yes |"));
        assert!(doc.contains("| `period` | string | no |"));
    }
}
