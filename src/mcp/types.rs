use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Sse,
    Http,
}

impl Default for McpTransport {
    fn default() -> Self {
        McpTransport::Stdio
    }
}

/// Configuration for one external MCP server.
///
/// stdio servers require `command`; sse/http servers require `url`. Values in
/// `env` and `url` may contain `${VAR}` placeholders that are resolved from
/// the process environment at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: McpTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl McpServerConfig {
    /// Validate the transport-specific required fields.
    pub fn validate(&self) -> Result<(), String> {
        match self.transport {
            McpTransport::Stdio if self.command.is_none() => {
                Err(format!("command is required for stdio server {}", self.name))
            }
            McpTransport::Sse | McpTransport::Http if self.url.is_none() => {
                Err(format!("url is required for {} server {}",
                    match self.transport { McpTransport::Sse => "sse", _ => "http" },
                    self.name))
            }
            _ => Ok(()),
        }
    }

    /// Host environment merged with configured env, placeholders resolved.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = std::env::vars().collect();
        for (key, value) in &self.env {
            merged.insert(key.clone(), resolve_placeholders(value));
        }
        merged
    }

    /// URL with placeholders resolved, if configured.
    pub fn resolved_url(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        let resolved = resolve_placeholders(url);
        if resolved.contains("${") {
            tracing::warn!(
                server = %self.name,
                url = %url,
                "url still contains unresolved environment variables"
            );
        }
        Some(resolved)
    }
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Expand `${VAR}` placeholders from the process environment. Unset variables
/// are left verbatim so the caller can detect and report them.
pub fn resolve_placeholders(value: &str) -> String {
    PLACEHOLDER_RE
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Parameter metadata derived from a tool's JSON schema.
#[derive(Debug, Clone, Serialize)]
pub struct McpToolParameter {
    pub param_type: String,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// A tool discovered from an MCP server via `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
}

impl McpToolInfo {
    /// Parameter map extracted from the input schema, preserving the
    /// `required` list and per-property defaults.
    pub fn parameters(&self) -> BTreeMap<String, McpToolParameter> {
        let mut params = BTreeMap::new();

        let Some(properties) = self.input_schema.get("properties").and_then(Value::as_object)
        else {
            return params;
        };

        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for (name, info) in properties {
            params.insert(
                name.clone(),
                McpToolParameter {
                    param_type: info
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("any")
                        .to_string(),
                    description: info
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    required: required.contains(&name.as_str()),
                    default: info.get("default").cloned(),
                },
            );
        }

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_resolve_from_environment() {
        std::env::set_var("MCP_TYPES_TEST_TOKEN", "sekrit");
        assert_eq!(
            resolve_placeholders("Bearer ${MCP_TYPES_TEST_TOKEN}"),
            "Bearer sekrit"
        );
        // Unset variables survive verbatim.
        assert_eq!(
            resolve_placeholders("${MCP_TYPES_TEST_UNSET_VAR}"),
            "${MCP_TYPES_TEST_UNSET_VAR}"
        );
    }

    #[test]
    fn stdio_requires_command_and_http_requires_url() {
        let raw = json!({"name": "files", "transport": "stdio"});
        let config: McpServerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());

        let raw = json!({"name": "web", "transport": "http"});
        let config: McpServerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());

        let raw = json!({"name": "web", "transport": "http", "url": "http://localhost:9"});
        let config: McpServerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parameters_reflect_required_list_and_defaults() {
        let tool = McpToolInfo {
            name: "fetch-page".into(),
            description: "Fetch a page".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Target URL"},
                    "limit": {"type": "integer", "default": 10}
                },
                "required": ["url"]
            }),
            server_name: "web".into(),
        };

        let params = tool.parameters();
        assert!(params["url"].required);
        assert_eq!(params["url"].param_type, "string");
        assert!(!params["limit"].required);
        assert_eq!(params["limit"].default, Some(json!(10)));
    }
}
