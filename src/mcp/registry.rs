use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::connector::McpConnector;
use super::types::{McpServerConfig, McpToolInfo};
use super::McpError;

/// Supervises the connectors for every configured MCP server and routes tool
/// calls by server name.
pub struct McpRegistry {
    connectors: HashMap<String, Arc<McpConnector>>,
}

impl McpRegistry {
    pub fn new(servers: &[McpServerConfig]) -> Self {
        let disabled: Vec<&str> = servers
            .iter()
            .filter(|s| !s.enabled)
            .map(|s| s.name.as_str())
            .collect();
        if !disabled.is_empty() {
            info!(?disabled, "skipping disabled MCP servers");
        }

        let connectors = servers
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.name.clone(), Arc::new(McpConnector::new(s.clone()))))
            .collect();

        Self { connectors }
    }

    /// Connect every enabled server concurrently. Individual connector
    /// failures are logged and isolated; the registry stays usable with the
    /// servers that did come up.
    pub async fn connect_all(&self) {
        info!(server_count = self.connectors.len(), "connecting to MCP servers");

        let results = join_all(self.connectors.values().map(|connector| {
            let connector = Arc::clone(connector);
            async move { (connector.name().to_string(), connector.connect().await) }
        }))
        .await;

        for (server, result) in results {
            if let Err(e) = result {
                warn!(%server, error = %e, "MCP server failed to connect");
            }
        }
    }

    /// Disconnect every connector concurrently, tolerant of connectors that
    /// never connected in the first place.
    pub async fn disconnect_all(&self) {
        info!("disconnecting from all MCP servers");
        join_all(
            self.connectors
                .values()
                .map(|connector| connector.disconnect()),
        )
        .await;
    }

    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let connector = self
            .connectors
            .get(server_name)
            .ok_or_else(|| McpError::UnknownServer(server_name.to_string()))?;
        connector.call_tool(tool_name, arguments).await
    }

    /// Cached tool lists keyed by server name.
    pub async fn all_tools(&self) -> HashMap<String, Vec<McpToolInfo>> {
        let mut tools = HashMap::new();
        for (name, connector) in &self.connectors {
            tools.insert(name.clone(), connector.tools().await);
        }
        tools
    }

    pub async fn tool_info(&self, server_name: &str, tool_name: &str) -> Option<McpToolInfo> {
        let connector = self.connectors.get(server_name)?;
        connector
            .tools()
            .await
            .into_iter()
            .find(|t| t.name == tool_name)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::McpTransport;

    fn config(name: &str, enabled: bool) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            enabled,
            transport: McpTransport::Http,
            command: None,
            args: vec![],
            env: Default::default(),
            url: Some("http://localhost:1".into()),
        }
    }

    #[tokio::test]
    async fn disabled_servers_are_not_registered() {
        let registry = McpRegistry::new(&[config("on", true), config("off", false)]);
        assert_eq!(registry.server_names(), vec!["on".to_string()]);
    }

    #[tokio::test]
    async fn unknown_server_is_a_routing_error() {
        let registry = McpRegistry::new(&[]);
        let err = registry
            .call_tool("ghost", "noop", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(name) if name == "ghost"));
    }
}
