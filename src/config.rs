use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;

use crate::mcp::McpServerConfig;

/// Address the HTTP server binds to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server binds to. Defaults to `8000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
});

/// Continue serving even if migrations fail (for read-only replicas).
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

/// Seconds a running workspace may sit idle before the eviction worker stops it.
pub static IDLE_TIMEOUT_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("WORKSPACE_IDLE_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1800)
});

/// Seconds between eviction worker runs.
pub static CLEANUP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("WORKSPACE_CLEANUP_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300)
});

/// API key for the remote sandbox provider. Must be set to create sandboxes.
pub static SANDBOX_API_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("SANDBOX_API_KEY").unwrap_or_default());

fn default_working_directory() -> String {
    "/home/sandbox".to_string()
}

fn default_allowed_directories() -> Vec<String> {
    vec!["/home/sandbox".to_string(), "/tmp".to_string()]
}

fn default_denied_directories() -> Vec<String> {
    vec!["/home/sandbox/_internal".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_snapshot_base() -> String {
    "agenthost-base".to_string()
}

fn default_python_version() -> String {
    "3.12".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    #[serde(default = "default_allowed_directories")]
    pub allowed_directories: Vec<String>,
    #[serde(default = "default_denied_directories")]
    pub denied_directories: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_path_validation: bool,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            allowed_directories: default_allowed_directories(),
            denied_directories: default_denied_directories(),
            enable_path_validation: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local skill roots in precedence order; later roots override earlier.
    #[serde(default)]
    pub local_skill_dirs: Vec<String>,
    /// Base directory for skills inside the sandbox.
    #[serde(default = "default_sandbox_skills_base")]
    pub sandbox_skills_base: String,
}

fn default_sandbox_skills_base() -> String {
    "/home/sandbox/skills".to_string()
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_skill_dirs: vec!["skills".to_string()],
            sandbox_skills_base: default_sandbox_skills_base(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default = "default_true")]
    pub snapshot_enabled: bool,
    #[serde(default = "default_true")]
    pub snapshot_auto_create: bool,
    #[serde(default = "default_snapshot_base")]
    pub snapshot_name: String,
    #[serde(default = "default_python_version")]
    pub python_version: String,
    /// Extra pip dependencies baked into the snapshot image.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            snapshot_enabled: true,
            snapshot_auto_create: true,
            snapshot_name: default_snapshot_base(),
            python_version: default_python_version(),
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_execution_time: default_max_execution_time(),
        }
    }
}

/// Structured configuration for sessions, sandboxes and MCP servers.
///
/// Loaded once at startup from `CORE_CONFIG_PATH` (JSON); every section has
/// working defaults so the file is optional in development.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl CoreConfig {
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var("CORE_CONFIG_PATH") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)?;
                let config = serde_json::from_str(&raw)?;
                tracing::info!(%path, "loaded core config");
                Ok(config)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Enabled MCP server configs only.
    pub fn enabled_mcp_servers(&self) -> Vec<&McpServerConfig> {
        self.mcp.servers.iter().filter(|s| s.enabled).collect()
    }

    /// npm packages for enabled stdio servers whose command is `npx`.
    pub fn mcp_npm_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self
            .enabled_mcp_servers()
            .iter()
            .filter(|s| s.transport == crate::mcp::McpTransport::Stdio)
            .filter(|s| s.command.as_deref() == Some("npx"))
            .filter_map(|s| {
                s.args
                    .iter()
                    .find(|a| !a.starts_with('-'))
                    .map(|a| a.clone())
            })
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }

    /// Env var map for enabled MCP servers with `${VAR}` placeholders resolved
    /// from the host environment. Used only for direct host-side execution
    /// paths, never for generated sandbox sources.
    pub fn resolved_mcp_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for server in self.enabled_mcp_servers() {
            for (key, value) in &server.env {
                env.insert(key.clone(), crate::mcp::resolve_placeholders(value));
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = CoreConfig::default();
        assert_eq!(config.filesystem.working_directory, "/home/sandbox");
        assert!(config.filesystem.enable_path_validation);
        assert_eq!(config.security.max_execution_time, 300);
        assert!(config.mcp.servers.is_empty());
    }

    #[test]
    fn npm_packages_are_sorted_and_deduped() {
        let raw = serde_json::json!({
            "mcp": {
                "servers": [
                    {"name": "b", "transport": "stdio", "command": "npx", "args": ["-y", "pkg-b"]},
                    {"name": "a", "transport": "stdio", "command": "npx", "args": ["-y", "pkg-a"]},
                    {"name": "dup", "transport": "stdio", "command": "npx", "args": ["pkg-a"]},
                    {"name": "off", "enabled": false, "transport": "stdio", "command": "npx", "args": ["pkg-z"]},
                    {"name": "web", "transport": "http", "url": "http://localhost:1234"}
                ]
            }
        });
        let config: CoreConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.mcp_npm_packages(), vec!["pkg-a", "pkg-b"]);
    }
}
