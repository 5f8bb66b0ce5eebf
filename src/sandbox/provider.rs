use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("provider operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Substring fallback for transient transport failures. The typed checks in
/// [`ProviderError::is_transient`] are authoritative; this list only catches
/// errors that arrive as opaque text.
pub const TRANSIENT_MARKERS: &[&str] = &[
    "remote end closed connection",
    "remotedisconnected",
    "connection aborted",
    "connection reset",
    "broken pipe",
    "timed out",
    "timeout",
    "service unavailable",
    "502",
    "503",
    "504",
];

pub fn message_is_transient(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::Api { status, .. } => matches!(status, 502 | 503 | 504),
            ProviderError::Other(message) => message_is_transient(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Creating,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub state: SandboxState,
    pub work_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartArtifact {
    #[serde(rename = "type")]
    pub chart_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub png_base64: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeRunOutput {
    pub exit_code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub charts: Vec<ChartArtifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub error_reason: Option<String>,
}

/// Declarative image definition for snapshot builds.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSpec {
    pub base_image: String,
    pub run_commands: Vec<String>,
    pub pip_packages: Vec<String>,
    pub workdir: String,
}

/// Capability interface over the remote sandbox provider.
///
/// The driver and retry gate only ever talk to this trait; production wires
/// [`HttpSandboxProvider`], tests use an in-memory mock.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_sandbox(&self, snapshot: Option<&str>) -> Result<SandboxInfo, ProviderError>;
    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, ProviderError>;
    async fn start_sandbox(&self, sandbox_id: &str, timeout_s: u64) -> Result<(), ProviderError>;
    async fn stop_sandbox(&self, sandbox_id: &str, timeout_s: u64) -> Result<(), ProviderError>;
    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), ProviderError>;
    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, ProviderError>;
    async fn code_run(
        &self,
        sandbox_id: &str,
        code: &str,
        env: &HashMap<String, String>,
        timeout_s: u64,
    ) -> Result<CodeRunOutput, ProviderError>;
    async fn upload_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), ProviderError>;
    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, ProviderError>;
    async fn list_files(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, ProviderError>;
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, ProviderError>;
    async fn create_snapshot(&self, name: &str, image: &ImageSpec) -> Result<(), ProviderError>;
    async fn delete_snapshot(&self, name: &str) -> Result<(), ProviderError>;
}

/// reqwest-backed implementation against the provider REST API.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSandboxProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create_sandbox(&self, snapshot: Option<&str>) -> Result<SandboxInfo, ProviderError> {
        let body = match snapshot {
            Some(name) => json!({ "snapshot": name }),
            None => json!({}),
        };
        let response = self
            .authed(self.client.post(self.url("/v1/sandboxes")))
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, ProviderError> {
        let response = self
            .authed(self.client.get(self.url(&format!("/v1/sandboxes/{sandbox_id}"))))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn start_sandbox(&self, sandbox_id: &str, timeout_s: u64) -> Result<(), ProviderError> {
        let response = self
            .authed(
                self.client
                    .post(self.url(&format!("/v1/sandboxes/{sandbox_id}/start"))),
            )
            .json(&json!({ "timeout": timeout_s }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn stop_sandbox(&self, sandbox_id: &str, timeout_s: u64) -> Result<(), ProviderError> {
        let response = self
            .authed(
                self.client
                    .post(self.url(&format!("/v1/sandboxes/{sandbox_id}/stop"))),
            )
            .json(&json!({ "timeout": timeout_s }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let response = self
            .authed(
                self.client
                    .delete(self.url(&format!("/v1/sandboxes/{sandbox_id}"))),
            )
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, ProviderError> {
        let response = self
            .authed(
                self.client
                    .post(self.url(&format!("/v1/sandboxes/{sandbox_id}/exec"))),
            )
            .json(&json!({ "command": command }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn code_run(
        &self,
        sandbox_id: &str,
        code: &str,
        env: &HashMap<String, String>,
        timeout_s: u64,
    ) -> Result<CodeRunOutput, ProviderError> {
        let response = self
            .authed(
                self.client
                    .post(self.url(&format!("/v1/sandboxes/{sandbox_id}/code-run"))),
            )
            .json(&json!({ "code": code, "env": env, "timeout": timeout_s }))
            .timeout(Duration::from_secs(timeout_s + 30))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn upload_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let response = self
            .authed(
                self.client
                    .post(self.url(&format!("/v1/sandboxes/{sandbox_id}/files"))),
            )
            .json(&json!({ "path": path, "content": encoded }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .authed(
                self.client
                    .get(self.url(&format!("/v1/sandboxes/{sandbox_id}/files"))),
            )
            .query(&[("path", path)])
            .send()
            .await?;
        let body: serde_json::Value = Self::check(response).await?.json().await?;
        let encoded = body
            .get("content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProviderError::Other("malformed download response".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ProviderError::Other(format!("invalid base64 payload: {e}")))
    }

    async fn list_files(
        &self,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, ProviderError> {
        let response = self
            .authed(
                self.client
                    .get(self.url(&format!("/v1/sandboxes/{sandbox_id}/files/list"))),
            )
            .query(&[("path", path)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, ProviderError> {
        let response = self
            .authed(self.client.get(self.url("/v1/snapshots")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_snapshot(&self, name: &str, image: &ImageSpec) -> Result<(), ProviderError> {
        let response = self
            .authed(self.client.post(self.url("/v1/snapshots")))
            .json(&json!({ "name": name, "image": image }))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete_snapshot(&self, name: &str) -> Result<(), ProviderError> {
        let response = self
            .authed(self.client.delete(self.url(&format!("/v1/snapshots/{name}"))))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses_are_transient() {
        assert!(ProviderError::Api {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 404,
            message: "missing".into()
        }
        .is_transient());
    }

    #[test]
    fn substring_fallback_classifies_opaque_errors() {
        assert!(ProviderError::Other("Remote end closed connection without response".into())
            .is_transient());
        assert!(ProviderError::Other("connection reset by peer".into()).is_transient());
        assert!(ProviderError::Other("read timed out".into()).is_transient());
        assert!(!ProviderError::Other("no such file or directory".into()).is_transient());
    }
}
