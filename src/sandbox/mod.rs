pub mod paths;
pub mod provider;
pub mod retry;
pub mod snapshot;

pub use provider::{
    ChartArtifact, CodeRunOutput, ExecOutput, FileEntry, HttpSandboxProvider, ImageSpec,
    ProviderError, SandboxInfo, SandboxProvider, SandboxState, SnapshotInfo,
};
pub use retry::{RetryPolicy, SandboxError};

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::mcp::McpRegistry;
use crate::stubgen;

const START_STOP_TIMEOUT_S: u64 = 60;
const DEFAULT_AUTO_INSTALL_RETRIES: u32 = 2;

/// Result of one code execution in the sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: f64,
    pub files_created: Vec<String>,
    pub execution_id: String,
    pub code_hash: String,
    pub charts: Vec<ChartArtifact>,
}

#[derive(Debug, Clone)]
pub struct BashResult {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub bash_id: String,
    pub command_hash: String,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct GrepMatch {
    pub file: String,
    pub line_number: u64,
    pub content: String,
}

/// Stable capability surface over the remote sandbox provider for one
/// workspace. Every provider call goes through the retry gate.
pub struct SandboxDriver {
    config: Arc<CoreConfig>,
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: StdRwLock<Option<String>>,
    work_dir: StdRwLock<String>,
    execution_count: AtomicU64,
    bash_execution_count: AtomicU64,
    reconnect_lock: Mutex<()>,
    reconnect_epoch: AtomicU64,
    tool_refresh_lock: Mutex<()>,
}

impl SandboxDriver {
    pub fn new(config: Arc<CoreConfig>, provider: Arc<dyn SandboxProvider>) -> Self {
        let work_dir = config.filesystem.working_directory.clone();
        Self {
            config,
            provider,
            sandbox_id: StdRwLock::new(None),
            work_dir: StdRwLock::new(work_dir),
            execution_count: AtomicU64::new(0),
            bash_execution_count: AtomicU64::new(0),
            reconnect_lock: Mutex::new(()),
            reconnect_epoch: AtomicU64::new(0),
            tool_refresh_lock: Mutex::new(()),
        }
    }

    pub fn sandbox_id(&self) -> Option<String> {
        self.sandbox_id.read().expect("sandbox_id lock").clone()
    }

    pub fn work_dir(&self) -> String {
        self.work_dir.read().expect("work_dir lock").clone()
    }

    pub fn filesystem(&self) -> &crate::config::FilesystemConfig {
        &self.config.filesystem
    }

    fn set_sandbox(&self, info: &SandboxInfo) {
        *self.sandbox_id.write().expect("sandbox_id lock") = Some(info.id.clone());
        if !info.work_dir.is_empty() {
            *self.work_dir.write().expect("work_dir lock") = info.work_dir.clone();
        }
    }

    /// The transport retry gate. Safe operations are retried up to
    /// [`retry::MAX_ATTEMPTS`] with doubling backoff; unsafe operations
    /// surface [`SandboxError::Transient`] instead of retrying. At most one
    /// reconnect is attempted per gated call.
    fn gate<'a, T, F, Fut>(
        &'a self,
        policy: RetryPolicy,
        allow_reconnect: bool,
        op: F,
    ) -> futures_util::future::BoxFuture<'a, Result<T, SandboxError>>
    where
        F: Fn() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'a,
        T: Send + 'a,
    {
        Box::pin(async move {
            let mut delay = Duration::from_millis(retry::INITIAL_BACKOFF_MS);
            let mut reconnected = false;

            for attempt in 1..=retry::MAX_ATTEMPTS {
                match op().await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        if !e.is_transient() {
                            return Err(SandboxError::Provider(e));
                        }

                        if allow_reconnect && !reconnected {
                            // Boxed so gated calls inside reconnect() do not
                            // recurse into this future's type.
                            let reconnect: futures_util::future::BoxFuture<'_, Result<(), SandboxError>> =
                                Box::pin(self.ensure_connected());
                            match reconnect.await {
                                Ok(()) => reconnected = true,
                                Err(reconnect_error) => {
                                    debug!(error = %reconnect_error, "reconnect attempt failed during retry");
                                }
                            }
                        }

                        if policy == RetryPolicy::Unsafe {
                            warn!(
                                attempt,
                                error = %e,
                                "sandbox disconnected during unsafe operation; not retrying automatically"
                            );
                            return Err(SandboxError::Transient { reconnected });
                        }

                        if attempt == retry::MAX_ATTEMPTS {
                            return Err(SandboxError::Transient { reconnected });
                        }

                        debug!(attempt, error = %e, "retrying provider call after transient error");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
            unreachable!("retry loop returns on final attempt")
        })
    }

    /// Reconnect the current sandbox, coalescing concurrent attempts: callers
    /// that arrive while a reconnect is in flight wait for it and skip their
    /// own.
    pub async fn ensure_connected(&self) -> Result<(), SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };

        let epoch_before = self.reconnect_epoch.load(Ordering::SeqCst);
        let _guard = self.reconnect_lock.lock().await;
        if self.reconnect_epoch.load(Ordering::SeqCst) != epoch_before {
            // Another caller reconnected while we waited for the lock.
            return Ok(());
        }

        let result = self.reconnect(&sandbox_id).await;
        if result.is_ok() {
            self.reconnect_epoch.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    /// Reconnect to an existing (typically stopped) sandbox. Fast path for
    /// workspace restart: no uploads, no tool installs.
    pub async fn reconnect(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        info!(%sandbox_id, "reconnecting to sandbox");

        let provider = Arc::clone(&self.provider);
        let id = sandbox_id.to_string();
        let info = self
            .gate(RetryPolicy::Safe, false, move || {
                let provider = Arc::clone(&provider);
                let id = id.clone();
                async move { provider.get_sandbox(&id).await }
            })
            .await
            .map_err(|e| SandboxError::Missing {
                sandbox_id: sandbox_id.to_string(),
                message: e.to_string(),
            })?;

        self.set_sandbox(&info);

        match info.state {
            SandboxState::Started => {
                info!(%sandbox_id, "sandbox already started, skipping start");
            }
            SandboxState::Stopped | SandboxState::Starting => {
                info!(%sandbox_id, state = ?info.state, "starting stopped sandbox");
                let provider = Arc::clone(&self.provider);
                let id = sandbox_id.to_string();
                self.gate(RetryPolicy::Safe, false, move || {
                    let provider = Arc::clone(&provider);
                    let id = id.clone();
                    async move { provider.start_sandbox(&id, START_STOP_TIMEOUT_S).await }
                })
                .await?;
            }
            other => {
                return Err(SandboxError::InvalidState(format!("{other:?}")));
            }
        }

        info!(%sandbox_id, "sandbox started from stopped state");
        Ok(())
    }

    /// Create the sandbox (snapshot fast path with default-image fallback)
    /// and bootstrap the workspace directory structure. Returns the snapshot
    /// name when one was used.
    pub async fn setup_workspace(&self) -> Result<Option<String>, SandboxError> {
        info!("setting up sandbox workspace");

        let mut snapshot = self.ensure_snapshot().await;

        if let Some(name) = snapshot.clone() {
            info!(snapshot = %name, "creating sandbox from snapshot");
            let provider = Arc::clone(&self.provider);
            let from_snapshot = {
                let name = name.clone();
                self.gate(RetryPolicy::Safe, false, move || {
                    let provider = Arc::clone(&provider);
                    let name = name.clone();
                    async move { provider.create_sandbox(Some(&name)).await }
                })
                .await
            };
            match from_snapshot {
                Ok(info) => self.set_sandbox(&info),
                Err(e) => {
                    warn!(error = %e, "failed to create from snapshot, falling back to default image");
                    snapshot = None;
                }
            }
        }

        if snapshot.is_none() {
            info!("creating sandbox from default image");
            let provider = Arc::clone(&self.provider);
            let info = self
                .gate(RetryPolicy::Safe, false, move || {
                    let provider = Arc::clone(&provider);
                    async move { provider.create_sandbox(None).await }
                })
                .await?;
            self.set_sandbox(&info);
        }

        self.create_workspace_dirs().await;

        if snapshot.is_none() {
            // Cold start without a prebuilt image: install the dependency set
            // the snapshot would have carried.
            self.install_dependencies().await?;
        }

        info!(sandbox_id = ?self.sandbox_id(), snapshot = ?snapshot, "sandbox workspace ready");
        Ok(snapshot)
    }

    async fn ensure_snapshot(&self) -> Option<String> {
        if !self.config.sandbox.snapshot_enabled {
            debug!("snapshot feature disabled in config");
            return None;
        }

        let mcp_packages = self.config.mcp_npm_packages();
        let name = snapshot::snapshot_name(&self.config.sandbox, &mcp_packages);
        info!(snapshot = %name, "checking for snapshot");

        let provider = Arc::clone(&self.provider);
        let snapshots = self
            .gate(RetryPolicy::Safe, false, move || {
                let provider = Arc::clone(&provider);
                async move { provider.list_snapshots().await }
            })
            .await;

        let mut exists = false;
        match snapshots {
            Ok(snapshots) => {
                if let Some(existing) = snapshots.iter().find(|s| s.name == name) {
                    match existing.state.as_str() {
                        "build_failed" => {
                            warn!(
                                snapshot = %name,
                                error = ?existing.error_reason,
                                "found failed snapshot, will recreate"
                            );
                            let provider = Arc::clone(&self.provider);
                            let delete_name = name.clone();
                            if let Err(e) = self
                                .gate(RetryPolicy::Safe, false, move || {
                                    let provider = Arc::clone(&provider);
                                    let delete_name = delete_name.clone();
                                    async move { provider.delete_snapshot(&delete_name).await }
                                })
                                .await
                            {
                                warn!(error = %e, "could not delete failed snapshot");
                            }
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                        "active" | "building" => exists = true,
                        other => {
                            warn!(snapshot = %name, state = %other, "snapshot in unexpected state");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "error listing snapshots"),
        }

        if exists {
            info!(snapshot = %name, "using existing snapshot");
            return Some(name);
        }

        if !self.config.sandbox.snapshot_auto_create {
            warn!("snapshot not found and auto_create disabled");
            return None;
        }

        info!(snapshot = %name, "creating snapshot");
        let image = snapshot::snapshot_image(&self.config.sandbox, &mcp_packages);
        let provider = Arc::clone(&self.provider);
        let create_name = name.clone();
        let created = self
            .gate(RetryPolicy::Safe, false, move || {
                let provider = Arc::clone(&provider);
                let create_name = create_name.clone();
                let image = image.clone();
                async move { provider.create_snapshot(&create_name, &image).await }
            })
            .await;

        match created {
            Ok(()) => Some(name),
            Err(e) if e.to_string().to_lowercase().contains("already exists") => {
                info!(snapshot = %name, "snapshot already exists, will use it");
                Some(name)
            }
            Err(e) => {
                warn!(error = %e, "failed to create snapshot");
                None
            }
        }
    }

    async fn create_workspace_dirs(&self) {
        let work_dir = self.work_dir();
        let directories = [
            format!("{work_dir}/tools"),
            format!("{work_dir}/tools/docs"),
            format!("{work_dir}/results"),
            format!("{work_dir}/data"),
            format!("{work_dir}/code"),
            format!("{work_dir}/_internal/src"),
        ];

        join_all(directories.iter().map(|dir| async move {
            if let Err(e) = self.exec_command(&format!("mkdir -p {}", shell_quote(dir))).await {
                warn!(directory = %dir, error = %e, "error creating directory");
            }
        }))
        .await;
    }

    async fn install_dependencies(&self) -> Result<(), SandboxError> {
        let packages = snapshot::DEFAULT_DEPENDENCIES.join(" ");
        info!("installing sandbox dependencies");
        let output = self
            .exec_command(&format!("uv pip install -q {packages}"))
            .await?;
        if output.exit_code != 0 {
            warn!(stderr = %output.stderr, "dependency install reported errors");
        }
        Ok(())
    }

    /// Install generated tool stubs, docs and the in-sandbox MCP client.
    /// Runs on first setup and on any explicit refresh; serialized by the
    /// tool-refresh mutex.
    pub async fn setup_tools_and_mcp(&self, registry: &McpRegistry) -> Result<(), SandboxError> {
        info!("setting up tools and MCP client");
        let _guard = self.tool_refresh_lock.lock().await;
        self.upload_mcp_server_files().await?;
        self.upload_internal_packages().await?;
        self.install_tool_modules(registry).await?;
        info!(sandbox_id = ?self.sandbox_id(), "tools and MCP client ready");
        Ok(())
    }

    pub async fn refresh_tools(&self, registry: &McpRegistry) -> Result<(), SandboxError> {
        if self.sandbox_id().is_none() {
            return Err(SandboxError::NotInitialized);
        }
        let _guard = self.tool_refresh_lock.lock().await;
        self.upload_mcp_server_files().await?;
        self.upload_internal_packages().await?;
        self.install_tool_modules(registry).await?;
        Ok(())
    }

    /// Upload local Python MCP server scripts referenced by stdio configs so
    /// the in-sandbox client can spawn them.
    async fn upload_mcp_server_files(&self) -> Result<(), SandboxError> {
        let work_dir = self.work_dir();
        for server in self.config.enabled_mcp_servers() {
            let Some(local_path) = stubgen::local_python_server_path(server) else {
                continue;
            };
            let Ok(content) = tokio::fs::read(&local_path).await else {
                debug!(server = %server.name, path = %local_path, "local MCP server script not found");
                continue;
            };
            let file_name = local_path.rsplit('/').next().unwrap_or(&local_path);
            let sandbox_path = format!("{work_dir}/mcp_servers/{file_name}");
            self.exec_command(&format!("mkdir -p {}", shell_quote(&format!("{work_dir}/mcp_servers"))))
                .await?;
            self.upload_file_bytes(&sandbox_path, &content).await?;
            info!(server = %server.name, %sandbox_path, "uploaded MCP server script");
        }
        Ok(())
    }

    /// Upload internal Python packages used by generated sandbox code, when a
    /// local bundle directory exists.
    async fn upload_internal_packages(&self) -> Result<(), SandboxError> {
        let local_root = std::path::Path::new("sandbox_internal");
        if !local_root.is_dir() {
            debug!("no sandbox_internal bundle present, skipping");
            return Ok(());
        }

        let work_dir = self.work_dir();
        let mut stack = vec![local_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| SandboxError::Provider(ProviderError::Other(e.to_string())))?;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(local_root)
                    .expect("entry is under local root")
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = tokio::fs::read(&path)
                    .await
                    .map_err(|e| SandboxError::Provider(ProviderError::Other(e.to_string())))?;
                self.upload_file_bytes(&format!("{work_dir}/_internal/src/{rel}"), &content)
                    .await?;
            }
        }
        Ok(())
    }

    async fn install_tool_modules(&self, registry: &McpRegistry) -> Result<(), SandboxError> {
        let work_dir = self.work_dir();
        let tools_by_server = registry.all_tools().await;

        // The package marker plus the shared client every stub delegates to.
        self.upload_file_bytes(&format!("{work_dir}/tools/__init__.py"), b"")
            .await?;
        let server_configs: Vec<_> = self
            .config
            .enabled_mcp_servers()
            .into_iter()
            .cloned()
            .collect();
        let client_code = stubgen::generate_mcp_client(&server_configs, &work_dir);
        self.upload_file_bytes(
            &format!("{work_dir}/tools/mcp_client.py"),
            client_code.as_bytes(),
        )
        .await?;

        for (server_name, tools) in &tools_by_server {
            if tools.is_empty() {
                continue;
            }
            let module = stubgen::generate_tool_module(server_name, tools);
            let module_path = format!(
                "{work_dir}/tools/{}_tools.py",
                stubgen::sanitize_identifier(server_name)
            );
            self.upload_file_bytes(&module_path, module.as_bytes())
                .await?;

            for tool in tools {
                let doc = stubgen::generate_tool_documentation(tool);
                let doc_path = format!("{work_dir}/tools/docs/{server_name}.{}.md", tool.name);
                self.upload_file_bytes(&doc_path, doc.as_bytes()).await?;
            }
            info!(server = %server_name, tool_count = tools.len(), "installed tool module");
        }

        Ok(())
    }

    /// Execute Python code with auto-install of missing imports.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<u64>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute_with_options(code, timeout, true, DEFAULT_AUTO_INSTALL_RETRIES)
            .await
    }

    pub async fn execute_with_options(
        &self,
        code: &str,
        timeout: Option<u64>,
        auto_install: bool,
        max_retries: u32,
    ) -> Result<ExecutionResult, SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };

        let code_hash = short_hash(code);
        let timeout_s = timeout.unwrap_or(self.config.security.max_execution_time);
        let mut retries_left = max_retries;

        loop {
            let execution_id = format!(
                "exec_{:04}",
                self.execution_count.fetch_add(1, Ordering::SeqCst) + 1
            );
            info!(%execution_id, %code_hash, code_length = code.len(), "executing code");
            let started = Instant::now();

            let work_dir = self.work_dir();
            let code_path = format!("{work_dir}/code/{execution_id}.py");
            self.upload_file_bytes(&code_path, code.as_bytes()).await?;

            let files_before = self.list_result_files().await;

            let mut env: HashMap<String, String> = HashMap::new();
            env.insert(
                "PYTHONPATH".to_string(),
                format!("{work_dir}:{work_dir}/_internal"),
            );
            // MCP env vars resolved host-side for direct execution; the
            // generated client resolves its own inside the sandbox.
            env.extend(self.config.resolved_mcp_env());

            let provider = Arc::clone(&self.provider);
            let run = {
                let sandbox_id = sandbox_id.clone();
                let code = code.to_string();
                let env = env.clone();
                self.gate(RetryPolicy::Unsafe, true, move || {
                    let provider = Arc::clone(&provider);
                    let sandbox_id = sandbox_id.clone();
                    let code = code.clone();
                    let env = env.clone();
                    async move { provider.code_run(&sandbox_id, &code, &env, timeout_s).await }
                })
                .await
            };

            let output = match run {
                Ok(output) => output,
                // Unsafe + transient must reach the caller unchanged so it can
                // decide whether the logical operation is safe to re-run.
                Err(e @ SandboxError::Transient { .. }) => return Err(e),
                Err(e) => {
                    let duration = started.elapsed().as_secs_f64();
                    warn!(%execution_id, error = %e, "code execution failed");
                    return Ok(ExecutionResult {
                        success: false,
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        duration,
                        files_created: vec![],
                        execution_id,
                        code_hash,
                        charts: vec![],
                    });
                }
            };

            let success = output.exit_code == 0;

            if !success && auto_install && retries_left > 0 {
                let missing = detect_missing_imports(&output.stderr);
                if !missing.is_empty() {
                    info!(
                        %execution_id,
                        packages = ?missing,
                        retries_left,
                        "attempting auto-install and retry"
                    );
                    for package in &missing {
                        self.install_package(package).await;
                    }
                    retries_left -= 1;
                    continue;
                }
            }

            let files_after = self.list_result_files().await;
            let files_created = files_after
                .into_iter()
                .filter(|f| !files_before.contains(f))
                .collect::<Vec<_>>();

            let duration = started.elapsed().as_secs_f64();
            info!(
                %execution_id,
                success,
                duration,
                files_created = files_created.len(),
                charts_captured = output.charts.len(),
                "code execution completed"
            );

            return Ok(ExecutionResult {
                success,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                duration,
                files_created,
                execution_id,
                code_hash,
                charts: output.charts,
            });
        }
    }

    async fn install_package(&self, package: &str) {
        info!(%package, "auto-installing missing package");
        match self
            .exec_command(&format!("uv pip install -q {}", shell_quote(package)))
            .await
        {
            Ok(output) if output.exit_code == 0 => {
                info!(%package, "installed package");
            }
            Ok(output) => {
                warn!(%package, exit_code = output.exit_code, "failed to install package");
            }
            Err(e) => warn!(%package, error = %e, "failed to install package"),
        }
    }

    /// Execute a bash command via a generated script and a Python subprocess
    /// wrapper that enforces the timeout (exit 124).
    pub async fn execute_bash(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<BashResult, SandboxError> {
        let bash_id = format!(
            "bash_{:04}",
            self.bash_execution_count.fetch_add(1, Ordering::SeqCst) + 1
        );
        let command_hash = short_hash(command);
        let work_dir = self.work_dir();
        let cwd = working_dir.unwrap_or(&work_dir).to_string();

        info!(%bash_id, %command_hash, command = %truncate(command, 100), %cwd, "executing bash command");

        let timestamp = chrono::Utc::now().to_rfc3339();
        let script = format!(
            "#!/bin/bash\n\
             # Bash Execution Log\n\
             # ID: {bash_id}\n\
             # Working Directory: {cwd}\n\
             # Timestamp: {timestamp}\n\
             # Command Hash: {command_hash}\n\
             \n\
             set -e\n\
             cd {cwd} && {command}\n"
        );

        let script_path = format!("{work_dir}/code/{bash_id}.sh");
        self.upload_file_bytes(&script_path, script.as_bytes())
            .await?;

        let wrapper = format!(
            r#"import subprocess
import sys

try:
    result = subprocess.run(
        ['bash', '{script_path}'],
        capture_output=True,
        text=True,
        timeout={timeout_s}
    )
    print(result.stdout, end='')
    sys.stderr.write(result.stderr)
    sys.exit(result.returncode)
except subprocess.TimeoutExpired:
    sys.stderr.write("Command timed out after {timeout_s} seconds")
    sys.exit(124)
except (OSError, subprocess.SubprocessError) as e:
    sys.stderr.write(f"Error executing command: {{e}}")
    sys.exit(1)
"#
        );

        let result = self
            .execute_with_options(&wrapper, Some(timeout_s + 10), false, 0)
            .await?;

        Ok(BashResult {
            success: result.success,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            bash_id,
            command_hash,
        })
    }

    /// Run a raw shell command through the provider exec API (safe policy).
    pub async fn exec_command(&self, command: &str) -> Result<ExecOutput, SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };
        let provider = Arc::clone(&self.provider);
        let command = command.to_string();
        self.gate(RetryPolicy::Safe, true, move || {
            let provider = Arc::clone(&provider);
            let sandbox_id = sandbox_id.clone();
            let command = command.clone();
            async move { provider.exec(&sandbox_id, &command).await }
        })
        .await
    }

    pub async fn upload_file_bytes(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };
        let provider = Arc::clone(&self.provider);
        let path = path.to_string();
        let content = content.to_vec();
        self.gate(RetryPolicy::Safe, true, move || {
            let provider = Arc::clone(&provider);
            let sandbox_id = sandbox_id.clone();
            let path = path.clone();
            let content = content.clone();
            async move { provider.upload_file(&sandbox_id, &path, &content).await }
        })
        .await
    }

    /// Download raw bytes; `Ok(None)` when the file does not exist.
    pub async fn download_file_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };
        let provider = Arc::clone(&self.provider);
        let path = path.to_string();
        let result = self
            .gate(RetryPolicy::Safe, true, move || {
                let provider = Arc::clone(&provider);
                let sandbox_id = sandbox_id.clone();
                let path = path.clone();
                async move { provider.download_file(&sandbox_id, &path).await }
            })
            .await;
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(SandboxError::Provider(ProviderError::Api { status: 404, .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read_file_text(&self, path: &str) -> Result<Option<String>, SandboxError> {
        let normalized = paths::normalize_path(&self.config.filesystem, path);
        Ok(self
            .download_file_bytes(&normalized)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn write_file_text(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let normalized = self.validated(path)?;
        self.upload_file_bytes(&normalized, content.as_bytes()).await
    }

    /// Single-occurrence string replacement with the usual guard rails:
    /// old and new must differ, old must occur, and ambiguity requires
    /// `replace_all`.
    pub async fn edit_file_text(
        &self,
        path: &str,
        old_string: &str,
        new_string: &str,
        replace_all: bool,
    ) -> Result<(), SandboxError> {
        let normalized = self.validated(path)?;

        let Some(content) = self
            .download_file_bytes(&normalized)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        else {
            return Err(SandboxError::Rejected("File not found".into()));
        };

        if old_string == new_string {
            return Err(SandboxError::Rejected(
                "old_string and new_string must be different".into(),
            ));
        }
        if !content.contains(old_string) {
            return Err(SandboxError::Rejected(format!(
                "old_string not found in file: {path}"
            )));
        }
        if !replace_all && content.matches(old_string).count() > 1 {
            return Err(SandboxError::Rejected(
                "old_string found multiple times and requires more context to uniquely identify the intended match"
                    .into(),
            ));
        }

        let updated = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };

        if updated == content {
            return Err(SandboxError::Rejected("Edit produced no changes".into()));
        }

        self.upload_file_bytes(&normalized, updated.as_bytes()).await
    }

    pub async fn list_directory(&self, directory: &str) -> Result<Vec<DirEntry>, SandboxError> {
        if self.config.filesystem.enable_path_validation
            && !paths::validate_path(&self.config.filesystem, directory)
        {
            return Err(SandboxError::Rejected(format!(
                "Access denied: {directory} is not in allowed directories"
            )));
        }
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };
        let normalized = paths::normalize_path(&self.config.filesystem, directory);
        let provider = Arc::clone(&self.provider);
        let list_path = normalized.clone();
        let entries = self
            .gate(RetryPolicy::Safe, true, move || {
                let provider = Arc::clone(&provider);
                let sandbox_id = sandbox_id.clone();
                let list_path = list_path.clone();
                async move { provider.list_files(&sandbox_id, &list_path).await }
            })
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| DirEntry {
                path: paths::virtualize_path(
                    &self.config.filesystem,
                    &format!("{normalized}/{}", entry.name),
                ),
                name: entry.name,
                is_dir: entry.is_dir,
            })
            .collect())
    }

    pub async fn create_directory(&self, dirpath: &str) -> Result<(), SandboxError> {
        let normalized = self.validated(dirpath)?;
        self.exec_command(&format!("mkdir -p {}", shell_quote(&normalized)))
            .await
            .map(|_| ())
    }

    /// Glob through a short generated wrapper around Python's glob module.
    pub async fn glob_files(
        &self,
        pattern: &str,
        path: &str,
        allow_denied: bool,
    ) -> Result<Vec<String>, SandboxError> {
        let root = paths::normalize_search_path(&self.config.filesystem, path);
        let allowed = if allow_denied {
            paths::validate_path_allow_denied(&self.config.filesystem, &root)
        } else {
            paths::validate_path(&self.config.filesystem, &root)
        };
        if self.config.filesystem.enable_path_validation && !allowed {
            return Err(SandboxError::Rejected(format!(
                "Access denied: {path} is not in allowed directories"
            )));
        }

        let wrapper = format!(
            r#"import glob
import json
import os

root = {root:?}
pattern = {pattern:?}
matches = sorted(glob.glob(os.path.join(root, pattern), recursive=True))
print(json.dumps([m for m in matches if os.path.isfile(m)]))
"#
        );
        let output = self.run_wrapper(&wrapper).await?;
        let parsed: Vec<String> = serde_json::from_str(output.trim()).unwrap_or_default();
        Ok(parsed
            .into_iter()
            .map(|m| paths::virtualize_path(&self.config.filesystem, &m))
            .collect())
    }

    /// Grep via the sandbox's ripgrep, JSON output parsed into matches.
    pub async fn grep_content(
        &self,
        pattern: &str,
        path: &str,
        include: Option<&str>,
        allow_denied: bool,
    ) -> Result<Vec<GrepMatch>, SandboxError> {
        let root = paths::normalize_search_path(&self.config.filesystem, path);
        let allowed = if allow_denied {
            paths::validate_path_allow_denied(&self.config.filesystem, &root)
        } else {
            paths::validate_path(&self.config.filesystem, &root)
        };
        if self.config.filesystem.enable_path_validation && !allowed {
            return Err(SandboxError::Rejected(format!(
                "Access denied: {path} is not in allowed directories"
            )));
        }

        let include_arg = include
            .map(|glob| format!(", '--glob', {glob:?}"))
            .unwrap_or_default();
        let wrapper = format!(
            r#"import json
import subprocess

result = subprocess.run(
    ['rg', '--json', '--max-count', '200', {pattern:?}{include_arg}, {root:?}],
    capture_output=True,
    text=True,
)
matches = []
for line in result.stdout.splitlines():
    try:
        event = json.loads(line)
    except json.JSONDecodeError:
        continue
    if event.get('type') != 'match':
        continue
    data = event['data']
    matches.append({{
        'file': data['path']['text'],
        'line_number': data['line_number'],
        'content': data['lines'].get('text', '').rstrip('\n'),
    }})
print(json.dumps(matches))
"#
        );
        let output = self.run_wrapper(&wrapper).await?;
        let parsed: Vec<Value> = serde_json::from_str(output.trim()).unwrap_or_default();
        Ok(parsed
            .into_iter()
            .filter_map(|m| {
                Some(GrepMatch {
                    file: paths::virtualize_path(
                        &self.config.filesystem,
                        m.get("file")?.as_str()?,
                    ),
                    line_number: m.get("line_number")?.as_u64()?,
                    content: m.get("content")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    /// Run a short read-only wrapper script and return its stdout. Search
    /// wrappers are idempotent, so the safe policy applies.
    async fn run_wrapper(&self, code: &str) -> Result<String, SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Err(SandboxError::NotInitialized);
        };
        let provider = Arc::clone(&self.provider);
        let code = code.to_string();
        let output = self
            .gate(RetryPolicy::Safe, true, move || {
                let provider = Arc::clone(&provider);
                let sandbox_id = sandbox_id.clone();
                let code = code.clone();
                async move {
                    provider
                        .code_run(&sandbox_id, &code, &HashMap::new(), 60)
                        .await
                }
            })
            .await?;
        Ok(output.stdout)
    }

    async fn list_result_files(&self) -> Vec<String> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return vec![];
        };
        let work_dir = self.work_dir();
        let provider = Arc::clone(&self.provider);
        let results_dir = format!("{work_dir}/results");
        let listed = self
            .gate(RetryPolicy::Safe, true, move || {
                let provider = Arc::clone(&provider);
                let sandbox_id = sandbox_id.clone();
                let results_dir = results_dir.clone();
                async move { provider.list_files(&sandbox_id, &results_dir).await }
            })
            .await;
        match listed {
            Ok(entries) => entries
                .into_iter()
                .map(|entry| format!("results/{}", entry.name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "error listing result files");
                vec![]
            }
        }
    }

    /// Stop the sandbox without deleting it, so a later reconnect is fast.
    pub async fn stop_sandbox(&self) -> Result<(), SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Ok(());
        };

        let provider = Arc::clone(&self.provider);
        let check_id = sandbox_id.clone();
        if let Ok(info) = self
            .gate(RetryPolicy::Safe, false, move || {
                let provider = Arc::clone(&provider);
                let check_id = check_id.clone();
                async move { provider.get_sandbox(&check_id).await }
            })
            .await
        {
            if info.state == SandboxState::Stopped {
                info!(%sandbox_id, "sandbox already stopped");
                return Ok(());
            }
        }

        info!(%sandbox_id, "stopping sandbox");
        let provider = Arc::clone(&self.provider);
        let stop_id = sandbox_id.clone();
        if let Err(e) = self
            .gate(RetryPolicy::Safe, false, move || {
                let provider = Arc::clone(&provider);
                let stop_id = stop_id.clone();
                async move { provider.stop_sandbox(&stop_id, START_STOP_TIMEOUT_S).await }
            })
            .await
        {
            // The sandbox may already be gone; a failed stop is not fatal.
            warn!(%sandbox_id, error = %e, "failed to stop sandbox");
        }
        Ok(())
    }

    /// Delete the sandbox entirely. Used by workspace deletion only.
    pub async fn delete_sandbox(&self) -> Result<(), SandboxError> {
        let Some(sandbox_id) = self.sandbox_id() else {
            return Ok(());
        };
        info!(%sandbox_id, "deleting sandbox");
        let provider = Arc::clone(&self.provider);
        let delete_id = sandbox_id.clone();
        self.gate(RetryPolicy::Safe, false, move || {
            let provider = Arc::clone(&provider);
            let delete_id = delete_id.clone();
            async move { provider.delete_sandbox(&delete_id).await }
        })
        .await?;
        *self.sandbox_id.write().expect("sandbox_id lock") = None;
        Ok(())
    }

    fn validated(&self, path: &str) -> Result<String, SandboxError> {
        if self.config.filesystem.enable_path_validation
            && !paths::validate_path(&self.config.filesystem, path)
        {
            return Err(SandboxError::Rejected(format!(
                "Access denied: {path} is not in allowed directories"
            )));
        }
        Ok(paths::normalize_path(&self.config.filesystem, path))
    }
}

static MISSING_IMPORT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"ModuleNotFoundError: No module named ['"]([^'"]+)['"]"#).expect("regex"),
        Regex::new(r#"ImportError: No module named ['"]([^'"]+)['"]"#).expect("regex"),
    ]
});

/// Extract base package names from import errors in stderr, deduplicated.
pub fn detect_missing_imports(stderr: &str) -> Vec<String> {
    let mut packages: Vec<String> = MISSING_IMPORT_RES
        .iter()
        .flat_map(|re| re.captures_iter(stderr))
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .split('.')
                .next()
                .unwrap_or(m.as_str())
                .to_string()
        })
        .collect();
    packages.sort();
    packages.dedup();
    packages
}

/// POSIX single-quote escaping for shell arguments.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn short_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))[..16].to_string()
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn missing_imports_are_extracted_and_deduped() {
        let stderr = "Traceback (most recent call last):\n\
            ModuleNotFoundError: No module named 'polars'\n\
            ModuleNotFoundError: No module named 'polars.io'\n\
            ImportError: No module named \"yfinance\"";
        assert_eq!(detect_missing_imports(stderr), vec!["polars", "yfinance"]);
        assert!(detect_missing_imports("SyntaxError: invalid syntax").is_empty());
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    /// Provider double that fails a configurable number of times per call
    /// kind and counts reconnect-relevant calls.
    struct FlakyProvider {
        exec_failures: AtomicU32,
        code_run_failures: AtomicU32,
        get_calls: AtomicU32,
        start_calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(exec_failures: u32, code_run_failures: u32) -> Self {
            Self {
                exec_failures: AtomicU32::new(exec_failures),
                code_run_failures: AtomicU32::new(code_run_failures),
                get_calls: AtomicU32::new(0),
                start_calls: AtomicU32::new(0),
            }
        }

        fn transient() -> ProviderError {
            ProviderError::Api {
                status: 503,
                message: "service unavailable".into(),
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for FlakyProvider {
        async fn create_sandbox(&self, _: Option<&str>) -> Result<SandboxInfo, ProviderError> {
            Ok(SandboxInfo {
                id: "sb-1".into(),
                state: SandboxState::Started,
                work_dir: "/home/sandbox".into(),
            })
        }
        async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, ProviderError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SandboxInfo {
                id: id.into(),
                state: SandboxState::Stopped,
                work_dir: "/home/sandbox".into(),
            })
        }
        async fn start_sandbox(&self, _: &str, _: u64) -> Result<(), ProviderError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_sandbox(&self, _: &str, _: u64) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn delete_sandbox(&self, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn exec(&self, _: &str, _: &str) -> Result<ExecOutput, ProviderError> {
            if self.exec_failures.load(Ordering::SeqCst) > 0 {
                self.exec_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Self::transient());
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: "ok".into(),
                stderr: String::new(),
            })
        }
        async fn code_run(
            &self,
            _: &str,
            _: &str,
            _: &HashMap<String, String>,
            _: u64,
        ) -> Result<CodeRunOutput, ProviderError> {
            if self.code_run_failures.load(Ordering::SeqCst) > 0 {
                self.code_run_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Self::transient());
            }
            Ok(CodeRunOutput {
                exit_code: 0,
                stdout: "done".into(),
                ..Default::default()
            })
        }
        async fn upload_file(&self, _: &str, _: &str, _: &[u8]) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn download_file(&self, _: &str, _: &str) -> Result<Vec<u8>, ProviderError> {
            Err(ProviderError::Api {
                status: 404,
                message: "missing".into(),
            })
        }
        async fn list_files(&self, _: &str, _: &str) -> Result<Vec<FileEntry>, ProviderError> {
            Ok(vec![])
        }
        async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, ProviderError> {
            Ok(vec![])
        }
        async fn create_snapshot(&self, _: &str, _: &ImageSpec) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn delete_snapshot(&self, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn driver_with(provider: Arc<FlakyProvider>) -> SandboxDriver {
        let driver = SandboxDriver::new(Arc::new(CoreConfig::default()), provider);
        *driver.sandbox_id.write().unwrap() = Some("sb-1".into());
        driver
    }

    #[tokio::test]
    async fn safe_operations_retry_through_transient_errors() {
        let provider = Arc::new(FlakyProvider::new(2, 0));
        let driver = driver_with(Arc::clone(&provider));

        let output = driver.exec_command("echo hi").await.unwrap();
        assert_eq!(output.stdout, "ok");
    }

    #[tokio::test]
    async fn unsafe_operations_surface_transient_instead_of_retrying() {
        let provider = Arc::new(FlakyProvider::new(0, 1));
        let driver = driver_with(Arc::clone(&provider));

        let err = driver.execute("print('x')", Some(5)).await.unwrap_err();
        match err {
            SandboxError::Transient { reconnected } => assert!(reconnected),
            other => panic!("expected transient error, got {other:?}"),
        }
        // The single failure was not consumed by a retry.
        assert_eq!(provider.code_run_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_reconnects_coalesce_to_one_provider_call() {
        let provider = Arc::new(FlakyProvider::new(0, 0));
        let driver = Arc::new(driver_with(Arc::clone(&provider)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let driver = Arc::clone(&driver);
            handles.push(tokio::spawn(async move { driver.ensure_connected().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // One reconnect reached the provider; the rest coalesced.
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_files_read_as_none() {
        let provider = Arc::new(FlakyProvider::new(0, 0));
        let driver = driver_with(provider);
        assert!(driver.read_file_text("/results/absent.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn denied_paths_are_rejected_before_any_provider_call() {
        let provider = Arc::new(FlakyProvider::new(0, 0));
        let driver = driver_with(provider);
        let err = driver
            .write_file_text("/_internal/hack.py", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Rejected(_)));
    }
}
