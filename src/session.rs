use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::mcp::McpRegistry;
use crate::sandbox::{SandboxDriver, SandboxError, SandboxProvider};

/// The in-process runtime binding one workspace to its sandbox driver and
/// MCP registry. Owned exclusively by the workspace manager; the turn
/// pipeline borrows it for the duration of one request.
pub struct Session {
    workspace_id: String,
    driver: Arc<SandboxDriver>,
    registry: Arc<McpRegistry>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        workspace_id: &str,
        config: Arc<CoreConfig>,
        provider: Arc<dyn SandboxProvider>,
    ) -> Self {
        info!(%workspace_id, "created session");
        let registry = Arc::new(McpRegistry::new(&config.mcp.servers));
        let driver = Arc::new(SandboxDriver::new(config, provider));
        Self {
            workspace_id: workspace_id.to_string(),
            driver,
            registry,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn driver(&self) -> Arc<SandboxDriver> {
        Arc::clone(&self.driver)
    }

    pub fn registry(&self) -> Arc<McpRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn sandbox_id(&self) -> Option<String> {
        self.driver.sandbox_id()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Initialize the session. With a `sandbox_id` this reconnects to the
    /// existing sandbox in parallel with the MCP connections (fast path);
    /// otherwise a fresh sandbox is created and tools are installed once both
    /// setup legs complete. A second call is a no-op.
    pub async fn initialize(&self, sandbox_id: Option<&str>) -> Result<(), SandboxError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            warn!(workspace_id = %self.workspace_id, "session already initialized");
            return Ok(());
        }

        info!(
            workspace_id = %self.workspace_id,
            reconnecting = sandbox_id.is_some(),
            "initializing session"
        );

        match sandbox_id {
            Some(id) => {
                let (reconnected, ()) =
                    tokio::join!(self.driver.reconnect(id), self.registry.connect_all());
                reconnected?;
                info!(workspace_id = %self.workspace_id, sandbox_id = %id, "reconnected to existing sandbox");
            }
            None => {
                let (workspace, ()) =
                    tokio::join!(self.driver.setup_workspace(), self.registry.connect_all());
                workspace?;
                self.driver.setup_tools_and_mcp(&self.registry).await?;
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(workspace_id = %self.workspace_id, "session initialized");
        Ok(())
    }

    /// Stop the sandbox for persistence: the sandbox is stopped, not deleted,
    /// and the session is marked uninitialized so the next `initialize` goes
    /// through the reconnect path.
    pub async fn stop(&self) {
        info!(workspace_id = %self.workspace_id, "stopping session for persistence");

        if let Err(e) = self.driver.stop_sandbox().await {
            warn!(workspace_id = %self.workspace_id, error = %e, "error stopping sandbox");
        }
        self.registry.disconnect_all().await;
        self.initialized.store(false, Ordering::SeqCst);

        info!(workspace_id = %self.workspace_id, "session stopped");
    }

    /// Tear the session down completely, deleting the sandbox.
    pub async fn cleanup(&self) -> Result<(), SandboxError> {
        info!(workspace_id = %self.workspace_id, "cleaning up session");

        self.registry.disconnect_all().await;
        let result = self.driver.delete_sandbox().await;
        self.initialized.store(false, Ordering::SeqCst);

        info!(workspace_id = %self.workspace_id, "session cleaned up");
        result
    }
}
