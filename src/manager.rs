use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::db::workspace as ws_db;
use crate::db::workspace::WorkspaceRow;
use crate::error::{AppError, AppResult};
use crate::sandbox::SandboxProvider;
use crate::session::Session;
use crate::skills;
use crate::user_data::sync_user_data_to_sandbox;

struct ManagerState {
    /// In-memory session cache, workspace_id to live session.
    sessions: HashMap<Uuid, Arc<Session>>,
    /// Workspaces whose user data was already synced in this process.
    user_data_synced: HashSet<Uuid>,
}

/// Authoritative workspace lifecycle manager: the FSM over workspace status,
/// the session cache, and the idle-eviction worker.
///
/// One mutex guards cache mutations and FSM transitions; it is deliberately
/// held across sandbox/MCP initialization so conflicting transitions on the
/// same workspace serialize.
pub struct WorkspaceManager {
    config: Arc<CoreConfig>,
    provider: Arc<dyn SandboxProvider>,
    pool: PgPool,
    idle_timeout: i64,
    cleanup_interval: u64,
    state: Mutex<ManagerState>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkspaceManager {
    /// Create the manager handle. Callers keep the `Arc` and inject it via
    /// request extensions; there is no hidden global.
    pub fn init(
        config: Arc<CoreConfig>,
        provider: Arc<dyn SandboxProvider>,
        pool: PgPool,
        idle_timeout: i64,
        cleanup_interval: u64,
    ) -> Arc<Self> {
        info!(idle_timeout, cleanup_interval, "workspace manager initialized");
        Arc::new(Self {
            config,
            provider,
            pool,
            idle_timeout,
            cleanup_interval,
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                user_data_synced: HashSet::new(),
            }),
            worker: std::sync::Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn core_config(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.config)
    }

    /// Create a workspace with its dedicated sandbox: DB row in `creating`,
    /// session initialization and asset sync, then `running` with the
    /// sandbox id recorded. Failure marks the workspace `error`.
    pub async fn create_workspace(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
        config: Option<&Value>,
    ) -> AppResult<WorkspaceRow> {
        let mut state = self.state.lock().await;

        let workspace =
            ws_db::create_workspace(&self.pool, user_id, name, description, config).await?;
        let workspace_id = workspace.workspace_id;
        info!(%workspace_id, %user_id, "creating workspace");

        let session = Arc::new(Session::new(
            &workspace_id.to_string(),
            Arc::clone(&self.config),
            Arc::clone(&self.provider),
        ));

        if let Err(e) = session.initialize(None).await {
            error!(%workspace_id, error = %e, "failed to create sandbox for workspace");
            let _ = ws_db::update_workspace_status(&self.pool, workspace_id, "error", None).await;
            return Err(AppError::Sandbox(e));
        }

        self.sync_assets(&mut state, workspace_id, Some(user_id), &session, false)
            .await;

        let sandbox_id = session.sandbox_id();
        state.sessions.insert(workspace_id, Arc::clone(&session));

        let updated = ws_db::update_workspace_status(
            &self.pool,
            workspace_id,
            "running",
            sandbox_id.as_deref(),
        )
        .await?
        .ok_or(AppError::NotFound)?;

        info!(%workspace_id, sandbox_id = ?sandbox_id, "workspace created");
        Ok(updated)
    }

    /// The single session entry point used by the turn pipeline.
    ///
    /// Rejects terminal workspaces (`deleted`/`error`) and busy ones
    /// (`creating`/`stopping`); restarts stopped workspaces through the
    /// reconnect path; re-initializes dropped sessions for running ones.
    pub async fn get_session_for_workspace(
        &self,
        workspace_id: Uuid,
        user_id: Option<&str>,
    ) -> AppResult<Arc<Session>> {
        let mut state = self.state.lock().await;

        let workspace = ws_db::get_workspace(&self.pool, workspace_id)
            .await?
            .ok_or(AppError::NotFound)?;

        // The workspace owner's id drives user-data sync rather than the
        // request header.
        let sync_user_id = if workspace.user_id.is_empty() {
            user_id.map(str::to_string)
        } else {
            Some(workspace.user_id.clone())
        };
        debug!(
            %workspace_id,
            status = %workspace.status,
            in_cache = state.sessions.contains_key(&workspace_id),
            "get_session_for_workspace"
        );

        match workspace.status.as_str() {
            "deleted" => return Err(AppError::WorkspaceDeleted(workspace_id.to_string())),
            "error" => return Err(AppError::WorkspaceErrored(workspace_id.to_string())),
            "creating" | "stopping" => {
                return Err(AppError::WorkspaceBusy {
                    workspace_id: workspace_id.to_string(),
                    status: workspace.status.clone(),
                })
            }
            _ => {}
        }

        if let Some(session) = state.sessions.get(&workspace_id).cloned() {
            if session.is_initialized() {
                self.sync_user_data_if_needed(
                    &mut state,
                    workspace_id,
                    sync_user_id.as_deref(),
                    &session,
                    false,
                )
                .await;
                ws_db::update_workspace_activity(&self.pool, workspace_id).await?;
                return Ok(session);
            }
        }

        match workspace.status.as_str() {
            "stopped" => {
                self.restart_workspace(&mut state, &workspace, sync_user_id.as_deref())
                    .await
            }
            "running" => {
                // The row says running but the process has no live session
                // (e.g. after a restart): re-initialize against the recorded
                // sandbox.
                let session = Arc::new(Session::new(
                    &workspace_id.to_string(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.provider),
                ));
                let sandbox_id = workspace.sandbox_id.clone();
                if let Err(e) = session.initialize(sandbox_id.as_deref()).await {
                    error!(%workspace_id, error = %e, "failed to re-initialize running workspace");
                    let _ = ws_db::update_workspace_status(&self.pool, workspace_id, "error", None)
                        .await;
                    return Err(AppError::Sandbox(e));
                }
                self.sync_assets(
                    &mut state,
                    workspace_id,
                    sync_user_id.as_deref(),
                    &session,
                    sandbox_id.is_some(),
                )
                .await;
                state.sessions.insert(workspace_id, Arc::clone(&session));
                ws_db::update_workspace_activity(&self.pool, workspace_id).await?;
                Ok(session)
            }
            other => Err(AppError::Message(format!("unknown workspace status: {other}"))),
        }
    }

    async fn restart_workspace(
        &self,
        state: &mut ManagerState,
        workspace: &WorkspaceRow,
        user_id: Option<&str>,
    ) -> AppResult<Arc<Session>> {
        let workspace_id = workspace.workspace_id;
        let Some(sandbox_id) = workspace.sandbox_id.clone() else {
            return Err(AppError::Message(format!(
                "workspace {workspace_id} has no sandbox_id; cannot restart"
            )));
        };

        info!(%workspace_id, %sandbox_id, "restarting stopped workspace");

        let session = Arc::new(Session::new(
            &workspace_id.to_string(),
            Arc::clone(&self.config),
            Arc::clone(&self.provider),
        ));

        if let Err(e) = session.initialize(Some(&sandbox_id)).await {
            error!(%workspace_id, error = %e, "error restarting workspace");
            let _ = ws_db::update_workspace_status(&self.pool, workspace_id, "error", None).await;
            return Err(AppError::Sandbox(e));
        }

        self.sync_assets(state, workspace_id, user_id, &session, true)
            .await;

        ws_db::update_workspace_status(&self.pool, workspace_id, "running", None).await?;
        state.sessions.insert(workspace_id, Arc::clone(&session));
        ws_db::update_workspace_activity(&self.pool, workspace_id).await?;

        info!(%workspace_id, "workspace restarted");
        Ok(session)
    }

    /// Stop a running workspace, preserving its sandbox for fast restart.
    pub async fn stop_workspace(&self, workspace_id: Uuid) -> AppResult<WorkspaceRow> {
        let mut state = self.state.lock().await;

        let workspace = ws_db::get_workspace(&self.pool, workspace_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if workspace.status != "running" {
            return Err(AppError::BadRequest(format!(
                "cannot stop workspace in '{}' state; only running workspaces can be stopped",
                workspace.status
            )));
        }

        info!(%workspace_id, "stopping workspace");
        ws_db::update_workspace_status(&self.pool, workspace_id, "stopping", None).await?;

        if let Some(session) = state.sessions.remove(&workspace_id) {
            session.stop().await;
        }
        state.user_data_synced.remove(&workspace_id);

        let updated = ws_db::update_workspace_status(&self.pool, workspace_id, "stopped", None)
            .await?
            .ok_or(AppError::NotFound)?;

        info!(%workspace_id, "workspace stopped");
        Ok(updated)
    }

    /// Delete a workspace and its sandbox (terminal).
    pub async fn delete_workspace(&self, workspace_id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;

        ws_db::get_workspace(&self.pool, workspace_id)
            .await?
            .ok_or(AppError::NotFound)?;

        info!(%workspace_id, "deleting workspace");

        if let Some(session) = state.sessions.remove(&workspace_id) {
            if let Err(e) = session.cleanup().await {
                warn!(%workspace_id, error = %e, "error cleaning up session");
            }
        }
        state.user_data_synced.remove(&workspace_id);

        ws_db::soft_delete_workspace(&self.pool, workspace_id).await?;

        info!(%workspace_id, "workspace deleted");
        Ok(())
    }

    /// Sync skills and user data to the sandbox in parallel. Failures are
    /// logged, never fatal to the caller.
    async fn sync_assets(
        &self,
        state: &mut ManagerState,
        workspace_id: Uuid,
        user_id: Option<&str>,
        session: &Arc<Session>,
        reusing_sandbox: bool,
    ) {
        let driver = session.driver();

        let skills_sync = async {
            if !self.config.skills.enabled {
                return;
            }
            if let Err(e) = skills::sync_skills(&driver, &self.config.skills, reusing_sandbox).await
            {
                warn!(%workspace_id, error = %e, "skills sync failed");
            }
        };

        let user_data_sync = async {
            let Some(user_id) = user_id else { return false };
            match sync_user_data_to_sandbox(&driver, user_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%workspace_id, error = %e, "user data sync failed");
                    false
                }
            }
        };

        let ((), user_synced) = tokio::join!(skills_sync, user_data_sync);
        if user_synced {
            state.user_data_synced.insert(workspace_id);
        }
    }

    async fn sync_user_data_if_needed(
        &self,
        state: &mut ManagerState,
        workspace_id: Uuid,
        user_id: Option<&str>,
        session: &Arc<Session>,
        force: bool,
    ) {
        let Some(user_id) = user_id else { return };
        if !force && state.user_data_synced.contains(&workspace_id) {
            return;
        }
        match sync_user_data_to_sandbox(&session.driver(), user_id).await {
            Ok(()) => {
                state.user_data_synced.insert(workspace_id);
            }
            Err(e) => warn!(%workspace_id, error = %e, "user data sync failed"),
        }
    }

    /// Stop every running workspace idle past the timeout. Returns how many
    /// were stopped.
    pub async fn cleanup_idle_workspaces(&self) -> usize {
        let running = match ws_db::get_workspaces_by_status(&self.pool, "running", 1000).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list running workspaces for eviction");
                return 0;
            }
        };

        let candidates = idle_candidates(&running, Utc::now(), self.idle_timeout);
        let mut stopped = 0usize;

        for workspace_id in candidates {
            info!(%workspace_id, "workspace idle past timeout, stopping");
            match self.stop_workspace(workspace_id).await {
                Ok(_) => stopped += 1,
                Err(e) => error!(%workspace_id, error = %e, "error stopping idle workspace"),
            }
        }

        if stopped > 0 {
            info!(stopped, "stopped idle workspaces");
        }
        stopped
    }

    /// Spawn the background eviction worker.
    pub fn start_eviction_worker(self: &Arc<Self>) {
        let mut guard = self.worker.lock().expect("worker lock");
        if guard.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let interval = self.cleanup_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                manager.cleanup_idle_workspaces().await;
            }
        }));
        info!("workspace eviction worker started");
    }

    /// Cancel the eviction worker and drop the session cache. Sessions are
    /// NOT stopped: they stay `running` in the DB and eviction resumes on the
    /// next start.
    pub async fn shutdown(&self) {
        info!("shutting down workspace manager");
        if let Some(handle) = self.worker.lock().expect("worker lock").take() {
            handle.abort();
        }
        let mut state = self.state.lock().await;
        state.sessions.clear();
        state.user_data_synced.clear();
        info!("workspace manager shutdown complete");
    }

    pub async fn cached_session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

/// Pure eviction predicate: running workspaces whose last activity is older
/// than the idle timeout. Workspaces that never recorded activity are
/// skipped.
pub fn idle_candidates(
    workspaces: &[WorkspaceRow],
    now: DateTime<Utc>,
    idle_timeout_secs: i64,
) -> Vec<Uuid> {
    workspaces
        .iter()
        .filter_map(|w| {
            let last_activity = w.last_activity_at?;
            let idle = (now - last_activity).num_seconds();
            (idle > idle_timeout_secs).then_some(w.workspace_id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(last_activity: Option<DateTime<Utc>>) -> WorkspaceRow {
        let now = Utc::now();
        WorkspaceRow {
            workspace_id: Uuid::new_v4(),
            user_id: "u1".into(),
            name: "w".into(),
            description: None,
            sandbox_id: Some("sb".into()),
            status: "running".into(),
            config: None,
            created_at: now,
            updated_at: now,
            last_activity_at: last_activity,
            stopped_at: None,
        }
    }

    #[test]
    fn only_workspaces_past_the_idle_timeout_are_evicted() {
        let now = Utc::now();
        let idle = row(Some(now - Duration::seconds(3600)));
        let active = row(Some(now - Duration::seconds(60)));
        let untouched = row(None);

        let candidates = idle_candidates(
            &[idle.clone(), active.clone(), untouched],
            now,
            1800,
        );

        assert_eq!(candidates, vec![idle.workspace_id]);
    }

    #[test]
    fn boundary_activity_is_not_evicted() {
        let now = Utc::now();
        let exactly_at_timeout = row(Some(now - Duration::seconds(1800)));
        assert!(idle_candidates(&[exactly_at_timeout], now, 1800).is_empty());
    }
}
