use axum::{
    extract::{Extension, Path},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::workspace as ws_db;
use crate::db::workspace::WorkspaceRow;
use crate::error::{AppError, AppResult};
use crate::extractor::UserId;
use crate::manager::WorkspaceManager;

#[derive(Debug, Deserialize)]
pub struct CreateWorkspace {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
}

async fn owned_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
    user_id: &str,
) -> AppResult<WorkspaceRow> {
    let workspace = ws_db::get_workspace(pool, workspace_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if workspace.user_id != user_id {
        return Err(AppError::Forbidden);
    }
    Ok(workspace)
}

pub async fn create_workspace(
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    UserId(user_id): UserId,
    Json(payload): Json<CreateWorkspace>,
) -> AppResult<Json<WorkspaceRow>> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    let workspace = manager
        .create_workspace(
            &user_id,
            &payload.name,
            payload.description.as_deref(),
            payload.config.as_ref(),
        )
        .await?;
    Ok(Json(workspace))
}

pub async fn list_workspaces(
    Extension(pool): Extension<PgPool>,
    UserId(user_id): UserId,
) -> AppResult<Json<Vec<WorkspaceRow>>> {
    let workspaces = ws_db::get_workspaces_for_user(&pool, &user_id).await?;
    Ok(Json(workspaces))
}

pub async fn get_workspace(
    Extension(pool): Extension<PgPool>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<Uuid>,
) -> AppResult<Json<WorkspaceRow>> {
    let workspace = owned_workspace(&pool, workspace_id, &user_id).await?;
    Ok(Json(workspace))
}

pub async fn stop_workspace(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<Uuid>,
) -> AppResult<Json<WorkspaceRow>> {
    owned_workspace(&pool, workspace_id, &user_id).await?;
    let workspace = manager.stop_workspace(workspace_id).await?;
    Ok(Json(workspace))
}

/// Rebuild the sandbox tool stubs and MCP client from the live tool lists.
pub async fn refresh_workspace_tools(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    owned_workspace(&pool, workspace_id, &user_id).await?;
    let session = manager
        .get_session_for_workspace(workspace_id, Some(&user_id))
        .await?;
    session.driver().refresh_tools(&session.registry()).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn delete_workspace(
    Extension(pool): Extension<PgPool>,
    Extension(manager): Extension<Arc<WorkspaceManager>>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    owned_workspace(&pool, workspace_id, &user_id).await?;
    manager.delete_workspace(workspace_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
