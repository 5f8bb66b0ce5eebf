use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceRow {
    pub workspace_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub sandbox_id: Option<String>,
    pub status: String,
    pub config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "workspace_id, user_id, name, description, sandbox_id, status, config, \
                       created_at, updated_at, last_activity_at, stopped_at";

fn from_row(row: &PgRow) -> WorkspaceRow {
    WorkspaceRow {
        workspace_id: row.get("workspace_id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        description: row.try_get("description").ok(),
        sandbox_id: row.try_get("sandbox_id").ok(),
        status: row.get("status"),
        config: row.try_get("config").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_activity_at: row.try_get("last_activity_at").ok(),
        stopped_at: row.try_get("stopped_at").ok(),
    }
}

pub async fn create_workspace(
    pool: &PgPool,
    user_id: &str,
    name: &str,
    description: Option<&str>,
    config: Option<&Value>,
) -> Result<WorkspaceRow, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO workspace (workspace_id, user_id, name, description, status, config) \
         VALUES ($1, $2, $3, $4, 'creating', $5) RETURNING {COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(name)
    .bind(description)
    .bind(config)
    .fetch_one(pool)
    .await?;
    Ok(from_row(&row))
}

pub async fn get_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Option<WorkspaceRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM workspace WHERE workspace_id = $1 AND status != 'deleted'"
    ))
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(from_row))
}

pub async fn get_workspaces_for_user(
    pool: &PgPool,
    user_id: &str,
) -> Result<Vec<WorkspaceRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM workspace \
         WHERE user_id = $1 AND status != 'deleted' ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn get_workspaces_by_status(
    pool: &PgPool,
    status: &str,
    limit: i64,
) -> Result<Vec<WorkspaceRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM workspace WHERE status = $1 ORDER BY created_at LIMIT $2"
    ))
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

/// Update status, optionally setting `sandbox_id` the first time the
/// workspace comes up. `stopped_at` is stamped on stop.
pub async fn update_workspace_status(
    pool: &PgPool,
    workspace_id: Uuid,
    status: &str,
    sandbox_id: Option<&str>,
) -> Result<Option<WorkspaceRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "UPDATE workspace SET status = $2, \
         sandbox_id = COALESCE(sandbox_id, $3), \
         stopped_at = CASE WHEN $2 = 'stopped' THEN NOW() ELSE stopped_at END, \
         updated_at = NOW() \
         WHERE workspace_id = $1 RETURNING {COLUMNS}"
    ))
    .bind(workspace_id)
    .bind(status)
    .bind(sandbox_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(from_row))
}

pub async fn update_workspace_activity(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE workspace SET last_activity_at = NOW(), updated_at = NOW() WHERE workspace_id = $1")
        .bind(workspace_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Soft delete: the row stays for audit, the terminal status hides it.
pub async fn soft_delete_workspace(pool: &PgPool, workspace_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE workspace SET status = 'deleted', updated_at = NOW() WHERE workspace_id = $1")
        .bind(workspace_id)
        .execute(pool)
        .await?;
    Ok(())
}
