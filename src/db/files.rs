use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub async fn get_or_create_file(
    pool: &PgPool,
    filesystem_id: &str,
    file_path: &str,
) -> Result<Uuid, sqlx::Error> {
    if let Some(row) =
        sqlx::query("SELECT file_id FROM file WHERE filesystem_id = $1 AND file_path = $2")
            .bind(filesystem_id)
            .bind(file_path)
            .fetch_optional(pool)
            .await?
    {
        return Ok(row.get("file_id"));
    }

    let row = sqlx::query(
        "INSERT INTO file (file_id, filesystem_id, file_path) VALUES ($1, $2, $3) \
         ON CONFLICT (filesystem_id, file_path) DO UPDATE SET updated_at = NOW() \
         RETURNING file_id",
    )
    .bind(Uuid::new_v4())
    .bind(filesystem_id)
    .bind(file_path)
    .fetch_one(pool)
    .await?;
    Ok(row.get("file_id"))
}

/// Next dense operation index for a file.
pub async fn next_operation_index(pool: &PgPool, file_id: Uuid) -> Result<i32, sqlx::Error> {
    let max: Option<i32> =
        sqlx::query_scalar("SELECT MAX(operation_index) FROM file_operation WHERE file_id = $1")
            .bind(file_id)
            .fetch_one(pool)
            .await?;
    Ok(max.map_or(0, |m| m + 1))
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_file_operation(
    pool: &PgPool,
    file_id: Uuid,
    operation: &str,
    operation_index: i32,
    thread_id: &str,
    pair_index: i32,
    agent: &str,
    old_string: Option<&str>,
    new_string: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<Uuid, sqlx::Error> {
    let operation_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO file_operation \
         (operation_id, file_id, thread_id, pair_index, agent, operation, operation_index, \
          old_string, new_string, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(operation_id)
    .bind(file_id)
    .bind(thread_id)
    .bind(pair_index)
    .bind(agent)
    .bind(operation)
    .bind(operation_index)
    .bind(old_string)
    .bind(new_string)
    .bind(timestamp)
    .execute(pool)
    .await?;
    Ok(operation_id)
}

/// Refresh the file row's current content and provenance after an operation.
pub async fn update_file_metadata(
    pool: &PgPool,
    file_id: Uuid,
    content: Option<&str>,
    thread_id: &str,
    pair_index: i32,
) -> Result<(), sqlx::Error> {
    let line_count = content.map(|c| c.lines().count() as i32);
    sqlx::query(
        "UPDATE file SET content = COALESCE($2, content), line_count = COALESCE($3, line_count), \
         updated_in_thread_id = $4, updated_in_pair_index = $5, \
         created_in_thread_id = COALESCE(created_in_thread_id, $4), \
         created_in_pair_index = COALESCE(created_in_pair_index, $5), \
         updated_at = NOW() WHERE file_id = $1",
    )
    .bind(file_id)
    .bind(content)
    .bind(line_count)
    .bind(thread_id)
    .bind(pair_index)
    .execute(pool)
    .await?;
    Ok(())
}
