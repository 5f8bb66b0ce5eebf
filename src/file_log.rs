use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::files;

/// Append-only audit logging of agent file writes and edits for one turn.
///
/// Operation indexes are dense per file; the index counter continues from
/// whatever earlier turns already recorded.
pub struct FileOperationLogger {
    pool: PgPool,
    filesystem_id: String,
    thread_id: String,
    pair_index: i32,
    agent: String,
}

impl FileOperationLogger {
    pub fn new(
        pool: PgPool,
        filesystem_id: &str,
        thread_id: &str,
        pair_index: i32,
        agent: &str,
    ) -> Self {
        Self {
            pool,
            filesystem_id: filesystem_id.to_string(),
            thread_id: thread_id.to_string(),
            pair_index,
            agent: agent.to_string(),
        }
    }

    /// Record a full-file write. The new content becomes the file's current
    /// content.
    pub async fn log_write(&self, file_path: &str, content: &str) -> Option<Uuid> {
        self.log_operation("write_file", file_path, None, Some(content), Some(content))
            .await
    }

    /// Record a string-replacement edit. The resulting content is recorded
    /// when the caller knows it.
    pub async fn log_edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
        resulting_content: Option<&str>,
    ) -> Option<Uuid> {
        self.log_operation(
            "edit_file",
            file_path,
            Some(old_string),
            Some(new_string),
            resulting_content,
        )
        .await
    }

    async fn log_operation(
        &self,
        operation: &str,
        file_path: &str,
        old_string: Option<&str>,
        new_string: Option<&str>,
        content: Option<&str>,
    ) -> Option<Uuid> {
        let result = async {
            let file_id =
                files::get_or_create_file(&self.pool, &self.filesystem_id, file_path).await?;
            let operation_index = files::next_operation_index(&self.pool, file_id).await?;
            let operation_id = files::insert_file_operation(
                &self.pool,
                file_id,
                operation,
                operation_index,
                &self.thread_id,
                self.pair_index,
                &self.agent,
                old_string,
                new_string,
                Utc::now(),
            )
            .await?;
            files::update_file_metadata(
                &self.pool,
                file_id,
                content,
                &self.thread_id,
                self.pair_index,
            )
            .await?;
            Ok::<(Uuid, i32), sqlx::Error>((operation_id, operation_index))
        }
        .await;

        match result {
            Ok((operation_id, operation_index)) => {
                debug!(
                    %operation_id,
                    operation,
                    %file_path,
                    operation_index,
                    "logged file operation"
                );
                Some(operation_id)
            }
            Err(e) => {
                // Audit logging never fails the turn.
                warn!(%file_path, operation, error = %e, "failed to log file operation");
                None
            }
        }
    }
}
