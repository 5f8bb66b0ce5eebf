use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::mcp::McpError;
use crate::sandbox::SandboxError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("workspace {0} has been deleted")]
    WorkspaceDeleted(String),
    #[error("workspace {0} is in error state; delete and recreate")]
    WorkspaceErrored(String),
    #[error("workspace {workspace_id} is busy ({status}); retry shortly")]
    WorkspaceBusy {
        workspace_id: String,
        status: String,
    },
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("mcp error: {0}")]
    Mcp(#[from] McpError),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound
            | AppError::WorkspaceDeleted(_)
            | AppError::WorkspaceErrored(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::WorkspaceBusy { .. } => StatusCode::CONFLICT,
            AppError::SandboxUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Sandbox(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Sandbox(_) | AppError::Mcp(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(error = ?self, status = %status, "request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_state_errors_map_to_expected_status() {
        let busy = AppError::WorkspaceBusy {
            workspace_id: "w1".into(),
            status: "creating".into(),
        };
        assert_eq!(
            busy.into_response().status(),
            StatusCode::CONFLICT,
            "busy workspaces are a retryable conflict"
        );

        assert_eq!(
            AppError::WorkspaceDeleted("w1".into())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::SandboxUnavailable("disconnected".into())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
