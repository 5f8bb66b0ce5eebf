use axum::{
    routing::{get, post},
    Router,
};

use crate::{chat, workspaces};

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(workspaces::list_workspaces).post(workspaces::create_workspace),
        )
        .route(
            "/api/v1/workspaces/:workspace_id",
            get(workspaces::get_workspace).delete(workspaces::delete_workspace),
        )
        .route(
            "/api/v1/workspaces/:workspace_id/stop",
            post(workspaces::stop_workspace),
        )
        .route(
            "/api/v1/workspaces/:workspace_id/tools/refresh",
            post(workspaces::refresh_workspace_tools),
        )
        .route(
            "/api/v1/workspaces/:workspace_id/chat/stream",
            post(chat::chat_stream),
        )
}
