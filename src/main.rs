use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use tracing_subscriber::{fmt, EnvFilter};

use agenthost::agent::{AgentGraph, LoopbackGraph};
use agenthost::config::{self, CoreConfig};
use agenthost::manager::WorkspaceManager;
use agenthost::restore::CheckpointStore;
use agenthost::routes::api_routes;
use agenthost::sandbox::{HttpSandboxProvider, SandboxProvider};
use agenthost::{db, pricing};

async fn root() -> &'static str {
    "Agent Orchestration API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let core_config = Arc::new(CoreConfig::load()?);
    for server in &core_config.mcp.servers {
        if let Err(e) = server.validate() {
            return Err(e.into());
        }
    }
    // Force the pricing manifest to load so a broken table fails at boot.
    let _ = pricing::MANIFEST.models.len();

    let pool = db::init_pool().await?;

    // The checkpoint database is optional and independent; when configured it
    // is opened for the process lifetime alongside the main pool.
    let checkpoint_pool = match db::memory_connection_string() {
        Some(conninfo) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .min_connections(1)
                .max_connections(10)
                .connect(&conninfo)
                .await?;
            tracing::info!("checkpoint database pool opened");
            Some(pool)
        }
        None => None,
    };

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let provider: Arc<dyn SandboxProvider> = Arc::new(HttpSandboxProvider::new(
        &core_config.sandbox.api_url,
        &config::SANDBOX_API_KEY,
    )?);

    let manager = WorkspaceManager::init(
        Arc::clone(&core_config),
        provider,
        pool.clone(),
        *config::IDLE_TIMEOUT_SECS,
        *config::CLEANUP_INTERVAL_SECS,
    );
    manager.start_eviction_worker();

    // The production agent graph plugs in here; the loopback graph keeps the
    // service fully functional without one.
    let graph: Arc<dyn AgentGraph> = Arc::new(LoopbackGraph);
    let checkpoints = Arc::new(CheckpointStore::new());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(Arc::clone(&manager)))
        .layer(Extension(graph))
        .layer(Extension(checkpoints));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    manager.shutdown().await;
    if let Some(pool) = checkpoint_pool {
        pool.close().await;
    }
    pool.close().await;

    Ok(())
}
