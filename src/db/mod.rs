pub mod conversation;
pub mod files;
pub mod workspace;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Managed-Postgres host suffixes that require TLS.
const SSL_REQUIRED_SUFFIXES: &[&str] = &["supabase.com", "rds.amazonaws.com", "neon.tech"];

/// Build the connection string from `DB_*` environment variables.
pub fn connection_string() -> String {
    let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let name = std::env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string());
    let user = std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("DB_PASSWORD").unwrap_or_else(|_| "postgres".to_string());

    let sslmode = if SSL_REQUIRED_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        "require"
    } else {
        "disable"
    };
    format!("postgresql://{user}:{password}@{host}:{port}/{name}?sslmode={sslmode}")
}

/// Shared pool for every repository write. Opened once at startup; request
/// paths treat its absence as a hard error.
pub async fn init_pool() -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .connect(&connection_string())
        .await
}

/// Connection string for the optional, independent checkpoint database.
/// `None` when `MEMORY_DB_HOST` is unset.
pub fn memory_connection_string() -> Option<String> {
    let host = std::env::var("MEMORY_DB_HOST").ok()?;
    let port = std::env::var("MEMORY_DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let name = std::env::var("MEMORY_DB_NAME").unwrap_or_else(|_| "postgres".to_string());
    let user = std::env::var("MEMORY_DB_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("MEMORY_DB_PASSWORD").unwrap_or_else(|_| "postgres".to_string());

    let sslmode = if SSL_REQUIRED_SUFFIXES.iter().any(|s| host.ends_with(s)) {
        "require"
    } else {
        "disable"
    };
    Some(format!(
        "postgresql://{user}:{password}@{host}:{port}/{name}?sslmode={sslmode}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_hosts_require_ssl() {
        std::env::set_var("DB_HOST", "db.example.supabase.com");
        std::env::set_var("DB_PASSWORD", "pw");
        assert!(connection_string().contains("sslmode=require"));

        std::env::set_var("DB_HOST", "localhost");
        assert!(connection_string().contains("sslmode=disable"));
    }
}
