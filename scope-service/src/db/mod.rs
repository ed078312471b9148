//! Database module for PostgreSQL connection management.

use crate::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Apply the embedded migrations for units, roles and grants.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Tables the scope repositories read and write.
pub const SCOPE_TABLES: [&str; 4] = ["org_units", "roles", "role_assignments", "grants"];

/// The pool must answer and every scope table must be migrated.
pub async fn health_check(pool: &PgPool) -> Result<(), anyhow::Error> {
    let missing = missing_tables(pool, &SCOPE_TABLES).await?;
    if !missing.is_empty() {
        anyhow::bail!("Scope tables not migrated: {}", missing.join(", "));
    }
    Ok(())
}

async fn missing_tables(pool: &PgPool, tables: &[&str]) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT name FROM UNNEST($1::text[]) AS name WHERE to_regclass(name) IS NULL ORDER BY name",
    )
    .bind(tables)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DatabaseConfig {
        DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/scope_test".to_string()),
            max_connections: 5,
            min_connections: 1,
        }
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_create_pool() {
        let result = create_pool(&test_config()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn health_check_requires_migrated_tables() {
        let pool = create_pool(&test_config()).await.unwrap();
        run_migrations(&pool).await.unwrap();

        assert!(health_check(&pool).await.is_ok());
        assert!(missing_tables(&pool, &SCOPE_TABLES).await.unwrap().is_empty());
        assert_eq!(
            missing_tables(&pool, &["grants", "scope_absent_table"])
                .await
                .unwrap(),
            vec!["scope_absent_table".to_string()]
        );
    }
}
