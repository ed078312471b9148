use scope_service::{config::ScopeConfig, db, ScopeState};
use service_core::observability::init_tracing;

/// Prepare the scope schema and verify the stores the engine depends on.
#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = ScopeConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        anonymous_access = ?config.anonymous_access,
        "Starting scope service"
    );

    let state = ScopeState::connect(&config).await?;

    if let Some(pool) = &state.pool {
        db::run_migrations(pool).await?;
    }

    state.health_check().await?;

    tracing::info!(
        distributed_cache = state.shared_cache.is_some(),
        cache_ttl_seconds = config.cache.ttl_seconds,
        "Scope service ready"
    );
    Ok(())
}
