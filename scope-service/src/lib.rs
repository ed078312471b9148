//! Tenant-scoped row visibility.
//!
//! Given a [`SecurityContext`] and a [`ScopableEntityDescriptor`], the
//! [`ScopeResolver`] produces the clauses every query against a business table
//! must carry: tenant isolation first, then the actor's tier (own rows, own
//! unit, unit subtree or everything), widened by ad hoc grants.

pub mod config;
pub mod context;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod middleware;
pub mod models;
pub mod predicate;
pub mod services;

use std::sync::Arc;

use service_core::error::AppError;
use sqlx::PgPool;

pub use context::{ScopeSuppression, SecurityContext};
pub use descriptor::{introspect_descriptor, ColumnConventions, ScopableEntityDescriptor};
pub use error::ScopeError;
pub use predicate::{Predicate, ScopedQuery};
pub use services::{
    AnonymousAccess, GrantRepository, GrantStore, OrgUnitHierarchy, OrgUnitRepository,
    RoleRepository, ScopeResolver, SharedCache, TieredCache, VisibilityTierResolver,
};

use crate::config::{CacheConfig, ScopeConfig};
use crate::services::{PgGrantRepository, PgOrgUnitRepository, PgRoleRepository, RedisCache};

/// Wired components of the visibility engine, shared by every request.
#[derive(Clone)]
pub struct ScopeState {
    pub pool: Option<PgPool>,
    pub shared_cache: Option<Arc<dyn SharedCache>>,
    pub units: Arc<OrgUnitHierarchy>,
    pub grants: Arc<GrantStore>,
    pub tiers: VisibilityTierResolver,
    pub resolver: Arc<ScopeResolver>,
}

impl ScopeState {
    /// Assemble the engine over arbitrary repositories. Each owner gets its
    /// own cache handle; both share the distributed backend when given.
    pub fn from_parts(
        unit_repo: Arc<dyn OrgUnitRepository>,
        grant_repo: Arc<dyn GrantRepository>,
        role_repo: Arc<dyn RoleRepository>,
        shared_cache: Option<Arc<dyn SharedCache>>,
        cache: &CacheConfig,
        anonymous_access: AnonymousAccess,
    ) -> Self {
        let units = Arc::new(OrgUnitHierarchy::with_cache(
            unit_repo,
            tiered_cache("scope:units", shared_cache.clone(), cache),
        ));
        let grants = Arc::new(GrantStore::with_cache(
            grant_repo,
            tiered_cache("scope:grants", shared_cache.clone(), cache),
        ));
        let resolver = Arc::new(
            ScopeResolver::new(units.clone(), grants.clone())
                .with_anonymous_access(anonymous_access),
        );

        Self {
            pool: None,
            shared_cache,
            units,
            grants,
            tiers: VisibilityTierResolver::new(role_repo),
            resolver,
        }
    }

    /// Connect PostgreSQL and, when configured, Redis. An unreachable Redis
    /// only disables the distributed cache tier.
    pub async fn connect(config: &ScopeConfig) -> Result<Self, AppError> {
        let pool = db::create_pool(&config.database).await?;

        let shared_cache: Option<Arc<dyn SharedCache>> = match &config.redis {
            Some(redis) => match RedisCache::new(&redis.url).await {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable - continuing without distributed cache");
                    None
                }
            },
            None => {
                tracing::info!("REDIS_URL not set - distributed cache disabled");
                None
            }
        };

        let mut state = Self::from_parts(
            Arc::new(PgOrgUnitRepository::new(pool.clone())),
            Arc::new(PgGrantRepository::new(pool.clone())),
            Arc::new(PgRoleRepository::new(pool.clone())),
            shared_cache,
            &config.cache,
            config.anonymous_access,
        );
        state.pool = Some(pool);
        Ok(state)
    }

    /// The database must answer; a failing distributed cache is only reported.
    pub async fn health_check(&self) -> Result<(), AppError> {
        if let Some(pool) = &self.pool {
            db::health_check(pool).await.map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        }

        if let Some(cache) = &self.shared_cache {
            if let Err(e) = cache.health_check().await {
                tracing::warn!(error = %e, "Distributed cache health check failed");
            }
        }
        Ok(())
    }
}

fn tiered_cache<V>(
    namespace: &str,
    shared: Option<Arc<dyn SharedCache>>,
    config: &CacheConfig,
) -> TieredCache<V>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    let cache = TieredCache::new(namespace)
        .with_local_ttl(config.local_ttl())
        .with_shared_ttl(config.ttl());
    match shared {
        Some(shared) => cache.with_shared(shared),
        None => cache,
    }
}
