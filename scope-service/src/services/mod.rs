//! Services layer for scope-service.
//!
//! Unit hierarchy, grant store and tier resolution, each over a repository
//! seam with PostgreSQL and in-memory backends, plus the resolver combining
//! them into visibility predicates.

pub mod cache;
pub mod grants;
pub mod org_units;
pub mod resolver;
pub mod tiers;

pub use cache::{MockCache, RedisCache, SharedCache, TieredCache, DEFAULT_CACHE_TTL};
pub use grants::{GrantRepository, GrantStore, InMemoryGrantRepository, PgGrantRepository};
pub use org_units::{
    InMemoryOrgUnitRepository, OrgUnitHierarchy, OrgUnitRepository, PgOrgUnitRepository, UnitMove,
};
pub use resolver::{AnonymousAccess, CreationValues, ScopeResolver};
pub use tiers::{InMemoryRoleRepository, PgRoleRepository, RoleRepository, VisibilityTierResolver};
