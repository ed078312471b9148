//! Visibility tier derived from an actor's enabled role assignments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::ScopeError;
use crate::models::{ActorId, Role, RoleId, VisibilityTier};

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// Raw tier codes of every enabled role assigned to the actor.
    async fn enabled_tier_codes_for_actor(&self, actor_id: ActorId) -> Result<Vec<i16>, ScopeError>;
}

#[derive(Clone)]
pub struct PgRoleRepository {
    pool: PgPool,
}

impl PgRoleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleRepository for PgRoleRepository {
    async fn enabled_tier_codes_for_actor(&self, actor_id: ActorId) -> Result<Vec<i16>, ScopeError> {
        let rows: Vec<(i16,)> = sqlx::query_as(
            r#"
            SELECT r.visibility_tier
            FROM role_assignments ra
            JOIN roles r ON r.role_id = ra.role_id
            WHERE ra.actor_id = $1 AND ra.enabled_flag AND r.enabled_flag
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(code,)| code).collect())
    }
}

#[derive(Default)]
struct RoleTable {
    roles: BTreeMap<RoleId, Role>,
    assignments: Vec<(ActorId, RoleId)>,
}

/// In-memory roles and assignments.
#[derive(Default)]
pub struct InMemoryRoleRepository {
    table: Mutex<RoleTable>,
}

impl InMemoryRoleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_role(&self, role: Role) -> Result<(), ScopeError> {
        self.lock()?.roles.insert(role.role_id, role);
        Ok(())
    }

    pub fn assign(&self, actor_id: ActorId, role_id: RoleId) -> Result<(), ScopeError> {
        self.lock()?.assignments.push((actor_id, role_id));
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, RoleTable>, ScopeError> {
        self.table
            .lock()
            .map_err(|e| ScopeError::StoreUnavailable(format!("Role store poisoned: {}", e)))
    }
}

#[async_trait]
impl RoleRepository for InMemoryRoleRepository {
    async fn enabled_tier_codes_for_actor(&self, actor_id: ActorId) -> Result<Vec<i16>, ScopeError> {
        let table = self.lock()?;
        Ok(table
            .assignments
            .iter()
            .filter(|(actor, _)| *actor == actor_id)
            .filter_map(|(_, role_id)| table.roles.get(role_id))
            .filter(|role| role.enabled_flag)
            .map(|role| role.visibility_tier)
            .collect())
    }
}

/// Derives the coarse visibility tier of an actor. Computed once per request
/// by whoever establishes the [`SecurityContext`](crate::context::SecurityContext).
#[derive(Clone)]
pub struct VisibilityTierResolver {
    repo: Arc<dyn RoleRepository>,
}

impl VisibilityTierResolver {
    pub fn new(repo: Arc<dyn RoleRepository>) -> Self {
        Self { repo }
    }

    /// Widest tier among the actor's enabled roles, `SELF` when there are
    /// none. Unknown tier codes are ignored.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, actor_id: ActorId) -> Result<VisibilityTier, ScopeError> {
        if actor_id <= 0 {
            return Ok(VisibilityTier::SelfOnly);
        }
        let codes = self.repo.enabled_tier_codes_for_actor(actor_id).await?;
        let tier = codes
            .iter()
            .filter_map(|code| {
                let tier = VisibilityTier::from_code(*code);
                if tier.is_none() {
                    tracing::warn!(actor_id, code, "Ignoring unknown visibility tier code");
                }
                tier
            })
            .max()
            .unwrap_or_default();
        tracing::debug!(actor_id, %tier, "Resolved visibility tier");
        Ok(tier)
    }
}
