//! Ad hoc per-resource grants with a cached actor read path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::cache::TieredCache;
use crate::error::ScopeError;
use crate::models::{
    ActorId, ActorSet, Grant, GrantScope, ResourceId, ResourceSet, ResourceType,
};

/// Grant storage. Only enabled, non-deleted rows are ever reported as active.
#[async_trait]
pub trait GrantRepository: Send + Sync {
    /// Insert, or revive and rescope the existing row for the same key.
    async fn upsert(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
        scope: GrantScope,
    ) -> Result<Grant, ScopeError>;

    /// Soft-delete; true when an active grant was removed.
    async fn soft_delete(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<bool, ScopeError>;

    /// Atomically replace every grant on the resource. Returns the actors
    /// that held an active grant before.
    async fn replace_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
        actors: &ActorSet,
        scope: GrantScope,
    ) -> Result<ActorSet, ScopeError>;

    /// Soft-delete every grant on the resource, returning the previous actors.
    async fn revoke_all_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError>;

    async fn resource_ids_for_actor(
        &self,
        actor_id: ActorId,
        resource_type: ResourceType,
    ) -> Result<ResourceSet, ScopeError>;

    async fn actors_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError>;

    async fn find_active(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<Option<Grant>, ScopeError>;
}

const UPSERT_CONFLICT: &str = r#"
    ON CONFLICT (actor_id, resource_id, resource_type)
    DO UPDATE SET scope_level = EXCLUDED.scope_level,
                  enabled_flag = TRUE,
                  updated_utc = EXCLUDED.updated_utc,
                  deleted_utc = NULL
"#;

/// Serialize whole-resource rewrites of one resource until the transaction
/// ends. Row locks alone miss rows inserted concurrently.
async fn lock_resource(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    resource_id: ResourceId,
    resource_type: ResourceType,
) -> Result<(), ScopeError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, hashint8($2))")
        .bind(resource_type)
        .bind(resource_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// PostgreSQL-backed grants.
#[derive(Clone)]
pub struct PgGrantRepository {
    pool: PgPool,
}

impl PgGrantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GrantRepository for PgGrantRepository {
    async fn upsert(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
        scope: GrantScope,
    ) -> Result<Grant, ScopeError> {
        let sql = format!(
            r#"
            INSERT INTO grants (actor_id, resource_id, resource_type, scope_level, enabled_flag, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, TRUE, $5, $5)
            {}
            RETURNING *
            "#,
            UPSERT_CONFLICT
        );
        let grant = sqlx::query_as::<_, Grant>(&sql)
            .bind(actor_id)
            .bind(resource_id)
            .bind(resource_type)
            .bind(scope.code())
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(grant)
    }

    async fn soft_delete(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<bool, ScopeError> {
        let removed: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE grants SET deleted_utc = $4, updated_utc = $4
            WHERE actor_id = $1 AND resource_id = $2 AND resource_type = $3 AND deleted_utc IS NULL
            RETURNING enabled_flag
            "#,
        )
        .bind(actor_id)
        .bind(resource_id)
        .bind(resource_type)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(removed.is_some_and(|(enabled,)| enabled))
    }

    async fn replace_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
        actors: &ActorSet,
        scope: GrantScope,
    ) -> Result<ActorSet, ScopeError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        lock_resource(&mut tx, resource_id, resource_type).await?;

        // Rows committed by a concurrent add are soft-deleted here as well, so
        // the returned set covers every actor whose grant this call removes.
        let previous: Vec<(ActorId, bool)> = sqlx::query_as(
            r#"
            UPDATE grants SET deleted_utc = $3, updated_utc = $3
            WHERE resource_id = $1 AND resource_type = $2 AND deleted_utc IS NULL
            RETURNING actor_id, enabled_flag
            "#,
        )
        .bind(resource_id)
        .bind(resource_type)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if !actors.is_empty() {
            let sql = format!(
                r#"
                INSERT INTO grants (actor_id, resource_id, resource_type, scope_level, enabled_flag, created_utc, updated_utc)
                SELECT new_actor.actor_id, $2, $3, $4, TRUE, $5, $5
                FROM UNNEST($1::bigint[]) AS new_actor(actor_id)
                {}
                "#,
                UPSERT_CONFLICT
            );
            sqlx::query(&sql)
                .bind(actors.iter().copied().collect::<Vec<ActorId>>())
                .bind(resource_id)
                .bind(resource_type)
                .bind(scope.code())
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(previous
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(id, _)| id)
            .collect())
    }

    async fn revoke_all_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError> {
        let mut tx = self.pool.begin().await?;
        lock_resource(&mut tx, resource_id, resource_type).await?;

        let revoked: Vec<(ActorId, bool)> = sqlx::query_as(
            r#"
            UPDATE grants SET deleted_utc = $3, updated_utc = $3
            WHERE resource_id = $1 AND resource_type = $2 AND deleted_utc IS NULL
            RETURNING actor_id, enabled_flag
            "#,
        )
        .bind(resource_id)
        .bind(resource_type)
        .bind(Utc::now())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(revoked
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(id, _)| id)
            .collect())
    }

    async fn resource_ids_for_actor(
        &self,
        actor_id: ActorId,
        resource_type: ResourceType,
    ) -> Result<ResourceSet, ScopeError> {
        let rows: Vec<(ResourceId,)> = sqlx::query_as(
            r#"
            SELECT resource_id FROM grants
            WHERE actor_id = $1 AND resource_type = $2 AND enabled_flag AND deleted_utc IS NULL
            "#,
        )
        .bind(actor_id)
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn actors_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError> {
        let rows: Vec<(ActorId,)> = sqlx::query_as(
            r#"
            SELECT actor_id FROM grants
            WHERE resource_id = $1 AND resource_type = $2 AND enabled_flag AND deleted_utc IS NULL
            "#,
        )
        .bind(resource_id)
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_active(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<Option<Grant>, ScopeError> {
        let grant = sqlx::query_as::<_, Grant>(
            r#"
            SELECT * FROM grants
            WHERE actor_id = $1 AND resource_id = $2 AND resource_type = $3
              AND enabled_flag AND deleted_utc IS NULL
            "#,
        )
        .bind(actor_id)
        .bind(resource_id)
        .bind(resource_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grant)
    }
}

type GrantKey = (ActorId, ResourceId, ResourceType);

#[derive(Default)]
struct GrantTable {
    rows: BTreeMap<GrantKey, Grant>,
    last_id: i64,
}

impl GrantTable {
    fn upsert(&mut self, key: GrantKey, scope: GrantScope) -> Grant {
        let now = Utc::now();
        let next_id = self.last_id + 1;
        let grant = self.rows.entry(key).or_insert_with(|| Grant {
            grant_id: next_id,
            actor_id: key.0,
            resource_id: key.1,
            resource_type: key.2,
            scope_level: scope.code(),
            enabled_flag: true,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        });
        if grant.grant_id == next_id {
            self.last_id = next_id;
        }
        grant.scope_level = scope.code();
        grant.enabled_flag = true;
        grant.updated_utc = now;
        grant.deleted_utc = None;
        grant.clone()
    }

    /// Soft-delete every live row on the resource, returning the actors whose
    /// grant was active.
    fn delete_resource(&mut self, resource_id: ResourceId, resource_type: ResourceType) -> ActorSet {
        let now = Utc::now();
        let mut previous = ActorSet::new();
        for grant in self.rows.values_mut().filter(|g| {
            g.resource_id == resource_id && g.resource_type == resource_type && g.deleted_utc.is_none()
        }) {
            if grant.enabled_flag {
                previous.insert(grant.actor_id);
            }
            grant.deleted_utc = Some(now);
            grant.updated_utc = now;
        }
        previous
    }
}

/// In-memory grants. Every mutation runs under one lock and fails before
/// touching state when writes are disabled.
#[derive(Default)]
pub struct InMemoryGrantRepository {
    table: Mutex<GrantTable>,
    fail_writes: AtomicBool,
    actor_reads: AtomicUsize,
}

impl InMemoryGrantRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of actor lookups that reached this store.
    pub fn actor_reads(&self) -> usize {
        self.actor_reads.load(Ordering::SeqCst)
    }

    /// Disable a grant without deleting it.
    pub fn disable(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<(), ScopeError> {
        if let Some(grant) = self
            .lock()?
            .rows
            .get_mut(&(actor_id, resource_id, resource_type))
        {
            grant.enabled_flag = false;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, GrantTable>, ScopeError> {
        self.table
            .lock()
            .map_err(|e| ScopeError::StoreUnavailable(format!("Grant store poisoned: {}", e)))
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, GrantTable>, ScopeError> {
        let table = self.lock()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ScopeError::StoreUnavailable(
                "Grant store rejected the write".to_string(),
            ));
        }
        Ok(table)
    }
}

#[async_trait]
impl GrantRepository for InMemoryGrantRepository {
    async fn upsert(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
        scope: GrantScope,
    ) -> Result<Grant, ScopeError> {
        let mut table = self.lock_for_write()?;
        Ok(table.upsert((actor_id, resource_id, resource_type), scope))
    }

    async fn soft_delete(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<bool, ScopeError> {
        let mut table = self.lock_for_write()?;
        let Some(grant) = table
            .rows
            .get_mut(&(actor_id, resource_id, resource_type))
            .filter(|g| g.deleted_utc.is_none())
        else {
            return Ok(false);
        };
        let now = Utc::now();
        grant.deleted_utc = Some(now);
        grant.updated_utc = now;
        Ok(grant.enabled_flag)
    }

    async fn replace_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
        actors: &ActorSet,
        scope: GrantScope,
    ) -> Result<ActorSet, ScopeError> {
        let mut table = self.lock_for_write()?;
        let previous = table.delete_resource(resource_id, resource_type);
        for actor_id in actors {
            table.upsert((*actor_id, resource_id, resource_type), scope);
        }
        Ok(previous)
    }

    async fn revoke_all_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError> {
        let mut table = self.lock_for_write()?;
        Ok(table.delete_resource(resource_id, resource_type))
    }

    async fn resource_ids_for_actor(
        &self,
        actor_id: ActorId,
        resource_type: ResourceType,
    ) -> Result<ResourceSet, ScopeError> {
        self.actor_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lock()?
            .rows
            .values()
            .filter(|g| g.actor_id == actor_id && g.resource_type == resource_type && g.is_active())
            .map(|g| g.resource_id)
            .collect())
    }

    async fn actors_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError> {
        Ok(self
            .lock()?
            .rows
            .values()
            .filter(|g| {
                g.resource_id == resource_id && g.resource_type == resource_type && g.is_active()
            })
            .map(|g| g.actor_id)
            .collect())
    }

    async fn find_active(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<Option<Grant>, ScopeError> {
        Ok(self
            .lock()?
            .rows
            .get(&(actor_id, resource_id, resource_type))
            .filter(|g| g.is_active())
            .cloned())
    }
}

fn require_positive(field: &str, value: i64) -> Result<(), ScopeError> {
    if value <= 0 {
        return Err(ScopeError::InvalidGrant(format!(
            "{} must be positive, got {}",
            field, value
        )));
    }
    Ok(())
}

fn validate_resource(resource_id: ResourceId, resource_type: ResourceType) -> Result<(), ScopeError> {
    require_positive("resource_id", resource_id)?;
    require_positive("resource_type", i64::from(resource_type))
}

/// Grant store with tiered caching of each actor's granted resource ids.
///
/// Every mutation commits first and then invalidates the cache entries of
/// each actor whose grants changed, before and after the mutation alike.
/// When the store fails, nothing is invalidated.
pub struct GrantStore {
    repo: Arc<dyn GrantRepository>,
    cache: TieredCache<ResourceSet>,
}

impl GrantStore {
    pub fn new(repo: Arc<dyn GrantRepository>) -> Self {
        Self::with_cache(repo, TieredCache::new("scope:grants"))
    }

    pub fn with_cache(repo: Arc<dyn GrantRepository>, cache: TieredCache<ResourceSet>) -> Self {
        Self { repo, cache }
    }

    pub fn cache(&self) -> &TieredCache<ResourceSet> {
        &self.cache
    }

    pub fn cache_key(actor_id: ActorId, resource_type: ResourceType) -> String {
        format!("{}:{}", actor_id, resource_type)
    }

    #[tracing::instrument(skip(self))]
    pub async fn add(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
        scope: GrantScope,
    ) -> Result<Grant, ScopeError> {
        require_positive("actor_id", actor_id)?;
        validate_resource(resource_id, resource_type)?;

        let grant = self
            .repo
            .upsert(actor_id, resource_id, resource_type, scope)
            .await?;
        self.invalidate_actor(actor_id, resource_type).await;

        tracing::info!(actor_id, resource_id, resource_type, ?scope, "Grant added");
        Ok(grant)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<bool, ScopeError> {
        require_positive("actor_id", actor_id)?;
        validate_resource(resource_id, resource_type)?;

        let removed = self
            .repo
            .soft_delete(actor_id, resource_id, resource_type)
            .await?;
        self.invalidate_actor(actor_id, resource_type).await;

        tracing::info!(actor_id, resource_id, resource_type, removed, "Grant removed");
        Ok(removed)
    }

    /// Replace the resource's grants with exactly `actors` at `scope`.
    /// Returns the actors that held a grant before.
    #[tracing::instrument(skip(self, actors))]
    pub async fn replace_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
        actors: impl IntoIterator<Item = ActorId> + Send,
        scope: GrantScope,
    ) -> Result<ActorSet, ScopeError> {
        validate_resource(resource_id, resource_type)?;
        let actors: ActorSet = actors.into_iter().collect();
        for actor_id in &actors {
            require_positive("actor_id", *actor_id)?;
        }

        let previous = self
            .repo
            .replace_for_resource(resource_id, resource_type, &actors, scope)
            .await?;

        let affected: ActorSet = previous.union(&actors).copied().collect();
        for actor_id in &affected {
            self.invalidate_actor(*actor_id, resource_type).await;
        }

        tracing::info!(
            resource_id,
            resource_type,
            previous = previous.len(),
            current = actors.len(),
            "Grants replaced for resource"
        );
        Ok(previous)
    }

    /// Revoke every grant on the resource. Returns how many were active.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_all_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<usize, ScopeError> {
        validate_resource(resource_id, resource_type)?;

        let previous = self
            .repo
            .revoke_all_for_resource(resource_id, resource_type)
            .await?;
        for actor_id in &previous {
            self.invalidate_actor(*actor_id, resource_type).await;
        }

        tracing::info!(resource_id, resource_type, revoked = previous.len(), "Grants revoked for resource");
        Ok(previous.len())
    }

    /// Resource ids of `resource_type` granted to the actor. Absent actors
    /// and non-positive types have no grants.
    #[tracing::instrument(skip(self))]
    pub async fn list_resource_ids_for_actor(
        &self,
        actor_id: ActorId,
        resource_type: ResourceType,
    ) -> Result<ResourceSet, ScopeError> {
        if actor_id <= 0 || resource_type <= 0 {
            return Ok(ResourceSet::new());
        }

        let key = Self::cache_key(actor_id, resource_type);
        if let Some(ids) = self.cache.get(&key).await {
            return Ok(ids);
        }

        let ids = self
            .repo
            .resource_ids_for_actor(actor_id, resource_type)
            .await?;
        tracing::debug!(actor_id, resource_type, count = ids.len(), "Loaded granted resource ids");
        self.cache.insert(&key, &ids).await;
        Ok(ids)
    }

    pub async fn list_actors_for_resource(
        &self,
        resource_id: ResourceId,
        resource_type: ResourceType,
    ) -> Result<ActorSet, ScopeError> {
        if resource_id <= 0 || resource_type <= 0 {
            return Ok(ActorSet::new());
        }
        self.repo
            .actors_for_resource(resource_id, resource_type)
            .await
    }

    /// Whether the actor holds an active grant of at least `min_scope`.
    pub async fn has_grant(
        &self,
        actor_id: ActorId,
        resource_id: ResourceId,
        resource_type: ResourceType,
        min_scope: GrantScope,
    ) -> Result<bool, ScopeError> {
        if actor_id <= 0 || resource_id <= 0 || resource_type <= 0 {
            return Ok(false);
        }
        let grant = self
            .repo
            .find_active(actor_id, resource_id, resource_type)
            .await?;
        Ok(grant.is_some_and(|g| g.satisfies(min_scope)))
    }

    pub async fn invalidate_actor(&self, actor_id: ActorId, resource_type: ResourceType) {
        self.cache
            .invalidate(&Self::cache_key(actor_id, resource_type))
            .await;
    }

    /// Drop every process-local entry of this store.
    pub fn clear_cache(&self) {
        self.cache.clear_local();
    }
}
