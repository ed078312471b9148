//! Org-unit subtree resolution over materialized paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::cache::TieredCache;
use crate::context::SecurityContext;
use crate::error::ScopeError;
use crate::models::org_unit::{child_path, path_depth, path_ids, rebase_path, root_path, STATUS_ENABLED};
use crate::models::{NewOrgUnit, OrgUnit, TenantId, UnitId, UnitSet};

/// Result of relocating a unit and its subtree.
#[derive(Debug, Clone)]
pub struct UnitMove {
    /// The unit after the move.
    pub unit: OrgUnit,
    pub old_path: String,
    /// Rows rewritten, the moved unit included.
    pub rows_rebased: u64,
}

#[async_trait]
pub trait OrgUnitRepository: Send + Sync {
    async fn find_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
    ) -> Result<Option<OrgUnit>, ScopeError>;

    /// Ids of every unit of the tenant whose path starts with `path`.
    async fn find_subtree_ids(&self, tenant_id: TenantId, path: &str)
        -> Result<UnitSet, ScopeError>;

    async fn create_unit(&self, new_unit: &NewOrgUnit) -> Result<OrgUnit, ScopeError>;

    /// Re-parent a unit, rewriting path and depth of the whole subtree
    /// atomically. `new_parent_id == 0` makes it a root.
    async fn move_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
        new_parent_id: UnitId,
    ) -> Result<UnitMove, ScopeError>;
}

fn unit_not_found(tenant_id: TenantId, unit_id: UnitId) -> ScopeError {
    ScopeError::InvalidMove(format!(
        "Unit {} not found in tenant {}",
        unit_id, tenant_id
    ))
}

fn check_not_cycle(unit: &OrgUnit, parent: &OrgUnit) -> Result<(), ScopeError> {
    if unit.contains(&parent.path) {
        return Err(ScopeError::InvalidMove(format!(
            "Unit {} cannot move below its own descendant {}",
            unit.unit_id, parent.unit_id
        )));
    }
    Ok(())
}

/// Serialize placement changes within one tenant's tree until the
/// transaction ends. Cycle checks and parent paths read under this lock
/// cannot be invalidated by a concurrent move.
async fn lock_tenant_tree(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tenant_id: TenantId,
) -> Result<(), ScopeError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(tenant_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// PostgreSQL-backed org units.
#[derive(Clone)]
pub struct PgOrgUnitRepository {
    pool: PgPool,
}

impl PgOrgUnitRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrgUnitRepository for PgOrgUnitRepository {
    async fn find_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
    ) -> Result<Option<OrgUnit>, ScopeError> {
        let unit = sqlx::query_as::<_, OrgUnit>(
            "SELECT * FROM org_units WHERE tenant_id = $1 AND unit_id = $2",
        )
        .bind(tenant_id)
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(unit)
    }

    async fn find_subtree_ids(
        &self,
        tenant_id: TenantId,
        path: &str,
    ) -> Result<UnitSet, ScopeError> {
        let rows: Vec<(UnitId,)> = sqlx::query_as(
            "SELECT unit_id FROM org_units WHERE tenant_id = $1 AND path LIKE $2 || '%'",
        )
        .bind(tenant_id)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create_unit(&self, new_unit: &NewOrgUnit) -> Result<OrgUnit, ScopeError> {
        let mut tx = self.pool.begin().await?;
        lock_tenant_tree(&mut tx, new_unit.tenant_id).await?;

        let parent_path = if new_unit.parent_id == 0 {
            None
        } else {
            let parent = sqlx::query_as::<_, OrgUnit>(
                "SELECT * FROM org_units WHERE tenant_id = $1 AND unit_id = $2",
            )
            .bind(new_unit.tenant_id)
            .bind(new_unit.parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| unit_not_found(new_unit.tenant_id, new_unit.parent_id))?;
            Some(parent.path)
        };

        // The path embeds the generated id, so insert first and fill it in after.
        let (unit_id,): (UnitId,) = sqlx::query_as(
            r#"
            INSERT INTO org_units (tenant_id, parent_id, path, depth, display_order, member_count, status_code, created_utc)
            VALUES ($1, $2, '', 0, $3, 0, $4, $5)
            RETURNING unit_id
            "#,
        )
        .bind(new_unit.tenant_id)
        .bind(new_unit.parent_id)
        .bind(new_unit.display_order)
        .bind(STATUS_ENABLED)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let path = match parent_path {
            Some(parent_path) => child_path(&parent_path, unit_id),
            None => root_path(unit_id),
        };

        let unit = sqlx::query_as::<_, OrgUnit>(
            "UPDATE org_units SET path = $2, depth = $3 WHERE unit_id = $1 RETURNING *",
        )
        .bind(unit_id)
        .bind(&path)
        .bind(path_depth(&path))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(unit)
    }

    async fn move_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
        new_parent_id: UnitId,
    ) -> Result<UnitMove, ScopeError> {
        let mut tx = self.pool.begin().await?;
        lock_tenant_tree(&mut tx, tenant_id).await?;

        let unit = sqlx::query_as::<_, OrgUnit>(
            "SELECT * FROM org_units WHERE tenant_id = $1 AND unit_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| unit_not_found(tenant_id, unit_id))?;

        let new_path = if new_parent_id == 0 {
            root_path(unit_id)
        } else {
            let parent = sqlx::query_as::<_, OrgUnit>(
                "SELECT * FROM org_units WHERE tenant_id = $1 AND unit_id = $2",
            )
            .bind(tenant_id)
            .bind(new_parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| unit_not_found(tenant_id, new_parent_id))?;
            check_not_cycle(&unit, &parent)?;
            child_path(&parent.path, unit_id)
        };
        let depth_delta = path_depth(&new_path) - unit.depth;

        let rebased = sqlx::query(
            r#"
            UPDATE org_units
            SET path = $3 || substr(path, char_length($2) + 1), depth = depth + $4
            WHERE tenant_id = $1 AND path LIKE $2 || '%'
            "#,
        )
        .bind(tenant_id)
        .bind(&unit.path)
        .bind(&new_path)
        .bind(depth_delta)
        .execute(&mut *tx)
        .await?;

        let moved = sqlx::query_as::<_, OrgUnit>(
            "UPDATE org_units SET parent_id = $3 WHERE tenant_id = $1 AND unit_id = $2 RETURNING *",
        )
        .bind(tenant_id)
        .bind(unit_id)
        .bind(new_parent_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UnitMove {
            unit: moved,
            old_path: unit.path,
            rows_rebased: rebased.rows_affected(),
        })
    }
}

#[derive(Default)]
struct UnitTable {
    units: BTreeMap<UnitId, OrgUnit>,
    last_id: UnitId,
}

/// In-memory org units. Every write happens under one lock, so a failed
/// write never leaves partial state.
#[derive(Default)]
pub struct InMemoryOrgUnitRepository {
    table: Mutex<UnitTable>,
    fail_writes: AtomicBool,
    subtree_reads: AtomicUsize,
}

impl InMemoryOrgUnitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of subtree lookups that reached this store.
    pub fn subtree_reads(&self) -> usize {
        self.subtree_reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, UnitTable>, ScopeError> {
        self.table
            .lock()
            .map_err(|e| ScopeError::StoreUnavailable(format!("Org unit store poisoned: {}", e)))
    }

    fn check_writable(&self) -> Result<(), ScopeError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ScopeError::StoreUnavailable(
                "Org unit store rejected the write".to_string(),
            ));
        }
        Ok(())
    }
}

fn find_in(table: &UnitTable, tenant_id: TenantId, unit_id: UnitId) -> Option<&OrgUnit> {
    table
        .units
        .get(&unit_id)
        .filter(|u| u.tenant_id == tenant_id)
}

#[async_trait]
impl OrgUnitRepository for InMemoryOrgUnitRepository {
    async fn find_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
    ) -> Result<Option<OrgUnit>, ScopeError> {
        let table = self.lock()?;
        Ok(find_in(&table, tenant_id, unit_id).cloned())
    }

    async fn find_subtree_ids(
        &self,
        tenant_id: TenantId,
        path: &str,
    ) -> Result<UnitSet, ScopeError> {
        self.subtree_reads.fetch_add(1, Ordering::SeqCst);
        let table = self.lock()?;
        Ok(table
            .units
            .values()
            .filter(|u| u.tenant_id == tenant_id && u.path.starts_with(path))
            .map(|u| u.unit_id)
            .collect())
    }

    async fn create_unit(&self, new_unit: &NewOrgUnit) -> Result<OrgUnit, ScopeError> {
        let mut table = self.lock()?;
        self.check_writable()?;

        let path_prefix = if new_unit.parent_id == 0 {
            None
        } else {
            let parent = find_in(&table, new_unit.tenant_id, new_unit.parent_id)
                .ok_or_else(|| unit_not_found(new_unit.tenant_id, new_unit.parent_id))?;
            Some(parent.path.clone())
        };

        let unit_id = table.last_id + 1;
        let path = match path_prefix {
            Some(parent_path) => child_path(&parent_path, unit_id),
            None => root_path(unit_id),
        };
        let unit = OrgUnit {
            unit_id,
            tenant_id: new_unit.tenant_id,
            parent_id: new_unit.parent_id,
            depth: path_depth(&path),
            path,
            display_order: new_unit.display_order,
            member_count: 0,
            status_code: STATUS_ENABLED,
            created_utc: Utc::now(),
        };
        table.last_id = unit_id;
        table.units.insert(unit_id, unit.clone());
        Ok(unit)
    }

    async fn move_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
        new_parent_id: UnitId,
    ) -> Result<UnitMove, ScopeError> {
        let mut table = self.lock()?;
        self.check_writable()?;

        let unit = find_in(&table, tenant_id, unit_id)
            .cloned()
            .ok_or_else(|| unit_not_found(tenant_id, unit_id))?;

        let new_path = if new_parent_id == 0 {
            root_path(unit_id)
        } else {
            let parent = find_in(&table, tenant_id, new_parent_id)
                .ok_or_else(|| unit_not_found(tenant_id, new_parent_id))?;
            check_not_cycle(&unit, parent)?;
            child_path(&parent.path, unit_id)
        };
        let depth_delta = path_depth(&new_path) - unit.depth;

        let mut rows_rebased = 0;
        for u in table.units.values_mut() {
            if u.tenant_id == tenant_id && u.path.starts_with(&unit.path) {
                u.path = rebase_path(&u.path, &unit.path, &new_path);
                u.depth += depth_delta;
                rows_rebased += 1;
            }
        }

        let moved = table
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| unit_not_found(tenant_id, unit_id))?;
        moved.parent_id = new_parent_id;

        Ok(UnitMove {
            unit: moved.clone(),
            old_path: unit.path,
            rows_rebased,
        })
    }
}

/// Resolves a unit to itself or its whole subtree, tenant-scoped and cached.
///
/// Lookups go through the request memo of the [`SecurityContext`] (when
/// resolving for a context), then the process-local tier, then the
/// distributed tier, and only then the store.
pub struct OrgUnitHierarchy {
    repo: Arc<dyn OrgUnitRepository>,
    cache: TieredCache<UnitSet>,
}

impl OrgUnitHierarchy {
    pub fn new(repo: Arc<dyn OrgUnitRepository>) -> Self {
        Self::with_cache(repo, TieredCache::new("scope:units"))
    }

    pub fn with_cache(repo: Arc<dyn OrgUnitRepository>, cache: TieredCache<UnitSet>) -> Self {
        Self { repo, cache }
    }

    pub fn cache(&self) -> &TieredCache<UnitSet> {
        &self.cache
    }

    pub fn cache_key(tenant_id: TenantId, unit_id: UnitId) -> String {
        format!("{}:{}", tenant_id, unit_id)
    }

    /// `{unit}` alone, or the unit plus every descendant in the same tenant.
    /// Unit `0` and units not found in the tenant resolve to the empty set.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_accessible_units(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
        include_subtree: bool,
    ) -> Result<UnitSet, ScopeError> {
        if unit_id <= 0 {
            return Ok(UnitSet::new());
        }
        if !include_subtree {
            return Ok(UnitSet::from([unit_id]));
        }

        let key = Self::cache_key(tenant_id, unit_id);
        if let Some(units) = self.cache.get(&key).await {
            return Ok(units);
        }

        let Some(unit) = self.repo.find_unit(tenant_id, unit_id).await? else {
            tracing::debug!(tenant_id, unit_id, "Unit not found in tenant");
            return Ok(UnitSet::new());
        };

        let mut units = self.repo.find_subtree_ids(tenant_id, &unit.path).await?;
        units.insert(unit_id);
        tracing::debug!(tenant_id, unit_id, count = units.len(), "Resolved unit subtree");

        self.cache.insert(&key, &units).await;
        Ok(units)
    }

    /// Units visible to the context's actor: the primary unit and every
    /// additional unit, each resolved the same way. Memoized on the context.
    pub async fn resolve_for_context(
        &self,
        ctx: &SecurityContext,
        include_subtree: bool,
    ) -> Result<UnitSet, ScopeError> {
        if let Some(units) = ctx.cached_units(include_subtree) {
            return Ok(units);
        }

        let tenant_id = ctx.tenant_id();
        let mut units = self
            .resolve_accessible_units(tenant_id, ctx.unit_id(), include_subtree)
            .await?;
        for extra in ctx.additional_unit_ids() {
            units.extend(
                self.resolve_accessible_units(tenant_id, *extra, include_subtree)
                    .await?,
            );
        }

        ctx.remember_units(include_subtree, &units);
        Ok(units)
    }

    pub async fn find_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
    ) -> Result<Option<OrgUnit>, ScopeError> {
        self.repo.find_unit(tenant_id, unit_id).await
    }

    /// Create a unit. Every ancestor's cached subtree grows, so each is invalidated.
    #[tracing::instrument(skip(self))]
    pub async fn create_unit(&self, new_unit: &NewOrgUnit) -> Result<OrgUnit, ScopeError> {
        let unit = self.repo.create_unit(new_unit).await?;
        for ancestor in unit.ancestor_ids() {
            self.invalidate(unit.tenant_id, ancestor).await;
        }
        tracing::info!(
            tenant_id = unit.tenant_id,
            unit_id = unit.unit_id,
            path = %unit.path,
            "Created org unit"
        );
        Ok(unit)
    }

    /// Move a unit (with its subtree) below `new_parent_id`, or to the root
    /// level when it is `0`. Cached subtrees of every unit on the old and the
    /// new ancestor chain are invalidated once the move is committed.
    #[tracing::instrument(skip(self))]
    pub async fn move_unit(
        &self,
        tenant_id: TenantId,
        unit_id: UnitId,
        new_parent_id: UnitId,
    ) -> Result<OrgUnit, ScopeError> {
        let moved = self.repo.move_unit(tenant_id, unit_id, new_parent_id).await?;

        let affected: UnitSet = path_ids(&moved.old_path)
            .into_iter()
            .chain(path_ids(&moved.unit.path))
            .collect();
        for affected_unit in &affected {
            self.invalidate(tenant_id, *affected_unit).await;
        }

        tracing::info!(
            tenant_id,
            unit_id,
            new_parent_id,
            old_path = %moved.old_path,
            new_path = %moved.unit.path,
            rows = moved.rows_rebased,
            "Moved org unit"
        );
        Ok(moved.unit)
    }

    pub async fn invalidate(&self, tenant_id: TenantId, unit_id: UnitId) {
        self.cache
            .invalidate(&Self::cache_key(tenant_id, unit_id))
            .await;
    }

    /// Drop every process-local entry of this hierarchy.
    pub fn clear_cache(&self) {
        self.cache.clear_local();
    }
}
