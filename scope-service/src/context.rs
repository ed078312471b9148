//! Request-scoped security context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::models::{Actor, ActorId, TenantId, UnitId, UnitSet, VisibilityTier};

struct UnitMemo {
    include_subtree: bool,
    units: UnitSet,
}

/// Identity and visibility of the actor behind one logical request.
///
/// Built once when the request starts and dropped (or [`end`](Self::end)ed)
/// when it finishes. Carried as `Arc<SecurityContext>` within a request and
/// never shared between requests, so it deliberately does not implement
/// `Clone`.
pub struct SecurityContext {
    tenant_id: TenantId,
    actor_id: ActorId,
    unit_id: UnitId,
    additional_unit_ids: UnitSet,
    tier: Option<VisibilityTier>,
    is_admin: bool,
    is_system: bool,
    /// Number of live [`ScopeSuppression`] guards.
    suppression_depth: AtomicUsize,
    unit_memo: Mutex<Option<UnitMemo>>,
}

impl SecurityContext {
    pub fn begin(
        tenant_id: TenantId,
        actor_id: ActorId,
        unit_id: UnitId,
        tier: Option<VisibilityTier>,
        is_admin: bool,
    ) -> Self {
        Self {
            tenant_id,
            actor_id,
            unit_id,
            additional_unit_ids: UnitSet::new(),
            tier,
            is_admin,
            is_system: false,
            suppression_depth: AtomicUsize::new(0),
            unit_memo: Mutex::new(None),
        }
    }

    /// Context for an authenticated actor, including secondary units.
    pub fn for_actor(actor: &Actor, tier: Option<VisibilityTier>) -> Self {
        Self::begin(
            actor.tenant_id,
            actor.actor_id,
            actor.unit_id,
            tier,
            actor.is_admin,
        )
        .with_additional_units(actor.additional_unit_ids.iter().copied())
    }

    /// Internal caller with unrestricted visibility. The only way to get an
    /// unfiltered query without an authenticated actor.
    pub fn system() -> Self {
        let mut ctx = Self::begin(0, 0, 0, None, false);
        ctx.is_system = true;
        ctx
    }

    pub fn with_additional_units(mut self, units: impl IntoIterator<Item = UnitId>) -> Self {
        let primary = self.unit_id;
        self.additional_unit_ids = units
            .into_iter()
            .filter(|u| *u > 0 && *u != primary)
            .collect();
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn additional_unit_ids(&self) -> &UnitSet {
        &self.additional_unit_ids
    }

    pub fn tier(&self) -> Option<VisibilityTier> {
        self.tier
    }

    /// Tier used for filtering; `SELF` when none was resolved.
    pub fn effective_tier(&self) -> VisibilityTier {
        self.tier.unwrap_or_default()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    /// Both a tenant and an actor are known.
    pub fn is_authenticated(&self) -> bool {
        self.tenant_id != 0 && self.actor_id != 0
    }

    pub fn is_scope_disabled(&self) -> bool {
        self.suppression_depth.load(Ordering::SeqCst) > 0
    }

    /// Run `f` with scope filtering suppressed. The previous state is restored
    /// when `f` returns or unwinds.
    pub fn with_scope_disabled<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.suppress_scope();
        f()
    }

    /// Suppress scope filtering until the returned guard is dropped. Suitable
    /// for async code where a closure cannot span the awaited work.
    ///
    /// Guards nest and may be dropped in any order: filtering resumes once the
    /// last live guard is gone.
    pub fn suppress_scope(&self) -> ScopeSuppression<'_> {
        self.suppression_depth.fetch_add(1, Ordering::SeqCst);
        ScopeSuppression { ctx: self }
    }

    /// Memoized accessible units, if computed for the same subtree flag.
    pub fn cached_units(&self, include_subtree: bool) -> Option<UnitSet> {
        let memo = self.unit_memo.lock().ok()?;
        memo.as_ref()
            .filter(|m| m.include_subtree == include_subtree)
            .map(|m| m.units.clone())
    }

    pub fn remember_units(&self, include_subtree: bool, units: &UnitSet) {
        if let Ok(mut memo) = self.unit_memo.lock() {
            *memo = Some(UnitMemo {
                include_subtree,
                units: units.clone(),
            });
        }
    }

    /// Finish the request. Consuming the context discards the memo with it.
    pub fn end(self) {
        tracing::debug!(
            tenant_id = self.tenant_id,
            actor_id = self.actor_id,
            "Security context ended"
        );
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("tenant_id", &self.tenant_id)
            .field("actor_id", &self.actor_id)
            .field("unit_id", &self.unit_id)
            .field("additional_unit_ids", &self.additional_unit_ids)
            .field("tier", &self.tier)
            .field("is_admin", &self.is_admin)
            .field("is_system", &self.is_system)
            .field("scope_disabled", &self.is_scope_disabled())
            .finish()
    }
}

/// Holds scope filtering of a [`SecurityContext`] off while alive.
#[must_use = "scope filtering is restored as soon as the guard is dropped"]
pub struct ScopeSuppression<'a> {
    ctx: &'a SecurityContext,
}

impl Drop for ScopeSuppression<'_> {
    fn drop(&mut self) {
        self.ctx.suppression_depth.fetch_sub(1, Ordering::SeqCst);
    }
}
