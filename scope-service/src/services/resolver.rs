//! Visibility predicate construction.
//!
//! For every query against a tenant-scoped entity the resolver ANDs, in
//! order:
//!
//! 1. the tenant clause, whenever the entity has a tenant column, admins
//!    included;
//! 2. for non-admins, the tier predicate (owner, unit or multi-unit
//!    membership), ORed with the entity's grant clause below the `ALL` tier.
//!
//! Descriptor columns a tier needs but the entity lacks turn that leg into a
//! constant-false clause. This fails closed, but a misdeclared descriptor can
//! silently hide rows; a warning is logged whenever it happens.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::grants::GrantStore;
use super::org_units::OrgUnitHierarchy;
use crate::context::SecurityContext;
use crate::descriptor::ScopableEntityDescriptor;
use crate::error::ScopeError;
use crate::models::{GrantScope, ResourceId, VisibilityTier};
use crate::predicate::{Predicate, ScopedQuery};

/// Treatment of contexts without a tenant or an actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnonymousAccess {
    /// Match nothing.
    #[default]
    Deny,
    /// Apply no filter at all. Only for deployments where every unscoped
    /// caller is trusted.
    Unfiltered,
}

impl std::str::FromStr for AnonymousAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deny" => Ok(AnonymousAccess::Deny),
            "unfiltered" => Ok(AnonymousAccess::Unfiltered),
            _ => Err(format!("Invalid anonymous access mode: {}", s)),
        }
    }
}

/// Column values a newly created row must carry, keyed by column name.
pub type CreationValues = BTreeMap<String, i64>;

pub struct ScopeResolver {
    units: Arc<OrgUnitHierarchy>,
    grants: Arc<GrantStore>,
    anonymous_access: AnonymousAccess,
}

impl ScopeResolver {
    pub fn new(units: Arc<OrgUnitHierarchy>, grants: Arc<GrantStore>) -> Self {
        Self {
            units,
            grants,
            anonymous_access: AnonymousAccess::default(),
        }
    }

    pub fn with_anonymous_access(mut self, anonymous_access: AnonymousAccess) -> Self {
        self.anonymous_access = anonymous_access;
        self
    }

    pub fn units(&self) -> &OrgUnitHierarchy {
        &self.units
    }

    pub fn grants(&self) -> &GrantStore {
        &self.grants
    }

    /// AND the visibility clauses for `ctx` onto `query`.
    pub async fn apply(
        &self,
        query: ScopedQuery,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
    ) -> Result<ScopedQuery, ScopeError> {
        let clauses = self.visibility_clauses(descriptor, ctx).await?;
        Ok(clauses.into_iter().fold(query, ScopedQuery::filter))
    }

    /// The clauses [`apply`](Self::apply) would add, tenant clause first.
    /// Empty means unfiltered.
    #[tracing::instrument(
        skip(self, descriptor, ctx),
        fields(
            table = descriptor.table(),
            tenant_id = ctx.tenant_id(),
            actor_id = ctx.actor_id()
        )
    )]
    pub async fn visibility_clauses(
        &self,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
    ) -> Result<Vec<Predicate>, ScopeError> {
        if ctx.is_scope_disabled() || ctx.is_system() {
            tracing::debug!("Scope filtering bypassed");
            return Ok(Vec::new());
        }

        if !ctx.is_authenticated() {
            return Ok(match self.anonymous_access {
                AnonymousAccess::Deny => {
                    tracing::warn!("Query without an authenticated context denied");
                    vec![Predicate::False]
                }
                AnonymousAccess::Unfiltered => Vec::new(),
            });
        }

        let mut clauses = Vec::new();
        if let Some(column) = descriptor.tenant_column() {
            clauses.push(Predicate::eq(column, ctx.tenant_id()));
        }

        if ctx.is_admin() {
            return Ok(clauses);
        }

        let tier = ctx.effective_tier();
        let tier_predicate = self.tier_predicate(descriptor, ctx, tier).await?;

        let visibility = match descriptor.grant_participation() {
            Some(grants) if tier != VisibilityTier::All => {
                let granted = self
                    .grants
                    .list_resource_ids_for_actor(ctx.actor_id(), grants.resource_type)
                    .await?;
                Predicate::or([
                    tier_predicate,
                    Predicate::in_set(grants.resource_id_column.as_str(), granted),
                ])
            }
            _ => tier_predicate,
        };

        tracing::debug!(%tier, predicate = %visibility, "Resolved visibility predicate");
        if !visibility.is_true() {
            clauses.push(visibility);
        }
        Ok(clauses)
    }

    async fn tier_predicate(
        &self,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
        tier: VisibilityTier,
    ) -> Result<Predicate, ScopeError> {
        let owner = descriptor
            .owner_column()
            .map(|column| Predicate::eq(column, ctx.actor_id()));

        match tier {
            VisibilityTier::All => Ok(Predicate::True),
            VisibilityTier::SelfOnly => Ok(owner.unwrap_or_else(|| {
                missing_columns(descriptor, tier);
                Predicate::False
            })),
            VisibilityTier::Unit | VisibilityTier::UnitSubtree => {
                let include_subtree = tier == VisibilityTier::UnitSubtree;
                let units = self.units.resolve_for_context(ctx, include_subtree).await?;

                if units.is_empty() {
                    return Ok(owner.unwrap_or_else(|| {
                        missing_columns(descriptor, tier);
                        Predicate::False
                    }));
                }
                if !descriptor.has_unit_columns() {
                    missing_columns(descriptor, tier);
                    return Ok(owner.unwrap_or(Predicate::False));
                }

                let unit = descriptor
                    .unit_column()
                    .map(|column| Predicate::in_set(column, units.iter().copied()));
                let multi_unit = descriptor
                    .multi_unit_column()
                    .map(|column| Predicate::json_contains_any(column, units.iter().copied()));
                Ok(Predicate::or(
                    [owner, unit, multi_unit].into_iter().flatten(),
                ))
            }
        }
    }

    /// Scoping values a new row must be stamped with: tenant, owner and
    /// primary unit, for whichever of those columns the entity declares.
    pub fn creation_values(
        &self,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
    ) -> Result<CreationValues, ScopeError> {
        let mut values = CreationValues::new();

        if let Some(column) = descriptor.tenant_column() {
            if ctx.tenant_id() <= 0 {
                return Err(ScopeError::MissingContext(format!(
                    "Rows of {} require a tenant",
                    descriptor.table()
                )));
            }
            values.insert(column.to_string(), ctx.tenant_id());
        }
        if let Some(column) = descriptor.owner_column() {
            if ctx.actor_id() > 0 {
                values.insert(column.to_string(), ctx.actor_id());
            }
        }
        if let Some(column) = descriptor.unit_column() {
            if ctx.unit_id() > 0 {
                values.insert(column.to_string(), ctx.unit_id());
            }
        }
        Ok(values)
    }

    /// Record an OWNER grant for the creating actor, when the entity opts in.
    /// Returns whether a grant was written.
    pub async fn register_creator(
        &self,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
        resource_id: ResourceId,
    ) -> Result<bool, ScopeError> {
        let Some(grants) = descriptor.grant_participation() else {
            return Ok(false);
        };
        if !descriptor.registers_creator() || !ctx.is_authenticated() {
            return Ok(false);
        }
        self.grants
            .add(
                ctx.actor_id(),
                resource_id,
                grants.resource_type,
                GrantScope::Owner,
            )
            .await?;
        Ok(true)
    }

    /// Whether the context may act on one resource with at least `min_scope`.
    pub async fn can_access_resource(
        &self,
        descriptor: &ScopableEntityDescriptor,
        ctx: &SecurityContext,
        resource_id: ResourceId,
        min_scope: GrantScope,
    ) -> Result<bool, ScopeError> {
        if ctx.is_scope_disabled() || ctx.is_system() {
            return Ok(true);
        }
        if !ctx.is_authenticated() {
            return Ok(self.anonymous_access == AnonymousAccess::Unfiltered);
        }
        if ctx.is_admin() {
            return Ok(true);
        }
        let Some(grants) = descriptor.grant_participation() else {
            return Ok(false);
        };
        self.grants
            .has_grant(ctx.actor_id(), resource_id, grants.resource_type, min_scope)
            .await
    }
}

fn missing_columns(descriptor: &ScopableEntityDescriptor, tier: VisibilityTier) {
    tracing::warn!(
        table = descriptor.table(),
        %tier,
        "Entity lacks columns this tier filters on; the missing leg matches no rows"
    );
}
