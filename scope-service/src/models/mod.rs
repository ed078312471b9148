//! Domain models for tenant-scoped visibility.

use std::collections::BTreeSet;

pub mod actor;
pub mod grant;
pub mod org_unit;
pub mod role;

pub use actor::Actor;
pub use grant::{Grant, GrantScope};
pub use org_unit::{NewOrgUnit, OrgUnit};
pub use role::{Role, VisibilityTier};

pub type TenantId = i64;
pub type ActorId = i64;
pub type UnitId = i64;
pub type ResourceId = i64;
pub type RoleId = i64;
/// Caller-defined namespace distinguishing resource families for grants.
pub type ResourceType = i32;

pub type UnitSet = BTreeSet<UnitId>;
pub type ResourceSet = BTreeSet<ResourceId>;
pub type ActorSet = BTreeSet<ActorId>;
