//! Actor identity as handed over by the authentication layer.

use serde::{Deserialize, Serialize};

use super::{ActorId, TenantId, UnitId, UnitSet};

/// An authenticated actor. Inserted into request extensions by the
/// authentication layer; this crate never authenticates anyone itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: ActorId,
    pub tenant_id: TenantId,
    pub unit_id: UnitId,
    /// Secondary units (multi-membership), excluding the primary unit.
    #[serde(default)]
    pub additional_unit_ids: UnitSet,
    #[serde(default)]
    pub is_admin: bool,
}

impl Actor {
    pub fn new(tenant_id: TenantId, actor_id: ActorId, unit_id: UnitId) -> Self {
        Self {
            actor_id,
            tenant_id,
            unit_id,
            additional_unit_ids: UnitSet::new(),
            is_admin: false,
        }
    }

    pub fn with_additional_units(mut self, units: impl IntoIterator<Item = UnitId>) -> Self {
        self.additional_unit_ids = units
            .into_iter()
            .filter(|u| *u > 0 && *u != self.unit_id)
            .collect();
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}
