//! Role model - tenant-scoped roles carrying a visibility tier.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{RoleId, TenantId};

/// Coarse row-visibility tier granted by a role.
///
/// Ordered from narrowest to widest, so the effective tier of an actor is the
/// maximum over their enabled roles.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisibilityTier {
    /// Only rows owned by the actor.
    #[default]
    #[serde(rename = "SELF")]
    SelfOnly,
    /// Rows of the actor's own unit.
    Unit,
    /// Rows of the actor's unit and every unit below it.
    UnitSubtree,
    /// Every row of the tenant.
    All,
}

impl VisibilityTier {
    pub fn code(&self) -> i16 {
        match self {
            VisibilityTier::SelfOnly => 1,
            VisibilityTier::Unit => 2,
            VisibilityTier::UnitSubtree => 3,
            VisibilityTier::All => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(VisibilityTier::SelfOnly),
            2 => Some(VisibilityTier::Unit),
            3 => Some(VisibilityTier::UnitSubtree),
            4 => Some(VisibilityTier::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityTier::SelfOnly => "SELF",
            VisibilityTier::Unit => "UNIT",
            VisibilityTier::UnitSubtree => "UNIT_SUBTREE",
            VisibilityTier::All => "ALL",
        }
    }
}

impl std::fmt::Display for VisibilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role entity (tenant-scoped).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: RoleId,
    pub tenant_id: TenantId,
    pub role_label: String,
    pub visibility_tier: i16,
    pub enabled_flag: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_order_from_narrowest_to_widest() {
        assert!(VisibilityTier::SelfOnly < VisibilityTier::Unit);
        assert!(VisibilityTier::Unit < VisibilityTier::UnitSubtree);
        assert!(VisibilityTier::UnitSubtree < VisibilityTier::All);
    }

    #[test]
    fn code_round_trips_and_rejects_unknown() {
        for tier in [
            VisibilityTier::SelfOnly,
            VisibilityTier::Unit,
            VisibilityTier::UnitSubtree,
            VisibilityTier::All,
        ] {
            assert_eq!(VisibilityTier::from_code(tier.code()), Some(tier));
        }
        assert_eq!(VisibilityTier::from_code(0), None);
        assert_eq!(VisibilityTier::from_code(9), None);
    }

    #[test]
    fn serializes_self_tier_by_its_wire_name() {
        let json = serde_json::to_string(&VisibilityTier::SelfOnly).unwrap();
        assert_eq!(json, "\"SELF\"");
        let tier: VisibilityTier = serde_json::from_str("\"UNIT_SUBTREE\"").unwrap();
        assert_eq!(tier, VisibilityTier::UnitSubtree);
    }
}
