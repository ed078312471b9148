//! Grant model - ad hoc per-resource access supplementing tier visibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{ActorId, ResourceId, ResourceType};

/// Access level carried by a grant. Ordered, so `Owner` satisfies an `Edit`
/// requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GrantScope {
    View,
    Edit,
    Owner,
}

impl GrantScope {
    pub fn code(&self) -> i16 {
        match self {
            GrantScope::View => 1,
            GrantScope::Edit => 2,
            GrantScope::Owner => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(GrantScope::View),
            2 => Some(GrantScope::Edit),
            3 => Some(GrantScope::Owner),
            _ => None,
        }
    }
}

/// Grant row. Unique per `(actor_id, resource_id, resource_type)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Grant {
    pub grant_id: i64,
    pub actor_id: ActorId,
    pub resource_id: ResourceId,
    pub resource_type: ResourceType,
    pub scope_level: i16,
    pub enabled_flag: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Grant {
    /// Only enabled, non-deleted grants count for visibility.
    pub fn is_active(&self) -> bool {
        self.enabled_flag && self.deleted_utc.is_none()
    }

    pub fn scope(&self) -> Option<GrantScope> {
        GrantScope::from_code(self.scope_level)
    }

    pub fn satisfies(&self, min_scope: GrantScope) -> bool {
        self.is_active() && self.scope().is_some_and(|s| s >= min_scope)
    }
}
